//! Destination warehouse access: schema bootstrap, batched appends, watermark
//! bookkeeping, aggregate tables, table backups and SQL script execution.

mod backup;
mod postgres;
mod schema;
mod script;

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use stockwise_core::{
    BalanceDelta, BalanceRow, ConsumptionRow, MaterialAttributes, MovementRow, StockMasterRow,
    StreamKind, SyncState, Table, VariantMapping, VariantRow,
};
use thiserror::Error;

pub use backup::{BackupArtifact, BackupReader, BackupStore, BackupWriter};
pub use postgres::{DestinationConfig, PgDestination};
pub use schema::{bootstrap_statements, validate_identifier};
pub use script::{split_statements, SqlScript, SqlStatement, StatementMode};

pub const CRATE_NAME: &str = "stockwise-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("destination unreachable after {attempts} attempt(s): {message}")]
    ConnectExhausted { attempts: usize, message: String },
    #[error("invalid SQL identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("table {0} cannot be backed up")]
    NotBackupable(&'static str),
    #[error("backup {path} is corrupt: expected sha256 {expected}, read {actual}")]
    BackupChecksum {
        path: String,
        expected: String,
        actual: String,
    },
}

/// Rows for one committed append.
#[derive(Debug, Clone, PartialEq)]
pub enum RowBatch {
    Consumption(Vec<ConsumptionRow>),
    Movements(Vec<MovementRow>),
    OpenOrders(Vec<MovementRow>),
    StockMaster(Vec<StockMasterRow>),
}

impl RowBatch {
    pub fn table(&self) -> Table {
        match self {
            RowBatch::Consumption(_) => Table::BomConsumption,
            RowBatch::Movements(_) => Table::StockMovements,
            RowBatch::OpenOrders(_) => Table::OpenOrderMovements,
            RowBatch::StockMaster(_) => Table::StockMaster,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RowBatch::Consumption(rows) => rows.len(),
            RowBatch::Movements(rows) | RowBatch::OpenOrders(rows) => rows.len(),
            RowBatch::StockMaster(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything the sync engine needs from the analytical warehouse.
///
/// Each mutating call commits before returning, so a crash loses at most the call in
/// flight.
#[async_trait]
pub trait Destination: Send {
    async fn ping(&mut self) -> Result<()>;

    /// Idempotently creates schemas, tables, indexes and seed rows.
    async fn ensure_schema(&mut self) -> Result<()>;

    async fn table_exists(&mut self, table: Table) -> Result<bool>;

    async fn has_rows(&mut self, table: Table) -> Result<bool>;

    async fn truncate(&mut self, table: Table) -> Result<()>;

    /// Appends and commits one batch; returns the number of rows written.
    async fn append(&mut self, batch: RowBatch) -> Result<u64>;

    /// Highest key stored for a history stream, zero when empty.
    async fn max_key(&mut self, stream: StreamKind) -> Result<i64>;

    /// Highest key above `after`, optionally ignoring seat-warehouse rows.
    async fn max_key_after(
        &mut self,
        stream: StreamKind,
        after: i64,
        exclude_seat: bool,
    ) -> Result<Option<i64>>;

    async fn watermark(&mut self, name: &str) -> Result<Option<SyncState>>;

    /// Raises the watermark to `value` unless it is already higher.
    async fn advance_watermark(&mut self, name: &str, value: i64) -> Result<SyncState>;

    /// Overwrites the watermark, also downwards. Reserved for full reloads and rebuilds.
    async fn reset_watermark(&mut self, name: &str, value: i64) -> Result<SyncState>;

    async fn watermarks(&mut self) -> Result<Vec<SyncState>>;

    async fn seat_warehouses(&mut self) -> Result<BTreeSet<String>>;

    /// Latest attributes per material among consumption rows with keys in `(after, upto]`.
    async fn latest_material_attributes(
        &mut self,
        after: i64,
        upto: i64,
    ) -> Result<Vec<MaterialAttributes>>;

    /// Inserts materials not yet present; existing rows are left untouched.
    async fn insert_new_materials(&mut self, rows: &[MaterialAttributes]) -> Result<u64>;

    /// Rebuilds the unique-material table from the full consumption history.
    async fn rebuild_unique_materials(&mut self) -> Result<u64>;

    /// Signed movement totals per balance key for keys in `(after, upto]`, seat
    /// warehouses excluded.
    async fn balance_deltas(
        &mut self,
        after: i64,
        upto: i64,
        outbound_document_type: &str,
    ) -> Result<Vec<BalanceDelta>>;

    /// Applies `deltas` and advances watermark `name` to `upto` in one transaction.
    async fn apply_balance_deltas(
        &mut self,
        deltas: &[BalanceDelta],
        name: &str,
        upto: i64,
    ) -> Result<SyncState>;

    /// Deletes every non-seat balance row.
    async fn clear_balances(&mut self) -> Result<u64>;

    async fn balances(&mut self, materials: Option<&[String]>) -> Result<Vec<BalanceRow>>;

    /// Distinct non-seat materials moved by keys in `(after, upto]`.
    async fn touched_materials(&mut self, after: i64, upto: i64) -> Result<Vec<String>>;

    async fn variant_mappings(
        &mut self,
        materials: Option<&[String]>,
    ) -> Result<Vec<VariantMapping>>;

    async fn variant_rows(&mut self) -> Result<Vec<VariantRow>>;

    /// Deletes the variant rows of `materials` and inserts `rows` in one transaction.
    async fn replace_variant_rows(&mut self, materials: &[String], rows: &[VariantRow])
        -> Result<()>;

    async fn clear_variant_rows(&mut self) -> Result<u64>;

    /// Streams the table into a backup artifact; returns bytes written.
    async fn export_table(&mut self, table: Table, sink: &mut BackupWriter) -> Result<u64>;

    /// Replaces the table contents with the artifact; returns rows restored.
    async fn restore_table(&mut self, table: Table, source: &mut BackupReader) -> Result<u64>;

    async fn execute_script(&mut self, script: &SqlScript) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_know_their_table() {
        let batch = RowBatch::OpenOrders(Vec::new());
        assert_eq!(batch.table(), Table::OpenOrderMovements);
        assert!(batch.is_empty());
    }
}
