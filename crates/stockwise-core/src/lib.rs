//! Core domain model for the StockWise warehouse sync engine.

mod aggregate;
mod retry;
mod window;

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub use aggregate::{
    accumulate_deltas, apply_deltas, compare_balances, conversion_factor, derive_variant_rows,
    latest_attributes, BalanceDelta, BalanceKey, BalanceMismatch, BalanceRow, MaterialAttributes,
    VariantKey, VariantMapping, VariantRow,
};
pub use retry::{Backoff, RetryPolicy};
pub use window::{add_months, iter_windows, LoadRange, Window};

pub const CRATE_NAME: &str = "stockwise-core";

/// Document type whose quantity leaves the warehouse.
pub const OUTBOUND_DOCUMENT_TYPE: &str = "Depo Çıkış";

/// Seed rows for the seat warehouse registry.
pub const DEFAULT_SEAT_WAREHOUSES: [&str; 3] = [
    "JALUZİ KOLTUK DEPO",
    "KATLAMALI KOLTUK DEPO",
    "STOR KOLTUK DEPO",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Schema {
    /// Raw landing tables; the physical name is configurable.
    Raw,
    Core,
}

/// Destination tables read or written by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Table {
    BomConsumption,
    StockMovements,
    OpenOrderMovements,
    StockMaster,
    SyncState,
    SeatWarehouses,
    RunningBalance,
    UniqueMaterials,
    VariantBalance,
    VariantMap,
}

impl Table {
    pub fn schema(self) -> Schema {
        match self {
            Table::BomConsumption
            | Table::StockMovements
            | Table::OpenOrderMovements
            | Table::StockMaster => Schema::Raw,
            _ => Schema::Core,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Table::BomConsumption => "raw_bom_consumption",
            Table::StockMovements => "raw_stock_movements",
            Table::OpenOrderMovements => "raw_open_order_movements",
            Table::StockMaster => "stock_master",
            Table::SyncState => "sync_state",
            Table::SeatWarehouses => "seat_warehouses",
            Table::RunningBalance => "raw_current_stock",
            Table::UniqueMaterials => "bom_unique_materials",
            Table::VariantBalance => "current_stock_by_variant",
            Table::VariantMap => "bom_to_stock_map",
        }
    }
}

/// A named flow of rows from the source into one destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    BomConsumption,
    StockMovements,
    StockMaster,
    OpenOrders,
}

impl StreamKind {
    pub fn name(self) -> &'static str {
        match self {
            StreamKind::BomConsumption => "bom_consumption",
            StreamKind::StockMovements => "stock_movements",
            StreamKind::StockMaster => "stock_master",
            StreamKind::OpenOrders => "open_orders",
        }
    }

    pub fn table(self) -> Table {
        match self {
            StreamKind::BomConsumption => Table::BomConsumption,
            StreamKind::StockMovements => Table::StockMovements,
            StreamKind::StockMaster => Table::StockMaster,
            StreamKind::OpenOrders => Table::OpenOrderMovements,
        }
    }

    /// Append-only streams keyed by a monotonically increasing source identifier.
    pub fn is_history(self) -> bool {
        matches!(self, StreamKind::BomConsumption | StreamKind::StockMovements)
    }

    /// Sync state entry of an append-only stream. Snapshot streams have none.
    pub fn watermark_name(self) -> Option<&'static str> {
        self.is_history().then(|| self.table().name())
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Derived tables maintained from the history streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateKind {
    UniqueMaterials,
    RunningBalance,
    VariantBalance,
}

impl AggregateKind {
    pub fn table(self) -> Table {
        match self {
            AggregateKind::UniqueMaterials => Table::UniqueMaterials,
            AggregateKind::RunningBalance => Table::RunningBalance,
            AggregateKind::VariantBalance => Table::VariantBalance,
        }
    }

    pub fn state_name(self) -> &'static str {
        self.table().name()
    }

    pub fn upstream(self) -> StreamKind {
        match self {
            AggregateKind::UniqueMaterials => StreamKind::BomConsumption,
            AggregateKind::RunningBalance | AggregateKind::VariantBalance => {
                StreamKind::StockMovements
            }
        }
    }
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

/// Persisted watermark of a stream or aggregate. `last_watermark` never decreases
/// except through an explicit reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub name: String,
    pub last_watermark: i64,
    pub updated_at: NaiveDateTime,
}

/// Scalar crossing the source boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            Value::Text(v) => {
                let trimmed = v.trim();
                trimmed.parse::<i64>().ok().or_else(|| {
                    trimmed
                        .parse::<f64>()
                        .ok()
                        .filter(|f| f.fract() == 0.0)
                        .map(|f| f as i64)
                })
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(v) => v.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Int(v) => Some(v.to_string()),
            Value::Float(v) => Some(v.to_string()),
            Value::Text(v) => Some(v.clone()),
            Value::Date(v) => Some(v.format("%Y-%m-%d").to_string()),
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(v) => Some(*v),
            Value::Text(v) => v
                .get(..10)
                .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One bill-of-materials consumption line of a production document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionRow {
    pub h_id: i64,
    pub transaction_date: Option<NaiveDate>,
    pub company_code: Option<String>,
    pub document_type: Option<String>,
    pub material_category: Option<String>,
    pub material_name: Option<String>,
    pub unit_of_measure: Option<String>,
    pub quantity: f64,
    pub item_no: Option<String>,
    pub material_color: Option<String>,
}

/// Header of a warehouse movement document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementHeader {
    pub h_id: i64,
    pub transaction_date: Option<NaiveDate>,
    pub document_type: Option<String>,
    pub status: Option<String>,
    pub company_code: Option<String>,
    pub ref_hid: Option<i64>,
}

/// Line of a warehouse movement document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementLine {
    pub hs_id: Option<i64>,
    pub h_id: i64,
    pub material_name: Option<String>,
    pub material_label: Option<String>,
    pub unit_of_measure: Option<String>,
    pub quantity: f64,
    pub material_category: Option<String>,
    pub item_no: Option<String>,
}

/// Flattened header + line, as stored in the movement and open-order tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementRow {
    pub h_id: i64,
    pub ref_hid: Option<i64>,
    pub hs_id: Option<i64>,
    pub transaction_date: Option<NaiveDate>,
    pub company_code: Option<String>,
    pub document_type: Option<String>,
    pub movement_status: Option<String>,
    pub material_name: Option<String>,
    pub material_label: Option<String>,
    pub material_category: Option<String>,
    pub item_no: Option<String>,
    pub unit_of_measure: Option<String>,
    pub quantity: f64,
}

impl MovementRow {
    pub fn from_parts(header: &MovementHeader, line: MovementLine) -> Self {
        Self {
            h_id: header.h_id,
            ref_hid: header.ref_hid,
            hs_id: line.hs_id,
            transaction_date: header.transaction_date,
            company_code: header.company_code.clone(),
            document_type: header.document_type.clone(),
            movement_status: header.status.clone(),
            material_name: line.material_name,
            material_label: line.material_label,
            material_category: line.material_category,
            item_no: line.item_no,
            unit_of_measure: line.unit_of_measure,
            quantity: line.quantity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int,
    Numeric,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnType,
}

const fn col(name: &'static str, kind: ColumnType) -> ColumnSpec {
    ColumnSpec { name, kind }
}

/// Column layout of the stock master snapshot, in source order.
pub const STOCK_MASTER_COLUMNS: [ColumnSpec; 34] = [
    col("s_id", ColumnType::Int),
    col("adi", ColumnType::Text),
    col("renk_id", ColumnType::Int),
    col("aciklama", ColumnType::Text),
    col("eni", ColumnType::Numeric),
    col("boyu", ColumnType::Numeric),
    col("agirlik", ColumnType::Numeric),
    col("ana_tur", ColumnType::Text),
    col("tedarikci_1", ColumnType::Text),
    col("tedarikci_2", ColumnType::Text),
    col("tedarikci_3", ColumnType::Text),
    col("tedarikci_4", ColumnType::Text),
    col("tedarikci_5", ColumnType::Text),
    col("recete_1", ColumnType::Text),
    col("recete_2", ColumnType::Text),
    col("recete_3", ColumnType::Text),
    col("recete_4", ColumnType::Text),
    col("recete_5", ColumnType::Text),
    col("recete_6", ColumnType::Text),
    col("recete_7", ColumnType::Text),
    col("katolog", ColumnType::Text),
    col("kumas_en", ColumnType::Numeric),
    col("kumas_boy", ColumnType::Numeric),
    col("sure_1", ColumnType::Numeric),
    col("sure_2", ColumnType::Numeric),
    col("ek_1", ColumnType::Text),
    col("ek_2", ColumnType::Text),
    col("ek_3", ColumnType::Text),
    col("tam_adi", ColumnType::Text),
    col("ana_grup", ColumnType::Text),
    col("alt_grup", ColumnType::Text),
    col("birim", ColumnType::Text),
    col("turu", ColumnType::Text),
    col("turu3", ColumnType::Text),
];

/// Stock master row with values coerced to the declared column types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockMasterRow {
    values: Vec<Value>,
}

impl StockMasterRow {
    /// Returns `None` for rows without a stock identifier.
    pub fn from_values(values: Vec<Value>) -> Option<Self> {
        let values: Vec<Value> = values
            .into_iter()
            .chain(std::iter::repeat(Value::Null))
            .zip(STOCK_MASTER_COLUMNS.iter())
            .map(|(value, spec)| match spec.kind {
                ColumnType::Int => value.as_i64().into(),
                ColumnType::Numeric => value.as_f64().into(),
                ColumnType::Text => value.as_text().into(),
            })
            .collect();
        values.first().is_some_and(|id| !id.is_null()).then_some(Self { values })
    }

    pub fn s_id(&self) -> Option<i64> {
        self.values.first().and_then(Value::as_i64)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        STOCK_MASTER_COLUMNS
            .iter()
            .position(|spec| spec.name == column)
            .and_then(|idx| self.values.get(idx))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedKey {
    pub key: i64,
    pub reason: String,
}

/// Outcome of draining a list of source keys: which keys landed and which were skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub succeeded: Vec<i64>,
    pub skipped: Vec<SkippedKey>,
    pub rows_written: u64,
    pub batches: u64,
}

impl BatchReport {
    pub fn record_success(&mut self, key: i64) {
        self.succeeded.push(key);
    }

    pub fn record_skip(&mut self, key: i64, reason: impl Into<String>) {
        self.skipped.push(SkippedKey {
            key,
            reason: reason.into(),
        });
    }

    pub fn max_succeeded(&self) -> Option<i64> {
        self.succeeded.iter().copied().max()
    }

    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.succeeded.extend(other.succeeded);
        self.skipped.extend(other.skipped);
        self.rows_written += other.rows_written;
        self.batches += other.batches;
    }
}
