use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;
use stockwise_core::{
    apply_deltas, compare_balances, derive_variant_rows, BalanceKey, BalanceMismatch, Table,
    VariantKey, VariantRow,
};
use stockwise_storage::Destination;
use tracing::info;

/// Largest difference still treated as equal.
pub const TOLERANCE: f64 = 0.0001;

/// Stored aggregates compared against a replay of the raw history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StockVerification {
    pub balance_rows: usize,
    pub variant_rows: usize,
    pub balance_mismatches: Vec<BalanceMismatch<BalanceKey>>,
    pub variant_mismatches: Vec<BalanceMismatch<VariantKey>>,
    pub missing_tables: Vec<String>,
}

impl StockVerification {
    pub fn is_consistent(&self) -> bool {
        self.missing_tables.is_empty()
            && self.balance_mismatches.is_empty()
            && self.variant_mismatches.is_empty()
    }

    /// 2 when required tables are missing, 1 on any mismatch, 0 otherwise.
    pub fn exit_code(&self) -> i32 {
        if !self.missing_tables.is_empty() {
            2
        } else if self.balance_mismatches.is_empty() && self.variant_mismatches.is_empty() {
            0
        } else {
            1
        }
    }
}

/// Recomputes non-seat balances from every stored movement (seat rows are taken as
/// stored) and variant rows from the mapping, then diffs both against the tables.
pub async fn verify_stock(
    dest: &mut dyn Destination,
    outbound_document_type: &str,
) -> Result<StockVerification> {
    let mut report = StockVerification::default();
    for table in [
        Table::StockMovements,
        Table::RunningBalance,
        Table::VariantBalance,
        Table::VariantMap,
    ] {
        if !dest.table_exists(table).await? {
            report.missing_tables.push(table.name().to_string());
        }
    }
    if !report.missing_tables.is_empty() {
        return Ok(report);
    }

    let seats = dest.seat_warehouses().await?;
    let stored = dest.balances(None).await?;
    report.balance_rows = stored.len();

    let mut expected: BTreeMap<BalanceKey, f64> = stored
        .iter()
        .filter(|row| seats.contains(&row.key.warehouse))
        .map(|row| (row.key.clone(), row.current_stock))
        .collect();
    let deltas = dest
        .balance_deltas(0, i64::MAX, outbound_document_type)
        .await?;
    apply_deltas(&mut expected, &deltas);

    let actual: BTreeMap<BalanceKey, f64> = stored
        .iter()
        .map(|row| (row.key.clone(), row.current_stock))
        .collect();
    report.balance_mismatches = compare_balances(&expected, &actual, TOLERANCE);

    let mappings = dest.variant_mappings(None).await?;
    let expected_variants = sum_by_key(derive_variant_rows(&mappings, &stored));
    let stored_variants = dest.variant_rows().await?;
    report.variant_rows = stored_variants.len();
    let actual_variants = sum_by_key(stored_variants);
    report.variant_mismatches = compare_balances(&expected_variants, &actual_variants, TOLERANCE);

    info!(
        balance_rows = report.balance_rows,
        balance_mismatches = report.balance_mismatches.len(),
        variant_rows = report.variant_rows,
        variant_mismatches = report.variant_mismatches.len(),
        "stock verification finished"
    );
    Ok(report)
}

fn sum_by_key(rows: Vec<VariantRow>) -> BTreeMap<VariantKey, f64> {
    let mut sums = BTreeMap::new();
    for row in rows {
        *sums.entry(row.key()).or_insert(0.0) += row.current_stock;
    }
    sums
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregates::AggregateMaintainer;
    use crate::testing::{movement, MemoryDestination};

    #[tokio::test]
    async fn maintained_balances_verify_clean_and_drift_is_reported() {
        let (mut dest, state) = MemoryDestination::new();
        {
            let mut s = state.lock();
            s.movements.push(movement(1, "Depo Giriş", "KUMAŞ", "ANA DEPO", "MT", 10.0));
            s.movements.push(movement(2, "Depo Çıkış", "KUMAŞ", "ANA DEPO", "MT", 4.0));
        }
        AggregateMaintainer::new("Depo Çıkış")
            .refresh_running_balance(&mut dest)
            .await
            .expect("refresh");

        let clean = verify_stock(&mut dest, "Depo Çıkış").await.expect("verify");
        assert_eq!(clean.exit_code(), 0);
        assert_eq!(clean.balance_rows, 1);

        state
            .lock()
            .balances
            .insert(BalanceKey::new("KUMAŞ", "ANA DEPO", "MT"), 6.5);
        let drifted = verify_stock(&mut dest, "Depo Çıkış").await.expect("verify");
        assert_eq!(drifted.exit_code(), 1);
        assert_eq!(drifted.balance_mismatches[0].expected, 6.0);
        assert_eq!(drifted.balance_mismatches[0].actual, 6.5);
    }

    #[tokio::test]
    async fn missing_tables_exit_with_two() {
        let (mut dest, state) = MemoryDestination::new();
        state.lock().missing.insert(Table::VariantBalance);

        let report = verify_stock(&mut dest, "Depo Çıkış").await.expect("verify");
        assert_eq!(report.missing_tables, vec!["current_stock_by_variant".to_string()]);
        assert_eq!(report.exit_code(), 2);
        assert!(!report.is_consistent());
    }
}
