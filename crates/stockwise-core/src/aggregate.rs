use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{ConsumptionRow, MovementRow};

/// Identity of a running-balance row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BalanceKey {
    pub material: String,
    pub warehouse: String,
    pub unit: String,
}

impl BalanceKey {
    pub fn new(
        material: impl Into<String>,
        warehouse: impl Into<String>,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            material: material.into(),
            warehouse: warehouse.into(),
            unit: unit.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub key: BalanceKey,
    pub delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRow {
    pub key: BalanceKey,
    pub current_stock: f64,
}

/// Sums signed quantities per balance key. Outbound documents subtract, everything
/// else adds. Seat warehouses and rows missing a key component are left out.
pub fn accumulate_deltas<'a>(
    rows: impl IntoIterator<Item = &'a MovementRow>,
    seat_warehouses: &BTreeSet<String>,
    outbound_document_type: &str,
) -> Vec<BalanceDelta> {
    let mut sums: BTreeMap<BalanceKey, f64> = BTreeMap::new();

    for row in rows {
        let (Some(material), Some(warehouse), Some(unit)) = (
            row.material_name.as_deref(),
            row.company_code.as_deref(),
            row.unit_of_measure.as_deref(),
        ) else {
            continue;
        };
        if seat_warehouses.contains(warehouse) {
            continue;
        }
        let signed = if row.document_type.as_deref() == Some(outbound_document_type) {
            -row.quantity
        } else {
            row.quantity
        };
        *sums
            .entry(BalanceKey::new(material, warehouse, unit))
            .or_insert(0.0) += signed;
    }

    sums.into_iter()
        .map(|(key, delta)| BalanceDelta { key, delta })
        .collect()
}

/// Update-if-exists-else-insert of each delta.
pub fn apply_deltas(balances: &mut BTreeMap<BalanceKey, f64>, deltas: &[BalanceDelta]) {
    for delta in deltas {
        *balances.entry(delta.key.clone()).or_insert(0.0) += delta.delta;
    }
}

/// Static material to stock-variant mapping row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantMapping {
    pub bom_material_name: Option<String>,
    pub bom_uom: Option<String>,
    pub bom_type: Option<String>,
    pub stock_adi: String,
    /// Width attribute; digits are read as a percentage for fabric conversion.
    pub ek_2: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariantKey {
    pub bom_material_name: Option<String>,
    pub stock_adi: String,
    pub warehouse: String,
    pub stock_uom: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantRow {
    pub bom_material_name: Option<String>,
    pub bom_uom: Option<String>,
    pub bom_type: Option<String>,
    pub stock_adi: String,
    pub stock_uom: String,
    pub warehouse: String,
    pub current_stock: f64,
}

impl VariantRow {
    pub fn key(&self) -> VariantKey {
        VariantKey {
            bom_material_name: self.bom_material_name.clone(),
            stock_adi: self.stock_adi.clone(),
            warehouse: self.warehouse.clone(),
            stock_uom: self.stock_uom.clone(),
        }
    }
}

/// Factor applied to a stock balance when expressed in the mapped BOM unit.
///
/// Fabric materials measured in square metres but stocked by the linear metre are
/// scaled by the mapping width (`ek_2`, read as a percentage). Anything else, including
/// a missing or non-numeric width, converts 1:1.
pub fn conversion_factor(mapping: &VariantMapping, stock_uom: &str) -> f64 {
    let fabric = mapping
        .bom_type
        .as_deref()
        .is_some_and(|kind| kind.starts_with("KUMA"));
    let square_metres = mapping.bom_uom.as_deref() == Some("Mt2");
    let stock_uom = stock_uom.to_lowercase();
    let linear_metres = stock_uom.contains("mt") && !stock_uom.contains("mt2");

    if !(fabric && square_metres && linear_metres) {
        return 1.0;
    }

    mapping
        .ek_2
        .as_deref()
        .and_then(parse_width)
        .map(|width| width / 100.0)
        .unwrap_or(1.0)
}

fn parse_width(raw: &str) -> Option<f64> {
    let digits: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Joins mappings against balances on the stock name and converts each balance.
pub fn derive_variant_rows(mappings: &[VariantMapping], balances: &[BalanceRow]) -> Vec<VariantRow> {
    let mut by_stock: BTreeMap<&str, Vec<&BalanceRow>> = BTreeMap::new();
    for balance in balances {
        by_stock
            .entry(balance.key.material.as_str())
            .or_default()
            .push(balance);
    }

    let mut rows = Vec::new();
    for mapping in mappings {
        let Some(matches) = by_stock.get(mapping.stock_adi.as_str()) else {
            continue;
        };
        for balance in matches {
            rows.push(VariantRow {
                bom_material_name: mapping.bom_material_name.clone(),
                bom_uom: mapping.bom_uom.clone(),
                bom_type: mapping.bom_type.clone(),
                stock_adi: mapping.stock_adi.clone(),
                stock_uom: balance.key.unit.clone(),
                warehouse: balance.key.warehouse.clone(),
                current_stock: balance.current_stock * conversion_factor(mapping, &balance.key.unit),
            });
        }
    }
    rows.sort_by(|a, b| a.key().cmp(&b.key()));
    rows
}

/// Categorical attributes of one material in the unique-material dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialAttributes {
    pub material_name: String,
    pub material_color: Option<String>,
    pub item_no: Option<String>,
    pub unit_of_measure: Option<String>,
    pub material_category: Option<String>,
}

/// Most recent attributes per material name: latest transaction date wins, then the
/// highest key. Rows without a material name are ignored.
pub fn latest_attributes<'a>(
    rows: impl IntoIterator<Item = &'a ConsumptionRow>,
) -> Vec<MaterialAttributes> {
    let mut latest: BTreeMap<&str, (Option<NaiveDate>, i64, &ConsumptionRow)> = BTreeMap::new();

    for row in rows {
        let Some(name) = row.material_name.as_deref().filter(|n| !n.is_empty()) else {
            continue;
        };
        let rank = (row.transaction_date, row.h_id);
        match latest.get(name) {
            Some((date, key, _)) if (*date, *key) >= rank => {}
            _ => {
                latest.insert(name, (rank.0, rank.1, row));
            }
        }
    }

    latest
        .into_iter()
        .map(|(name, (_, _, row))| MaterialAttributes {
            material_name: name.to_string(),
            material_color: row.material_color.clone(),
            item_no: row.item_no.clone(),
            unit_of_measure: row.unit_of_measure.clone(),
            material_category: row.material_category.clone(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceMismatch<K> {
    pub key: K,
    pub expected: f64,
    pub actual: f64,
}

/// Keys whose values differ by more than `tolerance`; a key missing on one side counts
/// as zero there.
pub fn compare_balances<K: Ord + Clone>(
    expected: &BTreeMap<K, f64>,
    actual: &BTreeMap<K, f64>,
    tolerance: f64,
) -> Vec<BalanceMismatch<K>> {
    let keys: BTreeSet<&K> = expected.keys().chain(actual.keys()).collect();
    keys.into_iter()
        .filter_map(|key| {
            let e = expected.get(key).copied().unwrap_or(0.0);
            let a = actual.get(key).copied().unwrap_or(0.0);
            ((e - a).abs() > tolerance).then(|| BalanceMismatch {
                key: key.clone(),
                expected: e,
                actual: a,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn movement(key: i64, doc: &str, warehouse: &str, qty: f64) -> MovementRow {
        MovementRow {
            h_id: key,
            ref_hid: None,
            hs_id: Some(key * 10),
            transaction_date: NaiveDate::from_ymd_opt(2024, 1, 1),
            company_code: Some(warehouse.into()),
            document_type: Some(doc.into()),
            movement_status: Some("Aktif".into()),
            material_name: Some("M".into()),
            material_label: None,
            material_category: None,
            item_no: None,
            unit_of_measure: Some("U".into()),
            quantity: qty,
        }
    }

    #[test]
    fn outbound_documents_subtract_and_seat_warehouses_are_excluded() {
        let seat: BTreeSet<String> = ["SEAT".to_string()].into_iter().collect();
        let rows = vec![
            movement(1, "IN", "W", 10.0),
            movement(2, "OUT", "W", 4.0),
            movement(3, "IN", "SEAT", 99.0),
        ];

        let deltas = accumulate_deltas(&rows, &seat, "OUT");
        assert_eq!(
            deltas,
            vec![BalanceDelta {
                key: BalanceKey::new("M", "W", "U"),
                delta: 6.0
            }]
        );
    }

    #[test]
    fn cumulative_balance_is_signed_sum_of_deltas() {
        let key = BalanceKey::new("M", "W", "U");
        let mut balances = BTreeMap::from([(key.clone(), 5.0)]);

        apply_deltas(
            &mut balances,
            &[BalanceDelta {
                key: key.clone(),
                delta: -3.0,
            }],
        );
        assert_eq!(balances[&key], 2.0);

        apply_deltas(
            &mut balances,
            &[
                BalanceDelta {
                    key: key.clone(),
                    delta: 7.5,
                },
                BalanceDelta {
                    key: BalanceKey::new("N", "W", "U"),
                    delta: 1.0,
                },
            ],
        );
        assert_eq!(balances[&key], 9.5);
        assert_eq!(balances.len(), 2);
    }

    fn fabric_mapping(ek_2: Option<&str>) -> VariantMapping {
        VariantMapping {
            bom_material_name: Some("STOR KUMAŞ".into()),
            bom_uom: Some("Mt2".into()),
            bom_type: Some("KUMAŞ".into()),
            stock_adi: "KUMAŞ 200".into(),
            ek_2: ek_2.map(str::to_string),
        }
    }

    #[test]
    fn fabric_width_converts_linear_metres() {
        assert_eq!(conversion_factor(&fabric_mapping(Some("250 cm")), "MT"), 2.5);
        assert_eq!(conversion_factor(&fabric_mapping(Some("250")), "Mt2"), 1.0);
        assert_eq!(conversion_factor(&fabric_mapping(None), "mt"), 1.0);
        assert_eq!(conversion_factor(&fabric_mapping(Some("n/a")), "mt"), 1.0);

        let mut profile = fabric_mapping(Some("250"));
        profile.bom_type = Some("PROFİL".into());
        assert_eq!(conversion_factor(&profile, "mt"), 1.0);
    }

    #[test]
    fn variant_rows_join_on_stock_name() {
        let balances = vec![
            BalanceRow {
                key: BalanceKey::new("KUMAŞ 200", "A", "mt"),
                current_stock: 10.0,
            },
            BalanceRow {
                key: BalanceKey::new("OTHER", "A", "mt"),
                current_stock: 3.0,
            },
        ];
        let rows = derive_variant_rows(&[fabric_mapping(Some("200"))], &balances);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].warehouse, "A");
        assert_eq!(rows[0].current_stock, 20.0);
    }

    fn consumption(key: i64, date: (i32, u32, u32), name: &str, item: &str) -> ConsumptionRow {
        ConsumptionRow {
            h_id: key,
            transaction_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2),
            company_code: None,
            document_type: None,
            material_category: Some("KUMAŞ".into()),
            material_name: Some(name.into()),
            unit_of_measure: Some("Mt2".into()),
            quantity: 1.0,
            item_no: Some(item.into()),
            material_color: None,
        }
    }

    #[test]
    fn latest_attributes_prefer_newest_date_then_highest_key() {
        let rows = vec![
            consumption(5, (2024, 3, 1), "A", "old"),
            consumption(3, (2024, 4, 1), "A", "newest-date"),
            consumption(8, (2024, 2, 1), "B", "low-key"),
            consumption(9, (2024, 2, 1), "B", "high-key"),
        ];

        let attrs = latest_attributes(&rows);
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].item_no.as_deref(), Some("newest-date"));
        assert_eq!(attrs[1].item_no.as_deref(), Some("high-key"));
    }

    #[test]
    fn compare_reports_only_out_of_tolerance_keys() {
        let expected = BTreeMap::from([("a", 1.0), ("b", 2.0), ("c", 0.00001)]);
        let actual = BTreeMap::from([("a", 1.00005), ("b", 2.5)]);

        let mismatches = compare_balances(&expected, &actual, 0.0001);
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].key, "b");
    }
}
