use stockwise_core::{ColumnType, DEFAULT_SEAT_WAREHOUSES, STOCK_MASTER_COLUMNS};

use crate::StorageError;

/// Accepts lowercase/uppercase ASCII identifiers suitable for unquoted interpolation.
pub fn validate_identifier(name: &str) -> Result<&str, StorageError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && name.len() <= 63 {
        Ok(name)
    } else {
        Err(StorageError::InvalidIdentifier(name.to_string()))
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn stock_master_ddl(raw: &str) -> String {
    let columns: Vec<String> = STOCK_MASTER_COLUMNS
        .iter()
        .map(|spec| {
            let kind = match spec.kind {
                ColumnType::Int => "BIGINT",
                ColumnType::Numeric => "NUMERIC",
                ColumnType::Text => "TEXT",
            };
            format!("    {} {kind}", spec.name)
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {raw}.stock_master (\n    id BIGSERIAL PRIMARY KEY,\n{}\n)",
        columns.join(",\n")
    )
}

/// Idempotent DDL for every table the engine owns. The variant table and its mapping
/// table are provisioned externally and only checked for existence at runtime.
pub fn bootstrap_statements(raw_schema: &str) -> Result<Vec<String>, StorageError> {
    let raw = validate_identifier(raw_schema)?;

    let seed = DEFAULT_SEAT_WAREHOUSES
        .iter()
        .map(|name| format!("({})", quote_literal(name)))
        .collect::<Vec<_>>()
        .join(", ");

    Ok(vec![
        format!("CREATE SCHEMA IF NOT EXISTS {raw}"),
        "CREATE SCHEMA IF NOT EXISTS core".to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS {raw}.raw_bom_consumption (
    id BIGSERIAL PRIMARY KEY,
    h_id BIGINT,
    transaction_date DATE,
    company_code TEXT,
    document_type TEXT,
    material_category TEXT,
    material_name TEXT,
    unit_of_measure TEXT,
    quantity NUMERIC,
    item_no TEXT,
    material_color TEXT,
    created_at TIMESTAMP DEFAULT NOW()
)"
        ),
        format!("ALTER TABLE {raw}.raw_bom_consumption ADD COLUMN IF NOT EXISTS material_color TEXT"),
        format!("CREATE INDEX IF NOT EXISTS ix_raw_bom_consumption_hid ON {raw}.raw_bom_consumption (h_id)"),
        format!("CREATE INDEX IF NOT EXISTS ix_raw_bom_consumption_item ON {raw}.raw_bom_consumption (item_no)"),
        format!(
            "CREATE TABLE IF NOT EXISTS {raw}.raw_stock_movements (
    id BIGSERIAL PRIMARY KEY,
    h_id BIGINT,
    ref_hid BIGINT,
    hs_id BIGINT,
    transaction_date DATE,
    company_code TEXT,
    document_type TEXT,
    movement_status TEXT,
    material_name TEXT,
    material_label TEXT,
    material_category TEXT,
    item_no TEXT,
    unit_of_measure TEXT,
    quantity NUMERIC,
    created_at TIMESTAMP DEFAULT NOW()
)"
        ),
        format!("ALTER TABLE {raw}.raw_stock_movements ADD COLUMN IF NOT EXISTS ref_hid BIGINT"),
        format!("CREATE INDEX IF NOT EXISTS ix_raw_stock_mov_hid ON {raw}.raw_stock_movements (h_id)"),
        format!("CREATE INDEX IF NOT EXISTS ix_raw_stock_mov_hsid ON {raw}.raw_stock_movements (hs_id)"),
        format!(
            "CREATE TABLE IF NOT EXISTS {raw}.raw_open_order_movements (
    id BIGSERIAL PRIMARY KEY,
    h_id BIGINT,
    ref_hid BIGINT,
    hs_id BIGINT,
    transaction_date DATE,
    company_code TEXT,
    document_type TEXT,
    movement_status TEXT,
    material_name TEXT,
    material_label TEXT,
    material_category TEXT,
    item_no TEXT,
    unit_of_measure TEXT,
    quantity NUMERIC,
    created_at TIMESTAMP DEFAULT NOW()
)"
        ),
        format!("ALTER TABLE {raw}.raw_open_order_movements ADD COLUMN IF NOT EXISTS ref_hid BIGINT"),
        stock_master_ddl(raw),
        format!("CREATE INDEX IF NOT EXISTS ix_stock_master_adi ON {raw}.stock_master (adi)"),
        "CREATE TABLE IF NOT EXISTS core.sync_state (
    name TEXT PRIMARY KEY,
    last_watermark BIGINT NOT NULL,
    updated_at TIMESTAMP NOT NULL DEFAULT NOW()
)"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS core.seat_warehouses (
    warehouse TEXT PRIMARY KEY
)"
        .to_string(),
        format!("INSERT INTO core.seat_warehouses (warehouse) VALUES {seed} ON CONFLICT DO NOTHING"),
        "CREATE TABLE IF NOT EXISTS core.raw_current_stock (
    stock_adi TEXT,
    warehouse TEXT,
    stock_uom TEXT,
    current_stock NUMERIC
)"
        .to_string(),
        "CREATE INDEX IF NOT EXISTS ix_raw_current_stock_key ON core.raw_current_stock (stock_adi, warehouse, stock_uom)"
            .to_string(),
        "CREATE TABLE IF NOT EXISTS core.bom_unique_materials (
    material_name TEXT PRIMARY KEY,
    material_color TEXT,
    item_no TEXT,
    unit_of_measure TEXT,
    material_category TEXT
)"
        .to_string(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_restricted_to_plain_names() {
        assert!(validate_identifier("raw").is_ok());
        assert!(validate_identifier("raw_2024").is_ok());
        assert!(validate_identifier("2raw").is_err());
        assert!(validate_identifier("raw; DROP SCHEMA core").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn bootstrap_uses_configured_raw_schema_and_seeds_seat_warehouses() {
        let statements = bootstrap_statements("landing").expect("valid schema");

        assert_eq!(statements[0], "CREATE SCHEMA IF NOT EXISTS landing");
        assert!(statements
            .iter()
            .any(|s| s.starts_with("CREATE TABLE IF NOT EXISTS landing.raw_stock_movements")));
        assert!(statements.iter().all(|s| !s.contains("raw.")));

        let seed = statements
            .iter()
            .find(|s| s.starts_with("INSERT INTO core.seat_warehouses"))
            .expect("seed statement");
        assert!(seed.contains("'STOR KOLTUK DEPO'"));
        assert!(seed.ends_with("ON CONFLICT DO NOTHING"));
    }

    #[test]
    fn stock_master_table_follows_column_layout() {
        let ddl = stock_master_ddl("raw");
        assert!(ddl.contains("    s_id BIGINT,"));
        assert!(ddl.contains("    eni NUMERIC,"));
        assert!(ddl.trim_end().ends_with("turu3 TEXT\n)"));
        assert!(bootstrap_statements("bad-name").is_err());
    }
}
