//! In-memory source and destination used by the engine and orchestrator tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde::de::DeserializeOwned;
use serde::Serialize;
use stockwise_core::{
    accumulate_deltas, apply_deltas, latest_attributes, BalanceDelta, BalanceKey, BalanceRow,
    ConsumptionRow, MaterialAttributes, MovementHeader, MovementLine, MovementRow,
    StockMasterRow, StreamKind, SyncState, Table, VariantMapping, VariantRow, Window,
    DEFAULT_SEAT_WAREHOUSES,
};
use stockwise_source::{EndpointSwitch, SourceEndpoint, SourceError, SourceSystem};
use stockwise_storage::{
    BackupReader, BackupWriter, Destination, RowBatch, SqlScript, StorageError,
};

use crate::schedule::Clock;

/// Shared handle so tests can inspect state after the fake is boxed away.
pub(crate) struct Shared<T>(Arc<Mutex<T>>);

impl<T> Shared<T> {
    fn new(value: T) -> Self {
        Self(Arc::new(Mutex::new(value)))
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

pub(crate) fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

pub(crate) fn consumption_row(h_id: i64, material: &str, quantity: f64) -> ConsumptionRow {
    ConsumptionRow {
        h_id,
        transaction_date: Some(day(2024, 1, 1)),
        company_code: Some("ÜRETİM".into()),
        document_type: Some("21".into()),
        material_category: Some("HAMMADDE".into()),
        material_name: Some(material.into()),
        unit_of_measure: Some("MT".into()),
        quantity,
        item_no: Some(format!("ITEM-{h_id}")),
        material_color: None,
    }
}

pub(crate) fn movement(
    h_id: i64,
    document_type: &str,
    material: &str,
    warehouse: &str,
    unit: &str,
    quantity: f64,
) -> MovementRow {
    MovementRow::from_parts(
        &header(h_id, day(2024, 1, 1), document_type, warehouse),
        line(h_id, material, unit, quantity),
    )
}

pub(crate) fn header(
    h_id: i64,
    date: NaiveDate,
    document_type: &str,
    warehouse: &str,
) -> MovementHeader {
    MovementHeader {
        h_id,
        transaction_date: Some(date),
        document_type: Some(document_type.into()),
        status: Some("Aktif".into()),
        company_code: Some(warehouse.into()),
        ref_hid: None,
    }
}

pub(crate) fn line(h_id: i64, material: &str, unit: &str, quantity: f64) -> MovementLine {
    MovementLine {
        hs_id: Some(h_id * 100),
        h_id,
        material_name: Some(material.into()),
        material_label: None,
        unit_of_measure: Some(unit.into()),
        quantity,
        material_category: Some("HAMMADDE".into()),
        item_no: None,
    }
}

/// Clock frozen at a settable instant.
pub(crate) struct PinnedClock(Mutex<NaiveDateTime>);

impl PinnedClock {
    pub(crate) fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> Self {
        let now = day(y, m, d).and_hms_opt(h, min, 0).expect("valid time");
        Self(Mutex::new(now))
    }

    pub(crate) fn set(&self, now: NaiveDateTime) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }
}

impl Clock for PinnedClock {
    fn now(&self) -> NaiveDateTime {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
pub(crate) struct SourceState {
    pub endpoint: Option<SourceEndpoint>,
    pub endpoint_history: Vec<SourceEndpoint>,
    pub consumption: BTreeMap<i64, (NaiveDate, Vec<ConsumptionRow>)>,
    pub headers: BTreeMap<i64, MovementHeader>,
    pub lines: BTreeMap<i64, Vec<MovementLine>>,
    pub open_orders: Vec<MovementRow>,
    pub stock_master: Vec<StockMasterRow>,
    pub failing_keys: BTreeSet<i64>,
    pub fail_windows: bool,
    pub connection_lost: bool,
    pub reconnects: usize,
    pub invalidations: usize,
}

impl SourceState {
    pub(crate) fn add_consumption(&mut self, key: i64, date: NaiveDate, rows: Vec<ConsumptionRow>) {
        self.consumption.insert(key, (date, rows));
    }

    pub(crate) fn add_movement(&mut self, header: MovementHeader, lines: Vec<MovementLine>) {
        self.lines.insert(header.h_id, lines);
        self.headers.insert(header.h_id, header);
    }

    fn check_connection(&self) -> Result<(), SourceError> {
        if self.connection_lost {
            Err(SourceError::Connect {
                endpoint: "live".into(),
                attempts: 1,
                message: "connection refused".into(),
            })
        } else {
            Ok(())
        }
    }

    fn check_key(&self, key: i64) -> Result<(), SourceError> {
        self.check_connection()?;
        if self.failing_keys.contains(&key) {
            Err(SourceError::rejected(format!("detail fetch failed for {key}")))
        } else {
            Ok(())
        }
    }

    fn check_window(&self) -> Result<(), SourceError> {
        self.check_connection()?;
        if self.fail_windows {
            Err(SourceError::rejected("window query failed"))
        } else {
            Ok(())
        }
    }
}

pub(crate) struct MemorySource {
    state: Shared<SourceState>,
}

impl MemorySource {
    pub(crate) fn new() -> (Self, Shared<SourceState>) {
        let state = Shared::new(SourceState::default());
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

impl EndpointSwitch for MemorySource {
    fn switch_endpoint(&mut self, endpoint: SourceEndpoint) -> SourceEndpoint {
        let mut state = self.state.lock();
        state.endpoint_history.push(endpoint);
        state
            .endpoint
            .replace(endpoint)
            .unwrap_or(SourceEndpoint::Live)
    }
}

#[async_trait]
impl SourceSystem for MemorySource {
    fn active_endpoint(&self) -> SourceEndpoint {
        self.state.lock().endpoint.unwrap_or(SourceEndpoint::Live)
    }

    fn invalidate(&mut self) {
        self.state.lock().invalidations += 1;
    }

    async fn reconnect(&mut self) -> Result<(), SourceError> {
        let mut state = self.state.lock();
        state.check_connection()?;
        state.reconnects += 1;
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), SourceError> {
        self.state.lock().check_connection()
    }

    async fn consumption_keys(&mut self, window: &Window) -> Result<Vec<i64>, SourceError> {
        let state = self.state.lock();
        state.check_window()?;
        Ok(state
            .consumption
            .iter()
            .filter(|(_, (date, _))| window.contains(*date))
            .map(|(key, _)| *key)
            .collect())
    }

    async fn consumption_keys_since(&mut self, after: i64) -> Result<Vec<i64>, SourceError> {
        let state = self.state.lock();
        state.check_connection()?;
        Ok(state.consumption.range(after + 1..).map(|(key, _)| *key).collect())
    }

    async fn consumption_rows(&mut self, key: i64) -> Result<Vec<ConsumptionRow>, SourceError> {
        let state = self.state.lock();
        state.check_key(key)?;
        Ok(state
            .consumption
            .get(&key)
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    async fn movement_headers(
        &mut self,
        window: &Window,
    ) -> Result<Vec<MovementHeader>, SourceError> {
        let state = self.state.lock();
        state.check_window()?;
        Ok(state
            .headers
            .values()
            .filter(|h| h.transaction_date.is_some_and(|d| window.contains(d)))
            .cloned()
            .collect())
    }

    async fn changed_movement_keys(&mut self, after: i64) -> Result<Vec<i64>, SourceError> {
        let state = self.state.lock();
        state.check_connection()?;
        Ok(state.headers.range(after + 1..).map(|(key, _)| *key).collect())
    }

    async fn movement_header(&mut self, key: i64) -> Result<Option<MovementHeader>, SourceError> {
        let state = self.state.lock();
        state.check_connection()?;
        Ok(state.headers.get(&key).cloned())
    }

    async fn movement_lines(&mut self, key: i64) -> Result<Vec<MovementLine>, SourceError> {
        let state = self.state.lock();
        state.check_key(key)?;
        Ok(state.lines.get(&key).cloned().unwrap_or_default())
    }

    async fn open_orders(&mut self) -> Result<Vec<MovementRow>, SourceError> {
        let state = self.state.lock();
        state.check_connection()?;
        Ok(state.open_orders.clone())
    }

    async fn stock_master(&mut self) -> Result<Vec<StockMasterRow>, SourceError> {
        let state = self.state.lock();
        state.check_connection()?;
        Ok(state.stock_master.clone())
    }
}

pub(crate) struct DestState {
    pub consumption: Vec<ConsumptionRow>,
    pub movements: Vec<MovementRow>,
    pub open_orders: Vec<MovementRow>,
    pub stock_master: Vec<StockMasterRow>,
    pub watermarks: BTreeMap<String, i64>,
    pub seats: BTreeSet<String>,
    pub balances: BTreeMap<BalanceKey, f64>,
    pub unique: BTreeMap<String, MaterialAttributes>,
    pub mappings: Vec<VariantMapping>,
    pub variants: Vec<VariantRow>,
    pub missing: BTreeSet<Table>,
    pub appends: usize,
    pub executed: Vec<String>,
    pub fail_statement: Option<String>,
    pub fail_balance_apply: bool,
    pub schema_ensured: bool,
}

impl Default for DestState {
    fn default() -> Self {
        Self {
            consumption: Vec::new(),
            movements: Vec::new(),
            open_orders: Vec::new(),
            stock_master: Vec::new(),
            watermarks: BTreeMap::new(),
            seats: DEFAULT_SEAT_WAREHOUSES.iter().map(|s| s.to_string()).collect(),
            balances: BTreeMap::new(),
            unique: BTreeMap::new(),
            mappings: Vec::new(),
            variants: Vec::new(),
            missing: BTreeSet::new(),
            appends: 0,
            executed: Vec::new(),
            fail_statement: None,
            fail_balance_apply: false,
            schema_ensured: false,
        }
    }
}

impl DestState {
    pub(crate) fn set_watermark(&mut self, name: &str, value: i64) {
        self.watermarks.insert(name.to_string(), value);
    }

    pub(crate) fn watermark_value(&self, name: &str) -> Option<i64> {
        self.watermarks.get(name).copied()
    }

    pub(crate) fn balance_of(&self, material: &str, warehouse: &str, unit: &str) -> Option<f64> {
        self.balances
            .get(&BalanceKey::new(material, warehouse, unit))
            .copied()
    }

    fn state(&self, name: &str) -> Option<SyncState> {
        self.watermarks.get(name).map(|value| SyncState {
            name: name.to_string(),
            last_watermark: *value,
            updated_at: NaiveDateTime::default(),
        })
    }

    fn is_seat(&self, warehouse: Option<&str>) -> bool {
        warehouse.is_some_and(|w| self.seats.contains(w))
    }

    fn movements_in(&self, after: i64, upto: i64) -> impl Iterator<Item = &MovementRow> {
        self.movements
            .iter()
            .filter(move |row| row.h_id > after && row.h_id <= upto)
    }
}

pub(crate) struct MemoryDestination {
    state: Shared<DestState>,
}

impl MemoryDestination {
    pub(crate) fn new() -> (Self, Shared<DestState>) {
        let state = Shared::new(DestState::default());
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

fn to_json_lines<T: Serialize>(rows: &[T]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut out, row)?;
        out.push(b'\n');
    }
    Ok(out)
}

fn from_json_lines<T: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<T>> {
    bytes
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice(line).map_err(anyhow::Error::from))
        .collect()
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn ensure_schema(&mut self) -> Result<()> {
        self.state.lock().schema_ensured = true;
        Ok(())
    }

    async fn table_exists(&mut self, table: Table) -> Result<bool> {
        Ok(!self.state.lock().missing.contains(&table))
    }

    async fn has_rows(&mut self, table: Table) -> Result<bool> {
        let s = self.state.lock();
        Ok(match table {
            Table::BomConsumption => !s.consumption.is_empty(),
            Table::StockMovements => !s.movements.is_empty(),
            Table::OpenOrderMovements => !s.open_orders.is_empty(),
            Table::StockMaster => !s.stock_master.is_empty(),
            Table::SyncState => !s.watermarks.is_empty(),
            Table::SeatWarehouses => !s.seats.is_empty(),
            Table::RunningBalance => !s.balances.is_empty(),
            Table::UniqueMaterials => !s.unique.is_empty(),
            Table::VariantBalance => !s.variants.is_empty(),
            Table::VariantMap => !s.mappings.is_empty(),
        })
    }

    async fn truncate(&mut self, table: Table) -> Result<()> {
        let mut s = self.state.lock();
        match table {
            Table::BomConsumption => s.consumption.clear(),
            Table::StockMovements => s.movements.clear(),
            Table::OpenOrderMovements => s.open_orders.clear(),
            Table::StockMaster => s.stock_master.clear(),
            other => bail!("refusing to truncate {}", other.name()),
        }
        Ok(())
    }

    async fn append(&mut self, batch: RowBatch) -> Result<u64> {
        let mut s = self.state.lock();
        let count = batch.len() as u64;
        s.appends += 1;
        match batch {
            RowBatch::Consumption(rows) => s.consumption.extend(rows),
            RowBatch::Movements(rows) => s.movements.extend(rows),
            RowBatch::OpenOrders(rows) => s.open_orders.extend(rows),
            RowBatch::StockMaster(rows) => s.stock_master.extend(rows),
        }
        Ok(count)
    }

    async fn max_key(&mut self, stream: StreamKind) -> Result<i64> {
        let s = self.state.lock();
        Ok(match stream {
            StreamKind::BomConsumption => s.consumption.iter().map(|r| r.h_id).max(),
            StreamKind::StockMovements => s.movements.iter().map(|r| r.h_id).max(),
            StreamKind::StockMaster | StreamKind::OpenOrders => None,
        }
        .unwrap_or(0))
    }

    async fn max_key_after(
        &mut self,
        stream: StreamKind,
        after: i64,
        exclude_seat: bool,
    ) -> Result<Option<i64>> {
        let s = self.state.lock();
        Ok(match stream {
            StreamKind::BomConsumption => s
                .consumption
                .iter()
                .filter(|r| r.h_id > after)
                .map(|r| r.h_id)
                .max(),
            StreamKind::StockMovements => s
                .movements
                .iter()
                .filter(|r| r.h_id > after)
                .filter(|r| !(exclude_seat && s.is_seat(r.company_code.as_deref())))
                .map(|r| r.h_id)
                .max(),
            StreamKind::StockMaster | StreamKind::OpenOrders => None,
        })
    }

    async fn watermark(&mut self, name: &str) -> Result<Option<SyncState>> {
        Ok(self.state.lock().state(name))
    }

    async fn advance_watermark(&mut self, name: &str, value: i64) -> Result<SyncState> {
        let mut s = self.state.lock();
        let entry = s.watermarks.entry(name.to_string()).or_insert(value);
        *entry = (*entry).max(value);
        s.state(name).ok_or_else(|| anyhow::anyhow!("watermark {name} vanished"))
    }

    async fn reset_watermark(&mut self, name: &str, value: i64) -> Result<SyncState> {
        let mut s = self.state.lock();
        s.set_watermark(name, value);
        s.state(name).ok_or_else(|| anyhow::anyhow!("watermark {name} vanished"))
    }

    async fn watermarks(&mut self) -> Result<Vec<SyncState>> {
        let s = self.state.lock();
        Ok(s.watermarks.keys().filter_map(|name| s.state(name)).collect())
    }

    async fn seat_warehouses(&mut self) -> Result<BTreeSet<String>> {
        Ok(self.state.lock().seats.clone())
    }

    async fn latest_material_attributes(
        &mut self,
        after: i64,
        upto: i64,
    ) -> Result<Vec<MaterialAttributes>> {
        let s = self.state.lock();
        Ok(latest_attributes(
            s.consumption.iter().filter(|r| r.h_id > after && r.h_id <= upto),
        ))
    }

    async fn insert_new_materials(&mut self, rows: &[MaterialAttributes]) -> Result<u64> {
        let mut s = self.state.lock();
        let mut inserted = 0;
        for row in rows {
            if !s.unique.contains_key(&row.material_name) {
                s.unique.insert(row.material_name.clone(), row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn rebuild_unique_materials(&mut self) -> Result<u64> {
        let mut s = self.state.lock();
        let rebuilt: BTreeMap<String, MaterialAttributes> = latest_attributes(&s.consumption)
            .into_iter()
            .map(|row| (row.material_name.clone(), row))
            .collect();
        s.unique = rebuilt;
        Ok(s.unique.len() as u64)
    }

    async fn balance_deltas(
        &mut self,
        after: i64,
        upto: i64,
        outbound_document_type: &str,
    ) -> Result<Vec<BalanceDelta>> {
        let s = self.state.lock();
        Ok(accumulate_deltas(
            s.movements_in(after, upto),
            &s.seats,
            outbound_document_type,
        ))
    }

    async fn apply_balance_deltas(
        &mut self,
        deltas: &[BalanceDelta],
        name: &str,
        upto: i64,
    ) -> Result<SyncState> {
        let mut s = self.state.lock();
        if s.fail_balance_apply {
            bail!("balance transaction rolled back");
        }
        apply_deltas(&mut s.balances, deltas);
        let entry = s.watermarks.entry(name.to_string()).or_insert(upto);
        *entry = (*entry).max(upto);
        s.state(name).ok_or_else(|| anyhow::anyhow!("watermark {name} vanished"))
    }

    async fn clear_balances(&mut self) -> Result<u64> {
        let mut s = self.state.lock();
        let before = s.balances.len();
        let seats = s.seats.clone();
        s.balances.retain(|key, _| seats.contains(&key.warehouse));
        Ok((before - s.balances.len()) as u64)
    }

    async fn balances(&mut self, materials: Option<&[String]>) -> Result<Vec<BalanceRow>> {
        let s = self.state.lock();
        Ok(s.balances
            .iter()
            .filter(|(key, _)| materials.map_or(true, |m| m.contains(&key.material)))
            .map(|(key, value)| BalanceRow {
                key: key.clone(),
                current_stock: *value,
            })
            .collect())
    }

    async fn touched_materials(&mut self, after: i64, upto: i64) -> Result<Vec<String>> {
        let s = self.state.lock();
        let touched: BTreeSet<String> = s
            .movements_in(after, upto)
            .filter(|r| !s.is_seat(r.company_code.as_deref()))
            .filter_map(|r| r.material_name.clone())
            .collect();
        Ok(touched.into_iter().collect())
    }

    async fn variant_mappings(
        &mut self,
        materials: Option<&[String]>,
    ) -> Result<Vec<VariantMapping>> {
        let s = self.state.lock();
        Ok(s.mappings
            .iter()
            .filter(|m| materials.map_or(true, |list| list.contains(&m.stock_adi)))
            .cloned()
            .collect())
    }

    async fn variant_rows(&mut self) -> Result<Vec<VariantRow>> {
        Ok(self.state.lock().variants.clone())
    }

    async fn replace_variant_rows(
        &mut self,
        materials: &[String],
        rows: &[VariantRow],
    ) -> Result<()> {
        let mut s = self.state.lock();
        s.variants.retain(|row| !materials.contains(&row.stock_adi));
        s.variants.extend(rows.iter().cloned());
        s.variants.sort_by_key(VariantRow::key);
        Ok(())
    }

    async fn clear_variant_rows(&mut self) -> Result<u64> {
        let mut s = self.state.lock();
        let count = s.variants.len() as u64;
        s.variants.clear();
        Ok(count)
    }

    async fn export_table(&mut self, table: Table, sink: &mut BackupWriter) -> Result<u64> {
        let bytes = {
            let s = self.state.lock();
            match table {
                Table::BomConsumption => to_json_lines(&s.consumption)?,
                Table::StockMovements => to_json_lines(&s.movements)?,
                Table::OpenOrderMovements => to_json_lines(&s.open_orders)?,
                Table::StockMaster => to_json_lines(&s.stock_master)?,
                other => return Err(StorageError::NotBackupable(other.name()).into()),
            }
        };
        sink.write_chunk(&bytes).await?;
        Ok(sink.bytes_written())
    }

    async fn restore_table(&mut self, table: Table, source: &mut BackupReader) -> Result<u64> {
        let bytes = source.read_to_end().await?;
        let mut s = self.state.lock();
        let restored = match table {
            Table::BomConsumption => {
                s.consumption = from_json_lines(&bytes)?;
                s.consumption.len()
            }
            Table::StockMovements => {
                s.movements = from_json_lines(&bytes)?;
                s.movements.len()
            }
            Table::OpenOrderMovements => {
                s.open_orders = from_json_lines(&bytes)?;
                s.open_orders.len()
            }
            Table::StockMaster => {
                s.stock_master = from_json_lines(&bytes)?;
                s.stock_master.len()
            }
            other => return Err(StorageError::NotBackupable(other.name()).into()),
        };
        Ok(restored as u64)
    }

    async fn execute_script(&mut self, script: &SqlScript) -> Result<()> {
        let mut s = self.state.lock();
        for statement in &script.statements {
            if let Some(needle) = s.fail_statement.as_deref() {
                if statement.sql.contains(needle) {
                    bail!("{}: statement failed: {}", script.name, statement.sql);
                }
            }
            s.executed.push(statement.sql.clone());
        }
        Ok(())
    }
}
