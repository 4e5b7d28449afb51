use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use stockwise_core::{BatchReport, LoadRange, StreamKind, Table, Window};
use stockwise_source::SourceSystem;
use stockwise_storage::{BackupArtifact, BackupStore, Destination, RowBatch};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::engine::{drain_keys, KeyedStream};
use crate::schedule::Clock;

/// Progress of a destructive reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    Idle,
    BackedUp,
    Truncated,
    Loading,
    Complete,
    Restoring,
    RestoredFailed,
}

impl LoadPhase {
    pub fn can_advance_to(self, next: LoadPhase) -> bool {
        use LoadPhase::*;
        matches!(
            (self, next),
            (Idle, BackedUp)
                | (Idle, Truncated)
                | (BackedUp, Truncated)
                | (Truncated, Loading)
                | (Loading, Complete)
                | (BackedUp, Restoring)
                | (Truncated, Restoring)
                | (Loading, Restoring)
                | (Restoring, RestoredFailed)
        )
    }
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadPhase::Idle => "idle",
            LoadPhase::BackedUp => "backed_up",
            LoadPhase::Truncated => "truncated",
            LoadPhase::Loading => "loading",
            LoadPhase::Complete => "complete",
            LoadPhase::Restoring => "restoring",
            LoadPhase::RestoredFailed => "restored_failed",
        };
        f.write_str(name)
    }
}

struct PhaseTracker {
    table: Table,
    phase: LoadPhase,
    history: Vec<LoadPhase>,
}

impl PhaseTracker {
    fn new(table: Table) -> Self {
        Self {
            table,
            phase: LoadPhase::Idle,
            history: vec![LoadPhase::Idle],
        }
    }

    fn advance(&mut self, next: LoadPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal load transition {} -> {next}",
            self.phase
        );
        debug!(table = self.table.name(), from = %self.phase, to = %next, "load phase");
        self.phase = next;
        self.history.push(next);
    }
}

/// Summary of a completed history reload.
#[derive(Debug, Clone, PartialEq)]
pub struct FullLoadReport {
    pub stream: StreamKind,
    pub windows: usize,
    pub backup: Option<BackupArtifact>,
    pub watermark: i64,
    pub report: BatchReport,
    pub phases: Vec<LoadPhase>,
}

/// Truncate-and-reload of whole tables, windowed for history streams.
pub struct FullLoadEngine {
    batch_size: usize,
    range: LoadRange,
    backups: Option<BackupStore>,
    clock: Arc<dyn Clock>,
}

impl FullLoadEngine {
    pub fn new(
        batch_size: usize,
        range: LoadRange,
        backups: Option<BackupStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            batch_size: batch_size.max(1),
            range,
            backups,
            clock,
        }
    }

    pub fn range(&self) -> LoadRange {
        self.range
    }

    /// Reloads a history stream window by window. The current table contents are backed
    /// up first when a backup directory is configured and restored if the load fails.
    pub async fn load_history<S: KeyedStream>(
        &self,
        stream: &S,
        source: &mut dyn SourceSystem,
        dest: &mut dyn Destination,
    ) -> Result<FullLoadReport> {
        let kind = stream.kind();
        let span = info_span!("full_load", stream = %kind);
        self.load_history_inner(stream, source, dest)
            .instrument(span)
            .await
    }

    async fn load_history_inner<S: KeyedStream>(
        &self,
        stream: &S,
        source: &mut dyn SourceSystem,
        dest: &mut dyn Destination,
    ) -> Result<FullLoadReport> {
        let kind = stream.kind();
        let table = kind.table();
        let name = kind
            .watermark_name()
            .with_context(|| format!("{kind} is not a history stream"))?;
        let mut phases = PhaseTracker::new(table);

        let backup = match &self.backups {
            Some(store) => {
                let artifact = self.backup(store, dest, table).await?;
                phases.advance(LoadPhase::BackedUp);
                Some(artifact)
            }
            None => {
                warn!("no backup directory configured; reload cannot be undone");
                None
            }
        };

        let windows = self.range.windows();
        info!(
            windows = windows.len(),
            window_start = %self.range.start,
            window_end = %self.range.end,
            "starting full load"
        );

        let loaded = self
            .truncate_and_load(stream, source, dest, &windows, &mut phases)
            .await;
        let report = match loaded {
            Ok(report) => report,
            Err(err) => {
                error!(error = %format!("{err:#}"), "full load failed");
                if let (Some(store), Some(artifact)) = (&self.backups, &backup) {
                    phases.advance(LoadPhase::Restoring);
                    match self.restore(store, dest, table, artifact).await {
                        Ok(rows) => info!(rows, path = %artifact.path.display(), "previous contents restored"),
                        Err(restore_err) => error!(
                            error = %format!("{restore_err:#}"),
                            path = %artifact.path.display(),
                            "restore failed; table left as is"
                        ),
                    }
                    phases.advance(LoadPhase::RestoredFailed);
                }
                return Err(err);
            }
        };

        let max = dest.max_key(kind).await?;
        let state = dest.reset_watermark(name, max).await?;
        phases.advance(LoadPhase::Complete);
        info!(
            rows = report.rows_written,
            skipped = report.skipped.len(),
            watermark = state.last_watermark,
            "full load complete"
        );

        Ok(FullLoadReport {
            stream: kind,
            windows: windows.len(),
            backup,
            watermark: state.last_watermark,
            report,
            phases: phases.history,
        })
    }

    async fn truncate_and_load<S: KeyedStream>(
        &self,
        stream: &S,
        source: &mut dyn SourceSystem,
        dest: &mut dyn Destination,
        windows: &[Window],
        phases: &mut PhaseTracker,
    ) -> Result<BatchReport> {
        let table = stream.kind().table();
        dest.truncate(table)
            .await
            .with_context(|| format!("truncating {}", table.name()))?;
        phases.advance(LoadPhase::Truncated);
        phases.advance(LoadPhase::Loading);

        let mut total = BatchReport::default();
        for window in windows {
            source
                .reconnect()
                .await
                .with_context(|| format!("reconnecting before window {window}"))?;
            let keys = stream
                .window_keys(source, window)
                .await
                .with_context(|| format!("listing keys for window {window}"))?;
            info!(
                window_start = %window.start,
                window_end = %window.end,
                keys = keys.len(),
                "loading window"
            );
            let report = drain_keys(stream, source, dest, keys, self.batch_size, None).await?;
            total.merge(report);
        }
        Ok(total)
    }

    async fn backup(
        &self,
        store: &BackupStore,
        dest: &mut dyn Destination,
        table: Table,
    ) -> Result<BackupArtifact> {
        let mut writer = store.begin(table.name(), self.clock.now()).await?;
        if let Err(err) = dest.export_table(table, &mut writer).await {
            writer.discard().await;
            return Err(err).with_context(|| format!("backing up {}", table.name()));
        }
        let artifact = writer.finish().await?;
        info!(path = %artifact.path.display(), bytes = artifact.bytes, "backup written");
        for removed in store.prune(table.name()).await? {
            debug!(path = %removed.display(), "pruned old backup");
        }
        Ok(artifact)
    }

    async fn restore(
        &self,
        store: &BackupStore,
        dest: &mut dyn Destination,
        table: Table,
        artifact: &BackupArtifact,
    ) -> Result<u64> {
        let mut reader = store.open(artifact).await?;
        dest.restore_table(table, &mut reader).await
    }

    /// Full-replace reload of the stock master dimension. No backup: a failure leaves the
    /// table empty until the next successful run.
    pub async fn load_stock_master(
        &self,
        source: &mut dyn SourceSystem,
        dest: &mut dyn Destination,
    ) -> Result<u64> {
        dest.truncate(Table::StockMaster).await?;
        let rows = source
            .stock_master()
            .await
            .context("fetching stock master")?;
        let written = self
            .append_chunked(dest, rows, RowBatch::StockMaster)
            .await?;
        info!(stream = %StreamKind::StockMaster, rows = written, "stock master reloaded");
        Ok(written)
    }

    /// Replaces the open-order snapshot. Returns `None` when the table does not exist.
    pub async fn refresh_open_orders(
        &self,
        source: &mut dyn SourceSystem,
        dest: &mut dyn Destination,
    ) -> Result<Option<u64>> {
        if !dest.table_exists(Table::OpenOrderMovements).await? {
            warn!(
                table = Table::OpenOrderMovements.name(),
                "open-order table missing; snapshot skipped"
            );
            return Ok(None);
        }
        let rows = source.open_orders().await.context("fetching open orders")?;
        dest.truncate(Table::OpenOrderMovements).await?;
        let written = self
            .append_chunked(dest, rows, RowBatch::OpenOrders)
            .await?;
        info!(stream = %StreamKind::OpenOrders, rows = written, "open orders refreshed");
        Ok(Some(written))
    }

    async fn append_chunked<R>(
        &self,
        dest: &mut dyn Destination,
        rows: Vec<R>,
        wrap: fn(Vec<R>) -> RowBatch,
    ) -> Result<u64> {
        let mut written = 0;
        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            let chunk: Vec<R> = rows.by_ref().take(self.batch_size).collect();
            written += dest.append(wrap(chunk)).await?;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ConsumptionStream, MovementStream};
    use crate::testing::{consumption_row, day, movement, MemoryDestination, MemorySource, PinnedClock};
    use stockwise_core::{StockMasterRow, Value, STOCK_MASTER_COLUMNS};
    use tempfile::tempdir;

    fn range() -> LoadRange {
        LoadRange {
            start: day(2024, 1, 1),
            end: day(2024, 12, 31),
            window_months: 6,
        }
    }

    fn engine(backups: Option<BackupStore>) -> FullLoadEngine {
        FullLoadEngine::new(2, range(), backups, Arc::new(PinnedClock::at(2024, 12, 31, 3, 0)))
    }

    #[tokio::test]
    async fn history_reload_replaces_table_and_resets_watermark() {
        let (mut source, source_state) = MemorySource::new();
        {
            let mut state = source_state.lock();
            state.add_consumption(10, day(2024, 2, 1), vec![consumption_row(10, "KUMAŞ", 2.0)]);
            state.add_consumption(
                11,
                day(2024, 8, 1),
                vec![consumption_row(11, "İPLİK", 1.0), consumption_row(11, "DÜĞME", 4.0)],
            );
        }
        let (mut dest, dest_state) = MemoryDestination::new();
        {
            let mut state = dest_state.lock();
            state.consumption.push(consumption_row(99, "ESKİ", 1.0));
            state.set_watermark("raw_bom_consumption", 99);
        }

        let report = engine(None)
            .load_history(&ConsumptionStream, &mut source, &mut dest)
            .await
            .expect("full load");

        assert_eq!(report.windows, 2);
        assert_eq!(report.report.rows_written, 3);
        assert_eq!(report.watermark, 11);
        assert_eq!(
            report.phases,
            vec![LoadPhase::Idle, LoadPhase::Truncated, LoadPhase::Loading, LoadPhase::Complete]
        );
        let state = dest_state.lock();
        assert!(state.consumption.iter().all(|row| row.h_id != 99));
        assert_eq!(state.watermark_value("raw_bom_consumption"), Some(11));
        assert_eq!(source_state.lock().reconnects, 2);
    }

    #[tokio::test]
    async fn failed_window_restores_backup_and_returns_original_error() {
        let dir = tempdir().expect("tempdir");
        let store = BackupStore::new(dir.path(), 2);
        let (mut source, source_state) = MemorySource::new();
        source_state.lock().fail_windows = true;
        let (mut dest, dest_state) = MemoryDestination::new();
        {
            let mut state = dest_state.lock();
            state.movements.push(movement(5, "GİRİŞ", "KUMAŞ", "ANA DEPO", "MT", 3.0));
            state.movements.push(movement(6, "Depo Çıkış", "KUMAŞ", "ANA DEPO", "MT", 1.0));
        }

        let err = engine(Some(store.clone()))
            .load_history(&MovementStream, &mut source, &mut dest)
            .await
            .expect_err("window failure aborts the load");

        assert!(format!("{err:#}").contains("listing keys for window"));
        let artifacts = store.artifacts("raw_stock_movements").await.expect("list");
        assert_eq!(artifacts.len(), 1);
        let state = dest_state.lock();
        assert_eq!(state.movements.len(), 2);
        assert_eq!(state.movements[0].h_id, 5);
    }

    #[tokio::test]
    async fn failing_key_is_skipped_without_aborting() {
        let (mut source, source_state) = MemorySource::new();
        {
            let mut state = source_state.lock();
            state.add_consumption(1, day(2024, 3, 1), vec![consumption_row(1, "KUMAŞ", 1.0)]);
            state.add_consumption(2, day(2024, 3, 2), vec![consumption_row(2, "KUMAŞ", 1.0)]);
            state.failing_keys.insert(2);
        }
        let (mut dest, _) = MemoryDestination::new();

        let report = engine(None)
            .load_history(&ConsumptionStream, &mut source, &mut dest)
            .await
            .expect("load");

        assert_eq!(report.report.succeeded, vec![1]);
        assert_eq!(report.report.skipped.len(), 1);
        assert_eq!(report.report.skipped[0].key, 2);
    }

    #[tokio::test]
    async fn stock_master_is_truncated_then_reloaded() {
        let (mut source, source_state) = MemorySource::new();
        let values: Vec<Value> = STOCK_MASTER_COLUMNS
            .iter()
            .enumerate()
            .map(|(idx, _)| if idx == 0 { Value::Int(7) } else { Value::Null })
            .collect();
        let row = StockMasterRow::from_values(values).expect("row with id");
        source_state.lock().stock_master = vec![row.clone(), row.clone(), row];
        let (mut dest, dest_state) = MemoryDestination::new();

        let written = engine(None)
            .load_stock_master(&mut source, &mut dest)
            .await
            .expect("reload");

        assert_eq!(written, 3);
        let state = dest_state.lock();
        assert_eq!(state.stock_master.len(), 3);
        assert_eq!(state.appends, 2);
    }

    #[tokio::test]
    async fn open_orders_skip_when_table_missing() {
        let (mut source, _) = MemorySource::new();
        let (mut dest, dest_state) = MemoryDestination::new();
        dest_state.lock().missing.insert(Table::OpenOrderMovements);

        let refreshed = engine(None)
            .refresh_open_orders(&mut source, &mut dest)
            .await
            .expect("refresh");
        assert_eq!(refreshed, None);
    }

    #[test]
    fn phase_transitions_follow_the_load_lifecycle() {
        assert!(LoadPhase::Idle.can_advance_to(LoadPhase::BackedUp));
        assert!(LoadPhase::Loading.can_advance_to(LoadPhase::Restoring));
        assert!(!LoadPhase::Complete.can_advance_to(LoadPhase::Restoring));
        assert!(!LoadPhase::Idle.can_advance_to(LoadPhase::Loading));
    }
}
