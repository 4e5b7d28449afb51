use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use stockwise_core::{StreamKind, SyncState, Table};
use stockwise_source::{scoped_endpoint, EndpointSwitch, SourceEndpoint, SourceSystem};
use stockwise_storage::{BackupStore, Destination, SqlScript};
use tokio::process::Command;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregates::{AggregateMaintainer, RefreshOutcome};
use crate::config::SyncConfig;
use crate::engine::{ConsumptionStream, IncrementalEngine, MovementStream, SyncOutcome};
use crate::full_load::{FullLoadEngine, FullLoadReport};
use crate::schedule::{Clock, IntervalJob, SchedulerState, WeeklyMarker};
use crate::verify::{verify_stock, StockVerification};

/// Runs the external forecasting command through `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct ForecastRunner {
    command: Option<String>,
}

impl ForecastRunner {
    pub fn new(command: Option<String>) -> Self {
        Self {
            command: command.filter(|c| !c.trim().is_empty()),
        }
    }

    /// `Ok(false)` when no command is configured.
    pub async fn run(&self) -> Result<bool> {
        let Some(command) = self.command.as_deref() else {
            warn!("no forecast command configured; forecast skipped");
            return Ok(false);
        };
        info!(command, "starting forecast");
        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .status()
            .await
            .with_context(|| format!("spawning forecast command `{command}`"))?;
        if !status.success() {
            bail!("forecast command `{command}` failed with {status}");
        }
        info!("forecast finished");
        Ok(true)
    }
}

/// Results of one incremental pass over both history streams and the aggregates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncrementalReport {
    pub consumption: SyncOutcome,
    pub movements: SyncOutcome,
    pub aggregates: Vec<RefreshOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionReport {
    pub destination: Option<String>,
    pub source: Option<String>,
}

impl ConnectionReport {
    pub fn is_ok(&self) -> bool {
        self.destination.is_none() && self.source.is_none()
    }
}

/// Owns both databases and every engine; each run mode of the binary is one method.
pub struct Orchestrator {
    config: SyncConfig,
    source: Box<dyn SourceSystem>,
    dest: Box<dyn Destination>,
    clock: Arc<dyn Clock>,
    state: SchedulerState,
    marker: WeeklyMarker,
    incremental: IncrementalEngine,
    full_load: FullLoadEngine,
    aggregates: AggregateMaintainer,
    forecast: ForecastRunner,
}

impl EndpointSwitch for Orchestrator {
    fn switch_endpoint(&mut self, endpoint: SourceEndpoint) -> SourceEndpoint {
        self.source.switch_endpoint(endpoint)
    }
}

impl Orchestrator {
    pub fn new(
        config: SyncConfig,
        source: Box<dyn SourceSystem>,
        dest: Box<dyn Destination>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let backups = config
            .backup_dir
            .as_ref()
            .map(|dir| BackupStore::new(dir, config.backup_keep));
        let state = SchedulerState {
            open_orders: IntervalJob::every(config.open_order_interval),
            core_refresh: IntervalJob::every(
                config
                    .core_refresh_sql
                    .as_ref()
                    .and(config.core_refresh_interval),
            ),
            dashboard: IntervalJob::every(config.dashboard_sql.as_ref().and(config.dashboard_interval)),
            ..SchedulerState::default()
        };
        Self {
            marker: WeeklyMarker::new(config.weekly_marker.clone()),
            incremental: IncrementalEngine::new(config.batch_size),
            full_load: FullLoadEngine::new(
                config.batch_size,
                config.full_range,
                backups,
                Arc::clone(&clock),
            ),
            aggregates: AggregateMaintainer::new(config.outbound_document_type.clone()),
            forecast: ForecastRunner::new(config.forecast_command.clone()),
            config,
            source,
            dest,
            clock,
            state,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn scheduler_state(&self) -> &SchedulerState {
        &self.state
    }

    /// Creates missing schemas and tables.
    pub async fn prepare(&mut self) -> Result<()> {
        self.dest
            .ensure_schema()
            .await
            .context("bootstrapping destination schema")
    }

    /// Stored watermark, or the destination max for a stream never synced before.
    async fn history_watermark(&mut self, stream: StreamKind) -> Result<i64> {
        let Some(name) = stream.watermark_name() else {
            bail!("{stream} has no watermark");
        };
        match self.dest.watermark(name).await? {
            Some(state) => Ok(state.last_watermark),
            None => {
                let max = self.dest.max_key(stream).await?;
                debug!(stream = %stream, watermark = max, "no stored watermark; using table max");
                Ok(max)
            }
        }
    }

    pub async fn sync_consumption(&mut self) -> Result<SyncOutcome> {
        let last = self.history_watermark(StreamKind::BomConsumption).await?;
        self.incremental
            .sync_stream(&ConsumptionStream, self.source.as_mut(), self.dest.as_mut(), last)
            .await
    }

    pub async fn sync_movements(&mut self) -> Result<SyncOutcome> {
        let last = self.history_watermark(StreamKind::StockMovements).await?;
        self.incremental
            .sync_stream(&MovementStream, self.source.as_mut(), self.dest.as_mut(), last)
            .await
    }

    /// Syncs both history streams, then brings every aggregate up to date. Timed jobs
    /// run afterwards when `run_timed_jobs` is set.
    pub async fn run_incremental(&mut self, run_timed_jobs: bool) -> Result<IncrementalReport> {
        let consumption = self.sync_consumption().await?;
        if consumption.advanced() {
            let mapping = self.config.mapping_sql.clone();
            self.run_sql_file("mapping", mapping).await?;
        }
        let movements = self.sync_movements().await?;
        let aggregates = self.aggregates.refresh_all(self.dest.as_mut()).await?;
        if run_timed_jobs {
            self.run_timed_jobs().await;
        }
        Ok(IncrementalReport {
            consumption,
            movements,
            aggregates,
        })
    }

    /// Fires each interval job that is due. A failing job is logged and retried on the
    /// next check.
    pub async fn run_timed_jobs(&mut self) {
        let now = self.clock.now();

        if self.state.open_orders.is_due(now) {
            match self
                .full_load
                .refresh_open_orders(self.source.as_mut(), self.dest.as_mut())
                .await
            {
                Ok(_) => self.state.open_orders.mark(now),
                Err(err) => warn!(error = %format!("{err:#}"), "open-order snapshot failed"),
            }
        }

        if self.state.core_refresh.is_due(now) {
            let script = self.config.core_refresh_sql.clone();
            match self.run_sql_file("core refresh", script).await {
                Ok(_) => self.state.core_refresh.mark(now),
                Err(err) => warn!(error = %format!("{err:#}"), "core refresh failed"),
            }
        }

        if self.state.dashboard.is_due(now) {
            let script = self.config.dashboard_sql.clone();
            match self.run_sql_file("dashboard", script).await {
                Ok(_) => self.state.dashboard.mark(now),
                Err(err) => warn!(error = %format!("{err:#}"), "dashboard refresh failed"),
            }
        }
    }

    /// Runs a configured script. Returns `Ok(false)` when it is unset or absent on disk.
    async fn run_sql_file(&mut self, label: &str, path: Option<PathBuf>) -> Result<bool> {
        let Some(path) = path else {
            debug!(script = label, "not configured");
            return Ok(false);
        };
        let resolved = self.config.resolve_script(&path);
        if !tokio::fs::try_exists(&resolved).await.unwrap_or(false) {
            warn!(script = label, path = %resolved.display(), "script not found; skipped");
            return Ok(false);
        }
        let script = SqlScript::load(&resolved).await?;
        if script.is_empty() {
            debug!(script = label, "script has no statements");
            return Ok(true);
        }
        self.dest
            .execute_script(&script)
            .await
            .with_context(|| format!("running {label} script {}", resolved.display()))?;
        info!(script = label, statements = script.statements.len(), "script applied");
        Ok(true)
    }

    async fn load_consumption_history(&mut self) -> Result<FullLoadReport> {
        self.full_load
            .load_history(&ConsumptionStream, self.source.as_mut(), self.dest.as_mut())
            .await
    }

    async fn load_movement_history(&mut self) -> Result<FullLoadReport> {
        self.full_load
            .load_history(&MovementStream, self.source.as_mut(), self.dest.as_mut())
            .await
    }

    pub async fn load_stock_master_only(&mut self) -> Result<u64> {
        self.full_load
            .load_stock_master(self.source.as_mut(), self.dest.as_mut())
            .await
    }

    async fn rebuild_balances(&mut self) -> Result<()> {
        self.aggregates
            .rebuild_running_balance(self.dest.as_mut())
            .await?;
        self.aggregates
            .rebuild_variant_balance(self.dest.as_mut())
            .await?;
        Ok(())
    }

    /// Reloads both history streams and the stock master from the full-history endpoint,
    /// then rebuilds every aggregate.
    pub async fn run_full(&mut self, include_monthly: bool) -> Result<()> {
        {
            let mut scope = scoped_endpoint(self, SourceEndpoint::Full);
            scope.load_consumption_history().await?;
            scope.load_movement_history().await?;
            scope.load_stock_master_only().await?;
        }
        self.rebuild_balances().await?;
        self.aggregates.rebuild_unique(self.dest.as_mut()).await?;
        if include_monthly {
            self.run_monthly_scripts().await?;
        }
        let mapping = self.config.mapping_sql.clone();
        self.run_sql_file("mapping", mapping).await?;
        info!("full reload complete");
        Ok(())
    }

    /// Reloads movements and the stock master only, rebuilds the balances, then runs the
    /// monthly seat script and, once the unique-material table exists, the mapping script.
    pub async fn run_full_stock_only(&mut self) -> Result<()> {
        {
            let mut scope = scoped_endpoint(self, SourceEndpoint::Full);
            scope.load_movement_history().await?;
            scope.load_stock_master_only().await?;
        }
        self.rebuild_balances().await?;
        self.run_monthly_scripts().await?;

        let mapping = self.config.mapping_sql.clone();
        if mapping.is_some() {
            if self.dest.table_exists(Table::UniqueMaterials).await? {
                self.run_sql_file("mapping", mapping).await?;
            } else {
                warn!(
                    table = Table::UniqueMaterials.name(),
                    "unique-material table missing; mapping script skipped"
                );
            }
        }
        info!("stock reload complete");
        Ok(())
    }

    /// Runs the weekly job guarded by the crash marker. On failure the marker stays so the
    /// next start retries.
    pub async fn run_weekly(&mut self) -> Result<()> {
        let started_at = self.clock.now();
        self.state.last_weekly = Some(started_at);
        self.marker.write(started_at).await?;

        let result = self
            .weekly_pipeline()
            .instrument(info_span!("weekly_job"))
            .await;
        match result {
            Ok(()) => {
                self.marker.clear().await?;
                info!("weekly job complete");
                Ok(())
            }
            Err(err) => {
                error!(
                    error = %format!("{err:#}"),
                    marker = %self.marker.path().display(),
                    "weekly job failed; marker kept for retry"
                );
                Err(err)
            }
        }
    }

    async fn weekly_pipeline(&mut self) -> Result<()> {
        {
            let mut scope = scoped_endpoint(self, SourceEndpoint::Full);
            scope.load_consumption_history().await?;
        }
        self.sync_consumption().await?;
        self.load_stock_master_only().await?;
        self.aggregates.rebuild_unique(self.dest.as_mut()).await?;
        self.run_forecast_pipeline().await
    }

    /// Pre-forecast script, the forecast command, post-forecast script.
    pub async fn run_forecast_pipeline(&mut self) -> Result<()> {
        let pre = self.config.weekly_pre_sql.clone();
        self.run_sql_file("weekly pre-forecast", pre).await?;
        self.forecast.run().await?;
        let post = self.config.weekly_post_sql.clone();
        self.run_sql_file("weekly post-forecast", post).await?;
        Ok(())
    }

    /// Open-order snapshot (when its timer is enabled), core refresh, dashboard refresh.
    pub async fn run_post_weekly_refreshes(&mut self) -> Result<()> {
        if self.config.open_order_interval.is_some() {
            self.full_load
                .refresh_open_orders(self.source.as_mut(), self.dest.as_mut())
                .await?;
        }
        let core = self.config.core_refresh_sql.clone();
        self.run_sql_file("core refresh", core).await?;
        let dashboard = self.config.dashboard_sql.clone();
        self.run_sql_file("dashboard", dashboard).await?;
        Ok(())
    }

    /// First-time load: full reload without the monthly script, then everything
    /// `run_bootstrap_continue` does.
    pub async fn run_bootstrap(&mut self) -> Result<()> {
        info!("bootstrap starting");
        self.run_full(false).await?;
        self.run_bootstrap_continue().await?;
        info!("bootstrap complete");
        Ok(())
    }

    /// Resumes a bootstrap whose full reload already finished: live catch-up, monthly
    /// seat script, forecast pipeline, post-weekly refreshes.
    pub async fn run_bootstrap_continue(&mut self) -> Result<()> {
        {
            let mut scope = scoped_endpoint(self, SourceEndpoint::Live);
            scope.run_incremental(false).await?;
        }
        self.finish_bootstrap().await
    }

    pub async fn run_bootstrap_stock_only(&mut self) -> Result<()> {
        self.run_full_stock_only().await?;
        self.run_forecast_pipeline().await?;
        self.run_post_weekly_refreshes().await?;
        info!("stock-only bootstrap complete");
        Ok(())
    }

    /// Completes a load from the live endpoint without any truncation: incremental
    /// catch-up and stock-master reload, then the bootstrap tail.
    pub async fn complete_live(&mut self) -> Result<()> {
        {
            let mut scope = scoped_endpoint(self, SourceEndpoint::Live);
            scope.run_incremental(false).await?;
            scope.load_stock_master_only().await?;
        }
        self.finish_bootstrap().await
    }

    async fn finish_bootstrap(&mut self) -> Result<()> {
        self.run_monthly_scripts().await?;
        self.run_forecast_pipeline().await?;
        self.run_post_weekly_refreshes().await
    }

    pub async fn run_monthly(&mut self) -> Result<()> {
        self.state.last_monthly = Some(self.clock.now());
        self.run_monthly_scripts()
            .instrument(info_span!("monthly_job"))
            .await
    }

    async fn run_monthly_scripts(&mut self) -> Result<()> {
        let seat = self.config.monthly_seat_sql.clone();
        self.run_sql_file("monthly seat", seat).await?;
        Ok(())
    }

    /// Runs the selected refresh scripts on demand.
    pub async fn run_scripts(&mut self, pre: bool, post: bool, dashboard: bool) -> Result<()> {
        if pre {
            let script = self.config.weekly_pre_sql.clone();
            self.run_sql_file("weekly pre-forecast", script).await?;
        }
        if post {
            let script = self.config.weekly_post_sql.clone();
            self.run_sql_file("weekly post-forecast", script).await?;
        }
        if dashboard {
            let script = self.config.dashboard_sql.clone();
            self.run_sql_file("dashboard", script).await?;
        }
        Ok(())
    }

    pub async fn check_connections(&mut self) -> ConnectionReport {
        let destination = self.dest.ping().await.err().map(|e| format!("{e:#}"));
        let source = self.source.ping().await.err().map(|e| e.to_string());
        ConnectionReport {
            destination,
            source,
        }
    }

    pub async fn status(&mut self) -> Result<Vec<SyncState>> {
        self.dest.watermarks().await
    }

    pub async fn verify_stock(&mut self) -> Result<StockVerification> {
        verify_stock(self.dest.as_mut(), &self.config.outbound_document_type).await
    }

    /// Retries a weekly job interrupted by a crash. Returns whether one was found.
    /// Always `false` while the weekly job is disabled.
    pub async fn recover_interrupted_weekly(&mut self) -> Result<bool> {
        if self.config.weekly.is_none() || !self.marker.exists().await {
            return Ok(false);
        }
        warn!(marker = %self.marker.path().display(), "interrupted weekly job found; retrying");
        self.run_weekly().await?;
        Ok(true)
    }

    /// One scheduler cycle: incremental pass and timed jobs, then the weekly and monthly
    /// jobs when their occurrence is due.
    pub async fn run_cycle(&mut self) -> Result<()> {
        self.run_incremental(true).await?;

        let now = self.clock.now();
        if let Some(scheduled) = self
            .config
            .weekly
            .and_then(|weekly| weekly.due(now, self.state.last_weekly))
        {
            info!(scheduled = %scheduled, "weekly job due");
            self.run_weekly().await?;
        }
        if let Some(scheduled) = self
            .config
            .monthly
            .and_then(|monthly| monthly.due(now, self.state.last_monthly))
        {
            info!(scheduled = %scheduled, "monthly job due");
            self.run_monthly().await?;
        }
        Ok(())
    }

    /// Scheduler loop. Cycle failures are logged and the source connection dropped; the
    /// loop ends between cycles once `shutdown` resolves.
    pub async fn run_forever<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = std::pin::pin!(shutdown);

        if let Err(err) = self.recover_interrupted_weekly().await {
            error!(error = %format!("{err:#}"), "weekly recovery failed");
            self.source.invalidate();
        }

        loop {
            let cycle_id = Uuid::new_v4();
            let span = info_span!("cycle", cycle_id = %cycle_id);
            if let Err(err) = self.run_cycle().instrument(span).await {
                error!(cycle_id = %cycle_id, error = %format!("{err:#}"), "cycle failed");
                self.source.invalidate();
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.sync_interval) => {}
                _ = &mut shutdown => {
                    info!("shutdown requested; scheduler stopped");
                    break;
                }
            }
        }
        Ok(())
    }
}
