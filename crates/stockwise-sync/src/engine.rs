use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use stockwise_core::{
    BatchReport, ConsumptionRow, MovementHeader, MovementRow, StreamKind, Window,
};
use stockwise_source::{SourceError, SourceSystem};
use stockwise_storage::{Destination, RowBatch};
use tracing::{debug, info, warn};

/// How a stream's watermark moves after an incremental pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkSource {
    /// Highest key whose rows were committed, checkpointed after every batch.
    CommittedKeys,
    /// Highest key present in the destination once the pass is done.
    DestinationMax,
}

/// A history stream fetched key by key: list keys, then fetch each key's detail rows.
#[async_trait]
pub trait KeyedStream: Send + Sync {
    type Key: Send + Sync;
    type Row: Send;

    fn kind(&self) -> StreamKind;

    fn watermark_source(&self) -> WatermarkSource;

    fn key_id(key: &Self::Key) -> i64;

    async fn window_keys(
        &self,
        source: &mut dyn SourceSystem,
        window: &Window,
    ) -> Result<Vec<Self::Key>, SourceError>;

    async fn keys_since(
        &self,
        source: &mut dyn SourceSystem,
        after: i64,
    ) -> Result<Vec<Self::Key>, SourceError>;

    async fn detail(
        &self,
        source: &mut dyn SourceSystem,
        key: &Self::Key,
    ) -> Result<Vec<Self::Row>, SourceError>;

    fn into_batch(rows: Vec<Self::Row>) -> RowBatch;
}

/// Production BOM consumption, keyed by document id.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsumptionStream;

#[async_trait]
impl KeyedStream for ConsumptionStream {
    type Key = i64;
    type Row = ConsumptionRow;

    fn kind(&self) -> StreamKind {
        StreamKind::BomConsumption
    }

    fn watermark_source(&self) -> WatermarkSource {
        WatermarkSource::CommittedKeys
    }

    fn key_id(key: &i64) -> i64 {
        *key
    }

    async fn window_keys(
        &self,
        source: &mut dyn SourceSystem,
        window: &Window,
    ) -> Result<Vec<i64>, SourceError> {
        source.consumption_keys(window).await
    }

    async fn keys_since(
        &self,
        source: &mut dyn SourceSystem,
        after: i64,
    ) -> Result<Vec<i64>, SourceError> {
        source.consumption_keys_since(after).await
    }

    async fn detail(
        &self,
        source: &mut dyn SourceSystem,
        key: &i64,
    ) -> Result<Vec<ConsumptionRow>, SourceError> {
        source.consumption_rows(*key).await
    }

    fn into_batch(rows: Vec<ConsumptionRow>) -> RowBatch {
        RowBatch::Consumption(rows)
    }
}

/// A movement document to load: either a header already fetched by a window query or
/// a bare id from the change feed whose header is looked up on demand.
#[derive(Debug, Clone, PartialEq)]
pub enum MovementKey {
    Header(MovementHeader),
    Id(i64),
}

/// Warehouse movements. Incremental passes follow changed header ids because corrections
/// may reference back-dated headers.
#[derive(Debug, Default, Clone, Copy)]
pub struct MovementStream;

#[async_trait]
impl KeyedStream for MovementStream {
    type Key = MovementKey;
    type Row = MovementRow;

    fn kind(&self) -> StreamKind {
        StreamKind::StockMovements
    }

    fn watermark_source(&self) -> WatermarkSource {
        WatermarkSource::DestinationMax
    }

    fn key_id(key: &MovementKey) -> i64 {
        match key {
            MovementKey::Header(header) => header.h_id,
            MovementKey::Id(id) => *id,
        }
    }

    async fn window_keys(
        &self,
        source: &mut dyn SourceSystem,
        window: &Window,
    ) -> Result<Vec<MovementKey>, SourceError> {
        let headers = source.movement_headers(window).await?;
        Ok(headers.into_iter().map(MovementKey::Header).collect())
    }

    async fn keys_since(
        &self,
        source: &mut dyn SourceSystem,
        after: i64,
    ) -> Result<Vec<MovementKey>, SourceError> {
        let keys = source.changed_movement_keys(after).await?;
        Ok(keys.into_iter().map(MovementKey::Id).collect())
    }

    async fn detail(
        &self,
        source: &mut dyn SourceSystem,
        key: &MovementKey,
    ) -> Result<Vec<MovementRow>, SourceError> {
        let header = match key {
            MovementKey::Header(header) => header.clone(),
            MovementKey::Id(id) => match source.movement_header(*id).await? {
                Some(header) => header,
                None => {
                    debug!(key = id, "movement header no longer active");
                    return Ok(Vec::new());
                }
            },
        };
        let lines = source.movement_lines(header.h_id).await?;
        Ok(lines
            .into_iter()
            .map(|line| MovementRow::from_parts(&header, line))
            .collect())
    }

    fn into_batch(rows: Vec<MovementRow>) -> RowBatch {
        RowBatch::Movements(rows)
    }
}

/// Fetches the detail of every key and appends it in batches of at least `batch_size`
/// rows, committing per batch. A key's rows never straddle two batches.
///
/// A failing key is recorded as skipped and the drain continues, unless the failure
/// means the source is gone; then the drain stops and returns the error. Keys flushed
/// before that point stay committed and, with `checkpoint` set, so does the watermark.
pub async fn drain_keys<S: KeyedStream>(
    stream: &S,
    source: &mut dyn SourceSystem,
    dest: &mut dyn Destination,
    keys: Vec<S::Key>,
    batch_size: usize,
    checkpoint: Option<&str>,
) -> Result<BatchReport> {
    let kind = stream.kind();
    let mut report = BatchReport::default();
    let mut buffer: Vec<S::Row> = Vec::new();
    let mut buffered_keys: Vec<i64> = Vec::new();

    for key in &keys {
        let id = S::key_id(key);
        match stream.detail(source, key).await {
            Ok(rows) => {
                buffer.extend(rows);
                buffered_keys.push(id);
            }
            Err(err) if err.is_connection_loss() => {
                flush::<S>(kind, dest, &mut buffer, &mut buffered_keys, &mut report, checkpoint)
                    .await?;
                return Err(err).with_context(|| format!("{kind}: source lost at key {id}"));
            }
            Err(err) => {
                warn!(stream = %kind, key = id, error = %err, "key failed; skipping");
                report.record_skip(id, err.to_string());
                continue;
            }
        }

        if buffer.len() >= batch_size {
            flush::<S>(kind, dest, &mut buffer, &mut buffered_keys, &mut report, checkpoint).await?;
        }
    }

    flush::<S>(kind, dest, &mut buffer, &mut buffered_keys, &mut report, checkpoint).await?;
    Ok(report)
}

async fn flush<S: KeyedStream>(
    kind: StreamKind,
    dest: &mut dyn Destination,
    buffer: &mut Vec<S::Row>,
    buffered_keys: &mut Vec<i64>,
    report: &mut BatchReport,
    checkpoint: Option<&str>,
) -> Result<()> {
    if buffered_keys.is_empty() {
        return Ok(());
    }
    let rows = std::mem::take(buffer);
    let count = rows.len();
    let written = if count > 0 {
        report.batches += 1;
        dest.append(S::into_batch(rows))
            .await
            .with_context(|| format!("{kind}: committing batch of {count} rows"))?
    } else {
        0
    };
    report.rows_written += written;
    for key in buffered_keys.drain(..) {
        report.record_success(key);
    }
    if let (Some(name), Some(max)) = (checkpoint, report.max_succeeded()) {
        dest.advance_watermark(name, max).await?;
    }
    debug!(stream = %kind, rows = written, "batch flushed");
    Ok(())
}

/// Result of one incremental pass over a stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub stream: StreamKind,
    pub previous: i64,
    pub watermark: i64,
    pub report: BatchReport,
}

impl SyncOutcome {
    pub fn advanced(&self) -> bool {
        self.watermark > self.previous
    }
}

/// Appends source rows newer than a watermark.
#[derive(Debug, Clone, Copy)]
pub struct IncrementalEngine {
    batch_size: usize,
}

impl IncrementalEngine {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub async fn sync_stream<S: KeyedStream>(
        &self,
        stream: &S,
        source: &mut dyn SourceSystem,
        dest: &mut dyn Destination,
        last_watermark: i64,
    ) -> Result<SyncOutcome> {
        let kind = stream.kind();
        let name = kind
            .watermark_name()
            .with_context(|| format!("{kind} has no watermark"))?;

        let keys = stream
            .keys_since(source, last_watermark)
            .await
            .with_context(|| format!("{kind}: listing keys after {last_watermark}"))?;
        if keys.is_empty() {
            debug!(stream = %kind, watermark = last_watermark, "no new keys");
            return Ok(SyncOutcome {
                stream: kind,
                previous: last_watermark,
                watermark: last_watermark,
                report: BatchReport::default(),
            });
        }
        info!(stream = %kind, keys = keys.len(), watermark = last_watermark, "incremental pass");

        let policy = stream.watermark_source();
        let checkpoint = (policy == WatermarkSource::CommittedKeys).then_some(name);
        let report = drain_keys(stream, source, dest, keys, self.batch_size, checkpoint).await?;

        let candidate = match policy {
            WatermarkSource::CommittedKeys => report.max_succeeded().unwrap_or(last_watermark),
            WatermarkSource::DestinationMax => dest.max_key(kind).await?,
        };
        let state = dest
            .advance_watermark(name, candidate.max(last_watermark))
            .await?;

        let passed_over = report
            .skipped
            .iter()
            .filter(|skip| skip.key <= state.last_watermark)
            .count();
        if passed_over > 0 {
            warn!(
                stream = %kind,
                skipped = passed_over,
                watermark = state.last_watermark,
                "skipped keys are now below the watermark and will not be retried"
            );
        }
        info!(
            stream = %kind,
            rows = report.rows_written,
            skipped = report.skipped.len(),
            watermark = state.last_watermark,
            "incremental pass complete"
        );

        Ok(SyncOutcome {
            stream: kind,
            previous: last_watermark,
            watermark: state.last_watermark,
            report,
        })
    }
}
