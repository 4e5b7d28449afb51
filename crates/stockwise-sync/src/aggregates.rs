use anyhow::Result;
use serde::Serialize;
use stockwise_core::{derive_variant_rows, AggregateKind, StreamKind, Table};
use stockwise_storage::Destination;
use tracing::{debug, info, warn};

/// What one aggregate refresh did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// A required table is absent; nothing was touched.
    Skipped { table: String },
    /// First sight of a pre-populated table: the watermark was pinned to the upstream max.
    Initialized { watermark: i64 },
    UpToDate,
    Applied { watermark: i64, keys: usize },
}

impl RefreshOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, RefreshOutcome::Applied { keys, .. } if *keys > 0)
    }
}

/// Keeps the derived tables in step with the raw history by applying only rows above
/// each aggregate's own watermark.
#[derive(Debug, Clone)]
pub struct AggregateMaintainer {
    outbound_document_type: String,
}

impl AggregateMaintainer {
    pub fn new(outbound_document_type: impl Into<String>) -> Self {
        Self {
            outbound_document_type: outbound_document_type.into(),
        }
    }

    pub fn outbound_document_type(&self) -> &str {
        &self.outbound_document_type
    }

    async fn missing_table(
        dest: &mut dyn Destination,
        aggregate: AggregateKind,
        tables: &[Table],
    ) -> Result<Option<RefreshOutcome>> {
        for table in tables {
            if !dest.table_exists(*table).await? {
                warn!(aggregate = %aggregate, table = table.name(), "table missing; refresh skipped");
                return Ok(Some(RefreshOutcome::Skipped {
                    table: table.name().to_string(),
                }));
            }
        }
        Ok(None)
    }

    /// Current watermark, or `Err(outcome)` when the aggregate was just initialised.
    async fn starting_watermark(
        dest: &mut dyn Destination,
        aggregate: AggregateKind,
    ) -> Result<Result<i64, RefreshOutcome>> {
        if let Some(state) = dest.watermark(aggregate.state_name()).await? {
            return Ok(Ok(state.last_watermark));
        }
        if dest.has_rows(aggregate.table()).await? {
            let upstream = dest.max_key(aggregate.upstream()).await?;
            let state = dest
                .advance_watermark(aggregate.state_name(), upstream)
                .await?;
            info!(
                aggregate = %aggregate,
                watermark = state.last_watermark,
                "existing rows found; watermark initialised"
            );
            return Ok(Err(RefreshOutcome::Initialized {
                watermark: state.last_watermark,
            }));
        }
        Ok(Ok(0))
    }

    /// Inserts materials first seen in consumption rows above the watermark. Existing
    /// materials keep their attributes.
    pub async fn refresh_unique(&self, dest: &mut dyn Destination) -> Result<RefreshOutcome> {
        let aggregate = AggregateKind::UniqueMaterials;
        if let Some(skipped) =
            Self::missing_table(dest, aggregate, &[Table::BomConsumption, Table::UniqueMaterials])
                .await?
        {
            return Ok(skipped);
        }
        let last = match Self::starting_watermark(dest, aggregate).await? {
            Ok(last) => last,
            Err(outcome) => return Ok(outcome),
        };
        let Some(upto) = dest
            .max_key_after(StreamKind::BomConsumption, last, false)
            .await?
        else {
            debug!(aggregate = %aggregate, watermark = last, "up to date");
            return Ok(RefreshOutcome::UpToDate);
        };

        let candidates = dest.latest_material_attributes(last, upto).await?;
        let inserted = dest.insert_new_materials(&candidates).await?;
        let state = dest.advance_watermark(aggregate.state_name(), upto).await?;
        info!(
            aggregate = %aggregate,
            candidates = candidates.len(),
            rows = inserted,
            watermark = state.last_watermark,
            "unique materials refreshed"
        );
        Ok(RefreshOutcome::Applied {
            watermark: state.last_watermark,
            keys: usize::try_from(inserted).unwrap_or(usize::MAX),
        })
    }

    /// Applies signed movement deltas above the watermark to the running balance.
    pub async fn refresh_running_balance(
        &self,
        dest: &mut dyn Destination,
    ) -> Result<RefreshOutcome> {
        let aggregate = AggregateKind::RunningBalance;
        if let Some(skipped) =
            Self::missing_table(dest, aggregate, &[Table::StockMovements, Table::RunningBalance])
                .await?
        {
            return Ok(skipped);
        }
        let last = match Self::starting_watermark(dest, aggregate).await? {
            Ok(last) => last,
            Err(outcome) => return Ok(outcome),
        };
        let Some(upto) = dest
            .max_key_after(StreamKind::StockMovements, last, true)
            .await?
        else {
            debug!(aggregate = %aggregate, watermark = last, "up to date");
            return Ok(RefreshOutcome::UpToDate);
        };

        let deltas = dest
            .balance_deltas(last, upto, &self.outbound_document_type)
            .await?;
        let state = dest
            .apply_balance_deltas(&deltas, aggregate.state_name(), upto)
            .await?;
        info!(
            aggregate = %aggregate,
            keys = deltas.len(),
            watermark = state.last_watermark,
            "running balance refreshed"
        );
        Ok(RefreshOutcome::Applied {
            watermark: state.last_watermark,
            keys: deltas.len(),
        })
    }

    /// Recomputes variant rows for the materials moved above the watermark: their old
    /// rows are deleted and re-derived from the current balance, so reruns are stable.
    pub async fn refresh_variant_balance(
        &self,
        dest: &mut dyn Destination,
    ) -> Result<RefreshOutcome> {
        let aggregate = AggregateKind::VariantBalance;
        if let Some(skipped) = Self::missing_table(
            dest,
            aggregate,
            &[Table::VariantBalance, Table::VariantMap, Table::RunningBalance],
        )
        .await?
        {
            return Ok(skipped);
        }
        let last = match Self::starting_watermark(dest, aggregate).await? {
            Ok(last) => last,
            Err(outcome) => return Ok(outcome),
        };
        let Some(upto) = dest
            .max_key_after(StreamKind::StockMovements, last, true)
            .await?
        else {
            debug!(aggregate = %aggregate, watermark = last, "up to date");
            return Ok(RefreshOutcome::UpToDate);
        };

        let materials = dest.touched_materials(last, upto).await?;
        if !materials.is_empty() {
            let mappings = dest.variant_mappings(Some(materials.as_slice())).await?;
            let balances = dest.balances(Some(materials.as_slice())).await?;
            let rows = derive_variant_rows(&mappings, &balances);
            dest.replace_variant_rows(&materials, &rows).await?;
            debug!(aggregate = %aggregate, materials = materials.len(), rows = rows.len(), "variants replaced");
        }
        let state = dest.advance_watermark(aggregate.state_name(), upto).await?;
        info!(
            aggregate = %aggregate,
            keys = materials.len(),
            watermark = state.last_watermark,
            "variant balance refreshed"
        );
        Ok(RefreshOutcome::Applied {
            watermark: state.last_watermark,
            keys: materials.len(),
        })
    }

    /// Unique materials, running balance, variant balance, in dependency order.
    pub async fn refresh_all(&self, dest: &mut dyn Destination) -> Result<Vec<RefreshOutcome>> {
        Ok(vec![
            self.refresh_unique(dest).await?,
            self.refresh_running_balance(dest).await?,
            self.refresh_variant_balance(dest).await?,
        ])
    }

    /// Drops non-seat balances and replays the whole movement history.
    pub async fn rebuild_running_balance(
        &self,
        dest: &mut dyn Destination,
    ) -> Result<RefreshOutcome> {
        let aggregate = AggregateKind::RunningBalance;
        if !dest.table_exists(aggregate.table()).await? {
            return self.refresh_running_balance(dest).await;
        }
        let cleared = dest.clear_balances().await?;
        dest.reset_watermark(aggregate.state_name(), 0).await?;
        info!(aggregate = %aggregate, rows = cleared, "balance cleared for rebuild");
        self.refresh_running_balance(dest).await
    }

    pub async fn rebuild_variant_balance(
        &self,
        dest: &mut dyn Destination,
    ) -> Result<RefreshOutcome> {
        let aggregate = AggregateKind::VariantBalance;
        if !dest.table_exists(aggregate.table()).await? {
            return self.refresh_variant_balance(dest).await;
        }
        let cleared = dest.clear_variant_rows().await?;
        dest.reset_watermark(aggregate.state_name(), 0).await?;
        info!(aggregate = %aggregate, rows = cleared, "variant rows cleared for rebuild");
        self.refresh_variant_balance(dest).await
    }

    /// Rebuilds the unique-material table from all consumption rows.
    pub async fn rebuild_unique(&self, dest: &mut dyn Destination) -> Result<RefreshOutcome> {
        let aggregate = AggregateKind::UniqueMaterials;
        if let Some(skipped) =
            Self::missing_table(dest, aggregate, &[Table::BomConsumption, Table::UniqueMaterials])
                .await?
        {
            return Ok(skipped);
        }
        let rows = dest.rebuild_unique_materials().await?;
        let max = dest.max_key(StreamKind::BomConsumption).await?;
        let state = dest.reset_watermark(aggregate.state_name(), max).await?;
        info!(aggregate = %aggregate, rows, watermark = state.last_watermark, "unique materials rebuilt");
        Ok(RefreshOutcome::Applied {
            watermark: state.last_watermark,
            keys: usize::try_from(rows).unwrap_or(usize::MAX),
        })
    }
}
