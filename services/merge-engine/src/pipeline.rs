//! Batch pipeline
//!
//! One batch flows through:
//! 1. Namespace guard
//! 2. SCD2 merge of every dimension present in the batch
//! 3. Dimension deltas staged, lookups built from the staged state
//! 4. Event facts and order aggregates versioned, extra attributes registered
//! 5. Atomic commit of the combined delta
//!
//! Nothing is written unless every step succeeds.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info};
use types::batch::IngestBatch;
use types::errors::{ConfigError, EngineError, IntegrityError};
use types::fact::{FactVersion, QualityFlags};
use types::ids::BatchId;

use persistence::determinism::{DeterminismVerifier, DivergenceReport};
use persistence::warehouse::{CommitError, WarehouseDelta, WarehouseState};

use crate::config::EngineConfig;
use crate::dialect::Dialect;
use crate::enrichment::{CurrentDimensionIndex, Enricher};
use crate::extra_attributes::ExtraAttributeRegistry;
use crate::facts::{dedupe_events, FactStats, FactVersioner};
use crate::identity::IdentityGenerator;
use crate::orders::OrderAggregator;
use crate::scd2::{MergeStats, Scd2MergeEngine};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Commit(#[from] CommitError),
}

impl From<EngineError> for PipelineError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Config(e) => Self::Config(e),
            EngineError::Integrity(e) => Self::Integrity(e),
        }
    }
}

/// Quality-flag counts over the fact versions written by a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QualityCounts {
    pub trader_not_found: usize,
    pub counterparty_not_found: usize,
    pub instrument_not_found: usize,
    pub book_not_found: usize,
}

impl QualityCounts {
    fn record(&mut self, flags: &QualityFlags) {
        self.trader_not_found += usize::from(flags.trader_not_found);
        self.counterparty_not_found += usize::from(flags.counterparty_not_found);
        self.instrument_not_found += usize::from(flags.instrument_not_found);
        self.book_not_found += usize::from(flags.book_not_found);
    }

    pub fn total(&self) -> usize {
        self.trader_not_found + self.counterparty_not_found + self.instrument_not_found + self.book_not_found
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub loaded_at: DateTime<Utc>,
    pub dimensions: BTreeMap<String, MergeStats>,
    pub events: FactStats,
    pub orders: FactStats,
    /// Counted over new event fact versions.
    pub quality: QualityCounts,
    pub extra_attributes_added: usize,
    pub rows_inserted: usize,
    pub rows_closed: usize,
    /// False when the batch was a no-op.
    pub changed: bool,
    pub state_hash: String,
}

pub struct BatchProcessor {
    config: EngineConfig,
    identity: IdentityGenerator,
    dialect: &'static dyn Dialect,
}

impl BatchProcessor {
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let dialect = config.dialect.dialect();
        let identity = IdentityGenerator::new(config.namespace.clone(), config.domain.clone(), dialect)?;
        Ok(Self {
            config,
            identity,
            dialect,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn identity(&self) -> &IdentityGenerator {
        &self.identity
    }

    /// Process one batch against `state`. On error `state` is unchanged.
    pub fn process(&self, state: &mut WarehouseState, batch: &IngestBatch) -> Result<BatchReport, PipelineError> {
        let result = self.plan(state, batch);
        let (delta, mut report) = match result {
            Ok(planned) => planned,
            Err(e) => {
                error!(batch_id = %batch.batch_id, error = %e, "Batch rejected, state unchanged");
                return Err(e);
            }
        };

        let commit = state.commit(&delta)?;
        report.extra_attributes_added = commit.extra_attributes_added;
        report.rows_inserted = commit.rows_inserted;
        report.rows_closed = commit.rows_closed;
        report.changed = commit.changed;
        report.state_hash = state.compute_hash();

        info!(
            batch_id = %report.batch_id,
            loaded_at = %report.loaded_at,
            inserted = report.rows_inserted,
            closed = report.rows_closed,
            events_corrected = report.events.corrected,
            orders_versioned = report.orders.inserted + report.orders.corrected,
            quality_flags = report.quality.total(),
            changed = report.changed,
            "Batch processed"
        );
        Ok(report)
    }

    /// Process `batch` twice from `state` and compare the two results.
    /// The second run must be a no-op.
    pub fn verify_idempotent(
        &self,
        state: &WarehouseState,
        batch: &IngestBatch,
    ) -> Result<DivergenceReport, PipelineError> {
        let mut once = state.clone();
        self.process(&mut once, batch)?;
        let mut twice = once.clone();
        self.process(&mut twice, batch)?;
        Ok(DeterminismVerifier::compare_states(&once, &twice))
    }

    fn plan(&self, state: &WarehouseState, batch: &IngestBatch) -> Result<(WarehouseDelta, BatchReport), PipelineError> {
        self.identity.check_namespace(state.namespace.as_deref())?;

        let loaded_at = self.dialect.truncate_timestamp(batch.loaded_at);
        let mut delta = WarehouseDelta::new(batch.batch_id, loaded_at, self.identity.namespace());
        let mut report = BatchReport {
            batch_id: batch.batch_id,
            loaded_at,
            dimensions: BTreeMap::new(),
            events: FactStats::default(),
            orders: FactStats::default(),
            quality: QualityCounts::default(),
            extra_attributes_added: 0,
            rows_inserted: 0,
            rows_closed: 0,
            changed: false,
            state_hash: String::new(),
        };

        for (name, rows) in &batch.dimensions {
            let config = self
                .config
                .dimension(name)
                .ok_or_else(|| ConfigError::UnknownDimension { name: name.clone() })?;
            let engine = Scd2MergeEngine::new(config, self.dialect);
            let (dim_delta, stats) = engine.merge(&state.dimension_snapshot(name), rows)?;
            delta.dimensions.insert(name.clone(), dim_delta);
            report.dimensions.insert(name.clone(), stats);
        }

        // Facts resolve against dimensions as of the end of this batch.
        let (staged, _) = state.stage(&delta)?;
        let enrichment = &self.config.enrichment;
        let mut index = CurrentDimensionIndex::from_state(&staged);
        index.index_attribute(
            &enrichment.counterparties,
            &enrichment.counterparty_name_column,
            self.dialect,
        );
        let enricher = Enricher::new(&index, enrichment);
        let mut registry = ExtraAttributeRegistry::new(&state.extra_attributes, loaded_at);

        let (events, duplicates) = dedupe_events(&batch.events);
        let versioner = FactVersioner::new(&self.identity, self.dialect, batch.batch_id, loaded_at);

        let current_events: Vec<FactVersion> = staged.event_facts.current_snapshot();
        let (event_delta, mut event_stats) =
            versioner.version_events(&events, &current_events, &enricher, &mut registry)?;
        event_stats.duplicates = duplicates;
        for version in &event_delta.to_insert {
            report.quality.record(&version.quality);
        }

        let current_orders: Vec<FactVersion> = staged.order_facts.current_snapshot();
        let candidates = OrderAggregator::new(&self.identity, self.dialect).candidates(
            &events,
            &current_orders,
            &enricher,
        )?;
        let (order_delta, order_stats) = versioner.version(candidates, &current_orders, &mut registry)?;

        delta.event_facts = event_delta;
        delta.order_facts = order_delta;
        delta.extra_attributes = registry.into_rows();
        report.events = event_stats;
        report.orders = order_stats;
        Ok((delta, report))
    }
}
