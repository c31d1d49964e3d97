//! Ingestion batch: the unit of processing and of atomic commit

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::dimension::IncomingDimensionRow;
use crate::fact::TradeEvent;
use crate::ids::BatchId;

/// One batch of already-validated source rows.
///
/// `loaded_at` is the system time of the batch: every fact version it
/// produces starts at `loaded_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestBatch {
    #[serde(default)]
    pub batch_id: BatchId,
    pub loaded_at: DateTime<Utc>,
    /// Candidate dimension rows keyed by dimension name.
    #[serde(default)]
    pub dimensions: BTreeMap<String, Vec<IncomingDimensionRow>>,
    #[serde(default)]
    pub events: Vec<TradeEvent>,
}

impl IngestBatch {
    pub fn new(loaded_at: DateTime<Utc>) -> Self {
        Self {
            batch_id: BatchId::new(),
            loaded_at,
            dimensions: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    pub fn with_dimension_rows(
        mut self,
        dimension: impl Into<String>,
        rows: Vec<IncomingDimensionRow>,
    ) -> Self {
        self.dimensions.entry(dimension.into()).or_default().extend(rows);
        self
    }

    pub fn with_events(mut self, events: Vec<TradeEvent>) -> Self {
        self.events.extend(events);
        self
    }

    pub fn row_count(&self) -> usize {
        self.dimensions.values().map(Vec::len).sum::<usize>() + self.events.len()
    }
}
