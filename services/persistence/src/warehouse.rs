//! Warehouse State: every versioned table plus the atomic commit
//!
//! A batch is committed all-or-nothing: the delta is applied to a staged
//! copy, the history of every affected business key is verified, and only
//! then does the staged copy replace the live state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, error, info};
use types::dimension::{DimensionDelta, DimensionVersion};
use types::errors::{ConfigError, IntegrityError};
use types::fact::{ExtraAttributeRow, FactDelta, FactVersion};
use types::hashing::sha256_hex;
use types::ids::{BatchId, BusinessKey, ExtraAttributesKey};

use crate::table::VersionedTable;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommitError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Table {table}: {source}")]
    Integrity {
        table: String,
        source: IntegrityError,
    },
}

impl CommitError {
    fn integrity(table: impl Into<String>, source: IntegrityError) -> Self {
        CommitError::Integrity {
            table: table.into(),
            source,
        }
    }
}

// ── Table names ─────────────────────────────────────────────────────

pub const EVENT_FACTS_TABLE: &str = "fct_trade_events";
pub const ORDER_FACTS_TABLE: &str = "fct_orders";
pub const EXTRA_ATTRIBUTES_TABLE: &str = "dim_extra_attributes";

// ── Delta ───────────────────────────────────────────────────────────

/// Every change produced by one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseDelta {
    pub batch_id: BatchId,
    pub loaded_at: DateTime<Utc>,
    /// Identity namespace the batch was processed with.
    pub namespace: String,
    pub dimensions: BTreeMap<String, DimensionDelta>,
    pub event_facts: FactDelta,
    pub order_facts: FactDelta,
    pub extra_attributes: Vec<ExtraAttributeRow>,
}

impl WarehouseDelta {
    pub fn new(batch_id: BatchId, loaded_at: DateTime<Utc>, namespace: impl Into<String>) -> Self {
        Self {
            batch_id,
            loaded_at,
            namespace: namespace.into(),
            dimensions: BTreeMap::new(),
            event_facts: FactDelta::empty(),
            order_facts: FactDelta::empty(),
            extra_attributes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.values().all(|d| d.is_empty())
            && self.event_facts.is_empty()
            && self.order_facts.is_empty()
            && self.extra_attributes.is_empty()
    }

    pub fn rows_inserted(&self) -> usize {
        self.dimensions.values().map(|d| d.to_insert.len()).sum::<usize>()
            + self.event_facts.to_insert.len()
            + self.order_facts.to_insert.len()
    }

    pub fn rows_closed(&self) -> usize {
        self.dimensions.values().map(|d| d.to_close.len()).sum::<usize>()
            + self.event_facts.to_close.len()
            + self.order_facts.to_close.len()
    }
}

// ── Commit bookkeeping ──────────────────────────────────────────────

/// Record of a batch that changed the warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub loaded_at: DateTime<Utc>,
    pub rows_inserted: usize,
    pub rows_closed: usize,
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    pub batch_id: BatchId,
    pub rows_inserted: usize,
    pub rows_closed: usize,
    pub extra_attributes_added: usize,
    /// Affected business keys per table.
    pub affected: BTreeMap<String, BTreeSet<BusinessKey>>,
    /// False when the delta was empty and nothing was written.
    pub changed: bool,
}

// ── Warehouse State ─────────────────────────────────────────────────

/// Full warehouse state.
///
/// Uses `BTreeMap` throughout so serialization and hashing are
/// independent of insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseState {
    /// Namespace recorded by the first committed batch.
    pub namespace: Option<String>,
    /// Dimension tables keyed by dimension name.
    pub dimensions: BTreeMap<String, VersionedTable<DimensionVersion>>,
    /// Lifecycle event facts keyed `order_id|event_seq`.
    pub event_facts: VersionedTable<FactVersion>,
    /// Order facts aggregating their lifecycle events.
    pub order_facts: VersionedTable<FactVersion>,
    /// Schema-drift payloads, including the `-1` sentinel row.
    pub extra_attributes: BTreeMap<ExtraAttributesKey, ExtraAttributeRow>,
    /// Batches that changed the state.
    pub batches: BTreeMap<BatchId, BatchRecord>,
}

impl WarehouseState {
    /// Create an empty warehouse holding only the extra-attribute sentinel.
    pub fn empty() -> Self {
        let mut extra_attributes = BTreeMap::new();
        extra_attributes.insert(
            ExtraAttributesKey::NONE,
            ExtraAttributeRow {
                key: ExtraAttributesKey::NONE,
                payload: Default::default(),
                first_seen_utc: DateTime::<Utc>::default(),
            },
        );
        Self {
            namespace: None,
            dimensions: BTreeMap::new(),
            event_facts: VersionedTable::new(),
            order_facts: VersionedTable::new(),
            extra_attributes,
            batches: BTreeMap::new(),
        }
    }

    /// Dimension table by name, if any row was ever written to it.
    pub fn dimension(&self, name: &str) -> Option<&VersionedTable<DimensionVersion>> {
        self.dimensions.get(name)
    }

    /// Current rows of a dimension (empty when the table does not exist).
    pub fn dimension_snapshot(&self, name: &str) -> Vec<DimensionVersion> {
        self.dimensions
            .get(name)
            .map(|t| t.current_snapshot())
            .unwrap_or_default()
    }

    /// Compute a deterministic SHA-256 hash of the state.
    pub fn compute_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        sha256_hex(&bytes)
    }

    /// Reject a namespace that differs from the recorded one.
    pub fn check_namespace(&self, configured: &str) -> Result<(), ConfigError> {
        match &self.namespace {
            Some(recorded) if recorded != configured => Err(ConfigError::NamespaceMismatch {
                recorded: recorded.clone(),
                configured: configured.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Apply `delta` without committing: returns the staged state.
    ///
    /// Used by the pipeline to resolve facts against dimensions merged in
    /// the same batch before anything is committed.
    pub fn stage(&self, delta: &WarehouseDelta) -> Result<(Self, CommitReport), CommitError> {
        self.check_namespace(&delta.namespace)?;

        let mut staged = self.clone();
        let mut affected: BTreeMap<String, BTreeSet<BusinessKey>> = BTreeMap::new();

        for (name, dim_delta) in &delta.dimensions {
            if dim_delta.is_empty() {
                continue;
            }
            let table = staged.dimensions.entry(name.clone()).or_default();
            let stats = table
                .apply(dim_delta)
                .map_err(|e| CommitError::integrity(name.as_str(), e))?;
            table
                .check_keys(&stats.affected)
                .map_err(|e| CommitError::integrity(name.as_str(), e))?;
            affected.insert(name.clone(), stats.affected);
        }

        for (name, table, fact_delta) in [
            (EVENT_FACTS_TABLE, &mut staged.event_facts, &delta.event_facts),
            (ORDER_FACTS_TABLE, &mut staged.order_facts, &delta.order_facts),
        ] {
            if fact_delta.is_empty() {
                continue;
            }
            let stats = table
                .apply(fact_delta)
                .map_err(|e| CommitError::integrity(name, e))?;
            table
                .check_keys(&stats.affected)
                .map_err(|e| CommitError::integrity(name, e))?;
            affected.insert(name.to_string(), stats.affected);
        }

        let mut extra_added = 0;
        for row in &delta.extra_attributes {
            match staged.extra_attributes.get(&row.key) {
                Some(existing) if existing.payload != row.payload => {
                    return Err(CommitError::integrity(
                        EXTRA_ATTRIBUTES_TABLE,
                        IntegrityError::DuplicateSurrogateKey {
                            sk: row.key.to_string(),
                        },
                    ));
                }
                Some(_) => {}
                None => {
                    staged.extra_attributes.insert(row.key, row.clone());
                    extra_added += 1;
                }
            }
        }

        let changed = delta.rows_inserted() > 0 || delta.rows_closed() > 0 || extra_added > 0;
        if changed {
            staged.namespace.get_or_insert_with(|| delta.namespace.clone());
            staged.batches.insert(
                delta.batch_id,
                BatchRecord {
                    loaded_at: delta.loaded_at,
                    rows_inserted: delta.rows_inserted(),
                    rows_closed: delta.rows_closed(),
                },
            );
        }

        let report = CommitReport {
            batch_id: delta.batch_id,
            rows_inserted: delta.rows_inserted(),
            rows_closed: delta.rows_closed(),
            extra_attributes_added: extra_added,
            affected,
            changed,
        };
        Ok((staged, report))
    }

    /// Atomically apply `delta`.
    ///
    /// On error the state is left untouched and the error names the table
    /// and business key that failed.
    pub fn commit(&mut self, delta: &WarehouseDelta) -> Result<CommitReport, CommitError> {
        match self.stage(delta) {
            Ok((staged, report)) => {
                if report.changed {
                    *self = staged;
                    info!(
                        batch_id = %report.batch_id,
                        inserted = report.rows_inserted,
                        closed = report.rows_closed,
                        extra_attributes = report.extra_attributes_added,
                        "Batch committed"
                    );
                } else {
                    debug!(batch_id = %report.batch_id, "Empty delta, nothing to commit");
                }
                Ok(report)
            }
            Err(e) => {
                error!(batch_id = %delta.batch_id, error = %e, "Commit rejected, state unchanged");
                Err(e)
            }
        }
    }

    /// Verify history invariants across every table.
    pub fn check_integrity(&self) -> Result<(), CommitError> {
        for (name, table) in &self.dimensions {
            table
                .check_all()
                .map_err(|e| CommitError::integrity(name.as_str(), e))?;
        }
        self.event_facts
            .check_all()
            .map_err(|e| CommitError::integrity(EVENT_FACTS_TABLE, e))?;
        self.order_facts
            .check_all()
            .map_err(|e| CommitError::integrity(ORDER_FACTS_TABLE, e))?;
        Ok(())
    }
}

impl Default for WarehouseState {
    fn default() -> Self {
        Self::empty()
    }
}

// ── Tests ───────────────────────────────────────────────────────────
