//! Versioned Table: rows keyed by surrogate key
//!
//! A table never deletes rows. The only mutations are closing a current
//! version and inserting a new one, both driven by a [`Delta`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use types::errors::IntegrityError;
use types::ids::{BusinessKey, SurrogateKey};
use types::versioned::{check_key_history, CloseOp, Delta, Versioned};

/// Counts from applying one delta to one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub closed: usize,
    pub inserted: usize,
    /// Business keys touched by the delta.
    pub affected: BTreeSet<BusinessKey>,
}

/// Versioned rows of one dimension or fact table.
///
/// Uses `BTreeMap` for deterministic iteration and serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedTable<V> {
    rows: BTreeMap<SurrogateKey, V>,
}

impl<V> Default for VersionedTable<V> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

impl<V: Versioned + Clone> VersionedTable<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from rows, e.g. when loading an export.
    pub fn from_rows(rows: impl IntoIterator<Item = V>) -> Result<Self, IntegrityError> {
        let mut table = Self::new();
        for row in rows {
            let sk = row.surrogate_key().clone();
            if table.rows.insert(sk.clone(), row).is_some() {
                return Err(IntegrityError::DuplicateSurrogateKey { sk: sk.to_string() });
            }
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, sk: &SurrogateKey) -> Option<&V> {
        self.rows.get(sk)
    }

    /// All versions, ordered by surrogate key.
    pub fn rows(&self) -> impl Iterator<Item = &V> {
        self.rows.values()
    }

    /// Rows with `is_current = true`.
    pub fn current_rows(&self) -> Vec<&V> {
        self.rows.values().filter(|r| r.is_current()).collect()
    }

    /// Owned copy of the current rows: the merge engine's input snapshot.
    pub fn current_snapshot(&self) -> Vec<V> {
        self.rows
            .values()
            .filter(|r| r.is_current())
            .cloned()
            .collect()
    }

    /// Every version of `bk`, ordered by `valid_from`.
    pub fn history(&self, bk: &BusinessKey) -> Vec<&V> {
        let mut versions: Vec<&V> = self
            .rows
            .values()
            .filter(|r| r.business_key() == bk)
            .collect();
        versions.sort_by_key(|v| v.valid_from());
        versions
    }

    pub fn business_keys(&self) -> BTreeSet<BusinessKey> {
        self.rows.values().map(|r| r.business_key().clone()).collect()
    }

    /// Apply closes, then inserts, in place.
    ///
    /// Not atomic on its own: callers stage on a copy and only keep it when
    /// every table applied cleanly (see `WarehouseState::commit`).
    pub fn apply(&mut self, delta: &Delta<V>) -> Result<ApplyStats, IntegrityError> {
        let mut stats = ApplyStats::default();

        for op in &delta.to_close {
            self.close(op)?;
            stats.closed += 1;
            stats.affected.insert(op.business_key.clone());
        }

        for row in &delta.to_insert {
            let sk = row.surrogate_key().clone();
            if self.rows.contains_key(&sk) {
                return Err(IntegrityError::DuplicateSurrogateKey { sk: sk.to_string() });
            }
            stats.affected.insert(row.business_key().clone());
            self.rows.insert(sk, row.clone());
            stats.inserted += 1;
        }

        Ok(stats)
    }

    /// Verify history invariants for the given business keys.
    pub fn check_keys<'a, I>(&self, keys: I) -> Result<(), IntegrityError>
    where
        I: IntoIterator<Item = &'a BusinessKey>,
    {
        for bk in keys {
            check_key_history(bk, &self.history(bk))?;
        }
        Ok(())
    }

    /// Verify history invariants for the whole table.
    pub fn check_all(&self) -> Result<(), IntegrityError> {
        types::versioned::check_history(self.rows.values())
    }

    fn close(&mut self, op: &CloseOp) -> Result<(), IntegrityError> {
        let row = self
            .rows
            .get_mut(&op.sk)
            .filter(|r| r.is_current())
            .ok_or_else(|| IntegrityError::UnknownVersion {
                sk: op.sk.to_string(),
            })?;
        if op.valid_to <= row.valid_from() {
            return Err(IntegrityError::EmptyInterval {
                business_key: op.business_key.to_string(),
                sk: op.sk.to_string(),
            });
        }
        row.close(op.valid_to);
        Ok(())
    }
}
