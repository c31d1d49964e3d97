//! Point-in-time resolution
//!
//! Answers "which version of this key was valid at T?" for any
//! [`Versioned`] row type. Intervals are half-open, so a version closed at T
//! is not valid at T; its successor is.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use types::errors::IntegrityError;
use types::ids::BusinessKey;
use types::versioned::{group_by_business_key, Versioned};

use persistence::table::VersionedTable;

pub struct PointInTimeResolver<'a, V: Versioned> {
    by_key: BTreeMap<BusinessKey, Vec<&'a V>>,
}

impl<'a, V: Versioned + 'a> PointInTimeResolver<'a, V> {
    pub fn new(rows: impl IntoIterator<Item = &'a V>) -> Self {
        Self {
            by_key: group_by_business_key(rows),
        }
    }

    pub fn from_table(table: &'a VersionedTable<V>) -> Self
    where
        V: Clone,
    {
        Self::new(table.rows())
    }

    /// The version of `bk` valid at `as_of`, if any.
    pub fn resolve(&self, bk: &BusinessKey, as_of: DateTime<Utc>) -> Result<Option<&'a V>, IntegrityError> {
        let Some(versions) = self.by_key.get(bk) else {
            return Ok(None);
        };
        let matches: Vec<&'a V> = versions
            .iter()
            .copied()
            .filter(|v| v.is_valid_at(as_of))
            .collect();
        match matches.as_slice() {
            [] => Ok(None),
            [one] => Ok(Some(*one)),
            many => Err(IntegrityError::AmbiguousResolution {
                business_key: bk.to_string(),
                as_of,
                matches: many.len(),
            }),
        }
    }

    /// The current version of `bk`, by flag only.
    pub fn resolve_current(&self, bk: &BusinessKey) -> Result<Option<&'a V>, IntegrityError> {
        let Some(versions) = self.by_key.get(bk) else {
            return Ok(None);
        };
        let current: Vec<&'a V> = versions.iter().copied().filter(|v| v.is_current()).collect();
        match current.as_slice() {
            [] => Ok(None),
            [one] => Ok(Some(*one)),
            many => Err(IntegrityError::MultipleCurrentRows {
                business_key: bk.to_string(),
                count: many.len(),
            }),
        }
    }

    /// Every key's version at `ts`. Keys with no version at `ts` are absent.
    pub fn as_of(&self, ts: DateTime<Utc>) -> Result<BTreeMap<BusinessKey, &'a V>, IntegrityError> {
        let mut view = BTreeMap::new();
        for bk in self.by_key.keys() {
            if let Some(v) = self.resolve(bk, ts)? {
                view.insert(bk.clone(), v);
            }
        }
        Ok(view)
    }

    pub fn current(&self) -> Result<BTreeMap<BusinessKey, &'a V>, IntegrityError> {
        let mut view = BTreeMap::new();
        for bk in self.by_key.keys() {
            if let Some(v) = self.resolve_current(bk)? {
                view.insert(bk.clone(), v);
            }
        }
        Ok(view)
    }
}
