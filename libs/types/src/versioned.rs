//! Version rows, deltas and history invariants
//!
//! Dimension rows and fact rows share one lifecycle: created on first sight,
//! closed and superseded on change, never updated in place. The [`Versioned`]
//! trait exposes that lifecycle so merge output, apply and point-in-time
//! resolution can be written once for both grains.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::IntegrityError;
use crate::ids::{BusinessKey, SurrogateKey};
use crate::time::{is_end_of_time, Interval};

/// A row with a validity interval on one time axis.
pub trait Versioned {
    fn surrogate_key(&self) -> &SurrogateKey;
    fn business_key(&self) -> &BusinessKey;
    fn valid_from(&self) -> DateTime<Utc>;
    fn valid_to(&self) -> DateTime<Utc>;
    fn is_current(&self) -> bool;

    /// Close this version at `at`, making it historical.
    fn close(&mut self, at: DateTime<Utc>);

    fn interval(&self) -> Interval {
        Interval::new(self.valid_from(), self.valid_to())
    }

    fn is_valid_at(&self, ts: DateTime<Utc>) -> bool {
        self.interval().contains(ts)
    }
}

/// Instruction to close the current version `sk` at `valid_to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseOp {
    pub sk: SurrogateKey,
    pub business_key: BusinessKey,
    pub valid_to: DateTime<Utc>,
}

/// Output of a merge: closes are applied before inserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta<V> {
    pub to_close: Vec<CloseOp>,
    pub to_insert: Vec<V>,
}

impl<V> Delta<V> {
    pub fn empty() -> Self {
        Self {
            to_close: Vec::new(),
            to_insert: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_close.is_empty() && self.to_insert.is_empty()
    }

    pub fn extend(&mut self, other: Delta<V>) {
        self.to_close.extend(other.to_close);
        self.to_insert.extend(other.to_insert);
    }
}

impl<V> Default for Delta<V> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Group rows by business key, each group sorted by `valid_from`.
pub fn group_by_business_key<'a, V, I>(rows: I) -> BTreeMap<BusinessKey, Vec<&'a V>>
where
    V: Versioned + 'a,
    I: IntoIterator<Item = &'a V>,
{
    let mut groups: BTreeMap<BusinessKey, Vec<&'a V>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.business_key().clone()).or_default().push(row);
    }
    for versions in groups.values_mut() {
        versions.sort_by_key(|v| v.valid_from());
    }
    groups
}

/// Index current rows by business key.
///
/// Non-current rows are ignored. More than one current row for a key is an
/// integrity error: it means history was already corrupted.
pub fn current_by_key<'a, V, I>(rows: I) -> Result<BTreeMap<BusinessKey, &'a V>, IntegrityError>
where
    V: Versioned + 'a,
    I: IntoIterator<Item = &'a V>,
{
    let mut index: BTreeMap<BusinessKey, &'a V> = BTreeMap::new();
    let mut duplicates: BTreeMap<BusinessKey, usize> = BTreeMap::new();
    for row in rows.into_iter().filter(|r| r.is_current()) {
        if index.insert(row.business_key().clone(), row).is_some() {
            *duplicates.entry(row.business_key().clone()).or_insert(1) += 1;
        }
    }
    match duplicates.into_iter().next() {
        Some((bk, count)) => Err(IntegrityError::MultipleCurrentRows {
            business_key: bk.to_string(),
            count,
        }),
        None => Ok(index),
    }
}

/// Verify the history of a single business key.
///
/// `versions` must be sorted by `valid_from`. Checks, in order: no empty
/// intervals, current flag agrees with the END_OF_TIME bound, consecutive
/// versions neither overlap nor leave a gap, exactly one current version and
/// it is the last one.
pub fn check_key_history<V: Versioned>(
    business_key: &BusinessKey,
    versions: &[&V],
) -> Result<(), IntegrityError> {
    let bk = business_key.to_string();

    for v in versions {
        if v.interval().is_empty() {
            return Err(IntegrityError::EmptyInterval {
                business_key: bk,
                sk: v.surrogate_key().to_string(),
            });
        }
        if v.is_current() != is_end_of_time(v.valid_to()) {
            return Err(IntegrityError::CurrentFlagMismatch {
                business_key: bk,
                sk: v.surrogate_key().to_string(),
            });
        }
    }

    for pair in versions.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if prev.valid_to() > next.valid_from() {
            return Err(IntegrityError::OverlappingIntervals {
                business_key: bk,
                first: prev.surrogate_key().to_string(),
                second: next.surrogate_key().to_string(),
            });
        }
        if prev.valid_to() < next.valid_from() {
            return Err(IntegrityError::GapInHistory {
                business_key: bk,
                gap_from: prev.valid_to(),
                gap_to: next.valid_from(),
            });
        }
    }

    let current = versions.iter().filter(|v| v.is_current()).count();
    match current {
        0 if !versions.is_empty() => Err(IntegrityError::NoCurrentRow { business_key: bk }),
        0 | 1 => Ok(()),
        count => Err(IntegrityError::MultipleCurrentRows {
            business_key: bk,
            count,
        }),
    }
}

/// Verify the history invariants for every business key in `rows`.
pub fn check_history<'a, V, I>(rows: I) -> Result<(), IntegrityError>
where
    V: Versioned + 'a,
    I: IntoIterator<Item = &'a V>,
{
    for (bk, versions) in group_by_business_key(rows) {
        check_key_history(&bk, &versions)?;
    }
    Ok(())
}
