//! Time axis primitives
//!
//! All validity intervals are half-open `[from, to)`. A current version is
//! open-ended and carries [`end_of_time`] as its upper bound.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unix seconds of `9999-12-31T23:59:59Z`.
pub const END_OF_TIME_SECS: i64 = 253_402_300_799;

/// Sentinel upper bound of every current version.
pub fn end_of_time() -> DateTime<Utc> {
    Utc.timestamp_opt(END_OF_TIME_SECS, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn is_end_of_time(ts: DateTime<Utc>) -> bool {
    ts == end_of_time()
}

/// Half-open validity interval `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl Interval {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// Interval starting at `from` that has not been closed.
    pub fn open(from: DateTime<Utc>) -> Self {
        Self::new(from, end_of_time())
    }

    pub fn is_open(&self) -> bool {
        is_end_of_time(self.to)
    }

    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.from <= ts && ts < self.to
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.from < other.to && other.from < self.to
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_open() {
            write!(f, "[{}, END_OF_TIME)", self.from.to_rfc3339())
        } else {
            write!(f, "[{}, {})", self.from.to_rfc3339(), self.to.to_rfc3339())
        }
    }
}
