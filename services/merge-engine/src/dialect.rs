//! Dialect strategy
//!
//! Everything that depends on the storage engine's SQL semantics (string
//! casts, timestamp precision and rendering, hashing) goes through a
//! [`Dialect`]. The merge and versioning algorithms are written once
//! against this trait.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use types::hashing::md5_hex;

/// Granularity for [`Dialect::date_trunc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Month,
    Year,
}

pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// `CAST(value AS STRING)` with null normalised to the empty string.
    fn cast_to_string(&self, value: &Value) -> String {
        match value {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            other => other.to_string(),
        }
    }

    /// Timestamp literal as the engine renders `CAST(ts AS STRING)`.
    fn render_timestamp(&self, ts: DateTime<Utc>) -> String;

    /// Round down to the engine's storage precision.
    fn truncate_timestamp(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let micros = ts.nanosecond() / 1_000 * 1_000;
        ts.with_nanosecond(micros).unwrap_or(ts)
    }

    fn date_trunc(&self, ts: DateTime<Utc>, unit: TimeUnit) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let floor = |step: i64| {
            Utc.timestamp_opt(secs - secs.rem_euclid(step), 0)
                .single()
                .unwrap_or(ts)
        };
        let midnight = |year: i32, month: u32, day: u32| {
            Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
                .single()
                .unwrap_or(ts)
        };
        match unit {
            TimeUnit::Second => floor(1),
            TimeUnit::Minute => floor(60),
            TimeUnit::Hour => floor(3_600),
            TimeUnit::Day => floor(86_400),
            TimeUnit::Month => midnight(ts.year(), ts.month(), 1),
            TimeUnit::Year => midnight(ts.year(), 1, 1),
        }
    }

    /// `TO_HEX(MD5(input))`.
    fn hash_hex(&self, input: &str) -> String {
        md5_hex(input)
    }
}

/// BigQuery: `2024-01-01 00:00:00.000000 UTC`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BigQuery;

impl Dialect for BigQuery {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    fn render_timestamp(&self, ts: DateTime<Utc>) -> String {
        self.truncate_timestamp(ts)
            .format("%Y-%m-%d %H:%M:%S%.6f UTC")
            .to_string()
    }
}

/// DuckDB: `2024-01-01 00:00:00.000000+00`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DuckDb;

impl Dialect for DuckDb {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn render_timestamp(&self, ts: DateTime<Utc>) -> String {
        self.truncate_timestamp(ts)
            .format("%Y-%m-%d %H:%M:%S%.6f+00")
            .to_string()
    }
}

static BIGQUERY: BigQuery = BigQuery;
static DUCKDB: DuckDb = DuckDb;

/// Dialect selector used in configuration documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    #[default]
    BigQuery,
    DuckDb,
}

impl DialectKind {
    pub fn dialect(&self) -> &'static dyn Dialect {
        match self {
            DialectKind::BigQuery => &BIGQUERY,
            DialectKind::DuckDb => &DUCKDB,
        }
    }
}

impl fmt::Display for DialectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dialect().name())
    }
}
