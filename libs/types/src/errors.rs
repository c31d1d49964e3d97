//! Error types for the merge and versioning engines
//!
//! Both families are fatal and abort the batch. Data-quality problems are
//! not errors: they travel as flags on the output rows.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Top-level engine error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),
}

/// A single input row that does not carry a required column.
#[derive(Debug, Clone, PartialEq)]
pub struct MissingColumn {
    pub row_index: usize,
    pub business_key: Option<String>,
    pub column: String,
}

/// Configuration errors: caught before any row is merged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error(
        "Dimension {dimension}: {} row(s) missing required columns (first: row {}, column {})",
        .rows.len(),
        .rows.first().map(|r| r.row_index).unwrap_or_default(),
        .rows.first().map(|r| r.column.as_str()).unwrap_or_default()
    )]
    MissingColumns {
        dimension: String,
        rows: Vec<MissingColumn>,
    },

    #[error("Namespace mismatch: warehouse was built with {recorded}, configured {configured}")]
    NamespaceMismatch { recorded: String, configured: String },

    #[error("Invalid namespace {namespace:?}: {reason}")]
    InvalidNamespace { namespace: String, reason: String },

    #[error("Dimension {dimension} declares no {what} columns")]
    NoColumns { dimension: String, what: String },

    #[error("Dimension {dimension} declares column {column} more than once")]
    DuplicateColumn { dimension: String, column: String },

    #[error("Dimension {dimension} has no tracked column {column}")]
    UnknownColumn { dimension: String, column: String },

    #[error("Dimension {name} is declared more than once")]
    DuplicateDimension { name: String },

    #[error("Unknown dimension: {name}")]
    UnknownDimension { name: String },

    #[error("Invalid configuration document: {reason}")]
    InvalidDocument { reason: String },
}

/// Invariant violations: signal that previously written history is corrupt
/// or that a batch would corrupt it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntegrityError {
    #[error("Business key {business_key} has {count} current rows")]
    MultipleCurrentRows { business_key: String, count: usize },

    #[error("Business key {business_key} has no current row")]
    NoCurrentRow { business_key: String },

    #[error("Business key {business_key} resolves to {matches} rows as of {as_of}")]
    AmbiguousResolution {
        business_key: String,
        as_of: DateTime<Utc>,
        matches: usize,
    },

    #[error("Business key {business_key}: versions {first} and {second} overlap")]
    OverlappingIntervals {
        business_key: String,
        first: String,
        second: String,
    },

    #[error("Business key {business_key}: gap in history between {gap_from} and {gap_to}")]
    GapInHistory {
        business_key: String,
        gap_from: DateTime<Utc>,
        gap_to: DateTime<Utc>,
    },

    #[error("Business key {business_key}: version {sk} has an empty interval")]
    EmptyInterval { business_key: String, sk: String },

    #[error("Business key {business_key}: version {sk} current flag disagrees with valid_to")]
    CurrentFlagMismatch { business_key: String, sk: String },

    #[error("Surrogate key {sk} is not a current version")]
    UnknownVersion { sk: String },

    #[error("Surrogate key {sk} already exists")]
    DuplicateSurrogateKey { sk: String },

    #[error(
        "Business key {business_key}: batch loaded at {loaded_at} is not after current version from {current_from}"
    )]
    OutOfOrderBatch {
        business_key: String,
        current_from: DateTime<Utc>,
        loaded_at: DateTime<Utc>,
    },
}

impl IntegrityError {
    /// Business key the violation was found on, if any.
    pub fn business_key(&self) -> Option<&str> {
        match self {
            IntegrityError::MultipleCurrentRows { business_key, .. }
            | IntegrityError::NoCurrentRow { business_key }
            | IntegrityError::AmbiguousResolution { business_key, .. }
            | IntegrityError::OverlappingIntervals { business_key, .. }
            | IntegrityError::GapInHistory { business_key, .. }
            | IntegrityError::EmptyInterval { business_key, .. }
            | IntegrityError::CurrentFlagMismatch { business_key, .. }
            | IntegrityError::OutOfOrderBatch { business_key, .. } => Some(business_key),
            IntegrityError::UnknownVersion { .. } | IntegrityError::DuplicateSurrogateKey { .. } => {
                None
            }
        }
    }
}
