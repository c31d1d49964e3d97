//! Types library for the bi-temporal warehouse
//!
//! Row types, identifiers and invariants shared by the merge engine and the
//! persistence layer. Everything here is pure data plus pure functions.
//!
//! # Modules
//! - `hashing`: Surrogate keys, MD5/SHA-256 helpers, integer fingerprints
//! - `ids`: Identifiers (EntityId, SurrogateKey, BusinessKey, BatchId)
//! - `time`: END_OF_TIME sentinel and half-open intervals
//! - `versioned`: Version row abstraction, deltas, history invariants
//! - `dimension`: SCD2 dimension rows
//! - `fact`: Bi-temporal trade/order fact rows
//! - `batch`: Ingestion batch
//! - `errors`: Error taxonomy

pub mod hashing;
pub mod ids;
pub mod time;
pub mod versioned;
pub mod dimension;
pub mod fact;
pub mod batch;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::batch::*;
    pub use crate::dimension::*;
    pub use crate::errors::*;
    pub use crate::fact::*;
    pub use crate::hashing::*;
    pub use crate::ids::*;
    pub use crate::time::*;
    pub use crate::versioned::*;
}
