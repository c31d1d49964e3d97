//! Persistence for the bi-temporal warehouse
//!
//! Holds versioned dimension and fact tables in memory, applies batch
//! deltas atomically, and writes integrity-checked snapshots.
//!
//! # Guarantees
//! - A commit applies closes before inserts and verifies the history
//!   invariants of every affected business key before it becomes visible
//! - A failed commit leaves the state exactly as it was
//! - BTreeMap-backed state gives deterministic iteration and hashing

pub mod table;
pub mod warehouse;
pub mod snapshot;
pub mod determinism;
