//! Bi-temporal Merge Engine
//!
//! Turns ingestion batches into versioned warehouse tables:
//! - SCD2 dimensions with half-open validity intervals
//! - Bi-temporal trade facts at event grain and order grain
//! - Deterministic cross-source identity under a fixed namespace
//! - Point-in-time resolution for any versioned table
//!
//! # Architecture
//!
//! ```text
//!  IngestBatch ─┬─► Scd2MergeEngine (per dimension) ──┐
//!               │                                     │ stage
//!               │        CurrentDimensionIndex ◄──────┘
//!               │                 │
//!               └─► FactVersioner ┴─ OrderAggregator
//!                          │
//!                   WarehouseDelta ──► WarehouseState::commit
//! ```
//!
//! Every step is a pure function of (state, batch). Output ordering comes
//! from BTreeMaps and stable sorts, so re-running a batch is a no-op and two
//! replays of the same batches hash identically.

pub mod config;
pub mod dialect;
pub mod enrichment;
pub mod extra_attributes;
pub mod facts;
pub mod identity;
pub mod orders;
pub mod pipeline;
pub mod resolver;
pub mod scd2;
