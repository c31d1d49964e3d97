//! Determinism Guarantees: Replay comparison and property tests
//!
//! Features:
//! - Double apply: commit an identical delta sequence twice, compare state hashes
//! - Divergence report with a per-table diff
//! - Property-based replay tests (proptest)

use std::collections::BTreeSet;

use crate::warehouse::{CommitError, WarehouseDelta, WarehouseState};

// ── Divergence Report ───────────────────────────────────────────────

/// Detailed report when two warehouse states differ.
#[derive(Debug, Clone)]
pub struct DivergenceReport {
    pub hash_a: String,
    pub hash_b: String,
    pub namespace_match: bool,
    pub dimensions_match: bool,
    pub event_facts_match: bool,
    pub order_facts_match: bool,
    pub extra_attributes_match: bool,
    pub batches_match: bool,
    pub detail: String,
}

impl DivergenceReport {
    pub fn is_match(&self) -> bool {
        self.hash_a == self.hash_b
    }
}

// ── Determinism Verifier ────────────────────────────────────────────

/// Verifies deterministic behavior by comparing commit results.
pub struct DeterminismVerifier;

impl DeterminismVerifier {
    /// Commit `deltas` onto two copies of `base` and compare the results.
    pub fn verify_double_apply(
        base: &WarehouseState,
        deltas: &[WarehouseDelta],
    ) -> Result<DivergenceReport, CommitError> {
        let state_a = Self::replay(base, deltas)?;
        let state_b = Self::replay(base, deltas)?;
        Ok(Self::compare_states(&state_a, &state_b))
    }

    /// Generate a detailed divergence report from two states.
    pub fn compare_states(state_a: &WarehouseState, state_b: &WarehouseState) -> DivergenceReport {
        let hash_a = state_a.compute_hash();
        let hash_b = state_b.compute_hash();

        let namespace_match = state_a.namespace == state_b.namespace;
        let dimensions_match = state_a.dimensions == state_b.dimensions;
        let event_facts_match = state_a.event_facts == state_b.event_facts;
        let order_facts_match = state_a.order_facts == state_b.order_facts;
        let extra_attributes_match = state_a.extra_attributes == state_b.extra_attributes;
        let batches_match = state_a.batches == state_b.batches;

        let mut details = Vec::new();
        if !namespace_match {
            details.push(format!(
                "Namespace differs: {:?} vs {:?}",
                state_a.namespace, state_b.namespace
            ));
        }
        if !dimensions_match {
            let names: BTreeSet<&String> = state_a
                .dimensions
                .keys()
                .chain(state_b.dimensions.keys())
                .collect();
            for name in names {
                let a = state_a.dimensions.get(name);
                let b = state_b.dimensions.get(name);
                if a != b {
                    details.push(format!(
                        "Dimension {} differs: {} vs {} rows",
                        name,
                        a.map(|t| t.len()).unwrap_or(0),
                        b.map(|t| t.len()).unwrap_or(0)
                    ));
                }
            }
        }
        if !event_facts_match {
            details.push(format!(
                "Event facts differ: {} vs {} rows",
                state_a.event_facts.len(),
                state_b.event_facts.len()
            ));
        }
        if !order_facts_match {
            details.push(format!(
                "Order facts differ: {} vs {} rows",
                state_a.order_facts.len(),
                state_b.order_facts.len()
            ));
        }
        if !extra_attributes_match {
            details.push(format!(
                "Extra attributes differ: {} vs {} entries",
                state_a.extra_attributes.len(),
                state_b.extra_attributes.len()
            ));
        }
        if !batches_match {
            details.push(format!(
                "Batches differ: {} vs {} entries",
                state_a.batches.len(),
                state_b.batches.len()
            ));
        }

        let detail = if details.is_empty() {
            "States are identical".to_string()
        } else {
            details.join("; ")
        };

        DivergenceReport {
            hash_a,
            hash_b,
            namespace_match,
            dimensions_match,
            event_facts_match,
            order_facts_match,
            extra_attributes_match,
            batches_match,
            detail,
        }
    }

    // ── Internal ────────────────────────────────────────────────────

    fn replay(
        base: &WarehouseState,
        deltas: &[WarehouseDelta],
    ) -> Result<WarehouseState, CommitError> {
        let mut state = base.clone();
        for delta in deltas {
            state.commit(delta)?;
        }
        Ok(state)
    }
}

// ── Tests ───────────────────────────────────────────────────────────


// ── Property-Based Tests ────────────────────────────────────────────
