//! Order-grain aggregation
//!
//! Lifecycle events are grouped by `order_id` into one parent fact per order.
//! The parent embeds every known lifecycle event as a `SubEvent`, ordered by
//! `event_seq`. Sub-events already on the current parent are carried forward,
//! so a batch holding only the latest fill still produces the full lifecycle.
//! The parent re-versions whenever that ordered list (or its payload)
//! changes.

use std::collections::BTreeMap;

use tracing::debug;
use types::dimension::AttributeMap;
use types::errors::IntegrityError;
use types::fact::{FactGrain, FactPayload, FactVersion, SubEvent, TradeEvent};
use types::ids::BusinessKey;
use types::versioned::current_by_key;

use crate::dialect::Dialect;
use crate::enrichment::{DimensionLookup, Enricher};
use crate::facts::FactCandidate;
use crate::identity::IdentityGenerator;

pub struct OrderAggregator<'a> {
    identity: &'a IdentityGenerator,
    dialect: &'a dyn Dialect,
}

impl<'a> OrderAggregator<'a> {
    pub fn new(identity: &'a IdentityGenerator, dialect: &'a dyn Dialect) -> Self {
        Self { identity, dialect }
    }

    pub fn sub_event(&self, event: &TradeEvent) -> SubEvent {
        SubEvent {
            event_seq: event.event_seq,
            event_id: self
                .identity
                .generate_event_id(&event.source_system, &event.source_event_id),
            event_type: event.event_type.clone(),
            event_timestamp_utc: self.dialect.truncate_timestamp(event.event_timestamp_utc),
            status: event.status.clone(),
            quantity: event.quantity,
            price: event.price,
        }
    }

    /// One order-grain candidate per order touched by `events`.
    ///
    /// `events` must already be deduplicated by `event_bk`. `current` holds
    /// the current order facts.
    pub fn candidates<L: DimensionLookup>(
        &self,
        events: &[&TradeEvent],
        current: &[FactVersion],
        enricher: &Enricher<'_, L>,
    ) -> Result<Vec<FactCandidate>, IntegrityError> {
        let current = current_by_key(current)?;

        let mut orders: BTreeMap<BusinessKey, Vec<&TradeEvent>> = BTreeMap::new();
        for &event in events {
            orders.entry(event.order_bk()).or_default().push(event);
        }

        let mut candidates = Vec::with_capacity(orders.len());
        for (order_bk, group) in orders {
            let Some(latest) = group.iter().copied().max_by_key(|e| e.event_seq) else {
                continue;
            };
            let parent = current.get(&order_bk).copied();

            let mut merged: BTreeMap<u64, SubEvent> = parent
                .map(|p| p.sub_events.iter().map(|s| (s.event_seq, s.clone())).collect())
                .unwrap_or_default();
            for event in &group {
                merged.insert(event.event_seq, self.sub_event(event));
            }
            let sub_events: Vec<SubEvent> = merged.into_values().collect();

            let stored_max = parent.and_then(|p| p.sub_events.iter().map(|s| s.event_seq).max());
            let (payload, keys, quality) = match parent {
                // A late event below the stored maximum keeps the parent's state.
                Some(p) if stored_max.is_some_and(|seq| seq > latest.event_seq) => {
                    (p.payload.clone(), p.keys.clone(), p.quality)
                }
                _ => {
                    let (keys, quality) = enricher.resolve(latest);
                    let payload = FactPayload {
                        event_seq: None,
                        ..FactPayload::from_event(latest)
                    };
                    (payload, keys, quality)
                }
            };

            let event_timestamp_utc = sub_events
                .iter()
                .map(|s| s.event_timestamp_utc)
                .min()
                .unwrap_or(latest.event_timestamp_utc);

            debug!(
                order_bk = %order_bk,
                sub_events = sub_events.len(),
                batch_events = group.len(),
                "Aggregated order"
            );
            candidates.push(FactCandidate {
                event_id: self
                    .identity
                    .generate_order_id(&payload.source_system, &payload.order_id),
                event_bk: order_bk,
                grain: FactGrain::Order,
                event_timestamp_utc,
                payload,
                sub_events,
                keys,
                quality,
                extra: AttributeMap::new(),
            });
        }
        Ok(candidates)
    }
}
