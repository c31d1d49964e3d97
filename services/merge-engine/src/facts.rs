//! Bi-temporal fact versioning
//!
//! Facts carry two independent time axes. Business time
//! (`event_timestamp_utc`) comes from the source. System time
//! (`valid_from_utc`, `valid_to_utc`) is the batch `loaded_at`: a version
//! starts when the batch that produced it was loaded.
//!
//! Per `event_bk`:
//! - unseen: insert a new current version
//! - same content hash: no-op
//! - different content: close the current version at `loaded_at` and
//!   insert the correction as the new current version

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, error};
use types::dimension::AttributeMap;
use types::errors::IntegrityError;
use types::fact::{
    content_hash, FactDelta, FactGrain, FactPayload, FactVersion, ForeignKeys, QualityFlags,
    SubEvent, TradeEvent,
};
use types::hashing::surrogate_key;
use types::ids::{BatchId, BusinessKey, EntityId, SurrogateKey};
use types::time::end_of_time;
use types::versioned::{current_by_key, CloseOp};

use crate::dialect::Dialect;
use crate::enrichment::{DimensionLookup, Enricher};
use crate::extra_attributes::ExtraAttributeRegistry;
use crate::identity::IdentityGenerator;

/// A fact as computed from the batch, before comparison with history.
#[derive(Debug, Clone, PartialEq)]
pub struct FactCandidate {
    pub event_bk: BusinessKey,
    pub event_id: EntityId,
    pub grain: FactGrain,
    pub event_timestamp_utc: DateTime<Utc>,
    pub payload: FactPayload,
    pub sub_events: Vec<SubEvent>,
    pub keys: ForeignKeys,
    pub quality: QualityFlags,
    pub extra: AttributeMap,
}

impl FactCandidate {
    pub fn content_hash(&self) -> String {
        content_hash(&self.payload, &self.sub_events, &self.extra)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FactStats {
    pub inserted: usize,
    /// Existing facts re-versioned by a correction.
    pub corrected: usize,
    pub unchanged: usize,
    /// Earlier rows for an `event_bk` dropped in favour of the last one.
    pub duplicates: usize,
}

/// Keep the last event per `event_bk`, in business key order.
pub fn dedupe_events(events: &[TradeEvent]) -> (Vec<&TradeEvent>, usize) {
    let mut latest: BTreeMap<BusinessKey, &TradeEvent> = BTreeMap::new();
    for event in events {
        latest.insert(event.event_bk(), event);
    }
    let duplicates = events.len() - latest.len();
    (latest.into_values().collect(), duplicates)
}

pub struct FactVersioner<'a> {
    identity: &'a IdentityGenerator,
    dialect: &'a dyn Dialect,
    batch_id: BatchId,
    loaded_at: DateTime<Utc>,
}

impl<'a> FactVersioner<'a> {
    pub fn new(
        identity: &'a IdentityGenerator,
        dialect: &'a dyn Dialect,
        batch_id: BatchId,
        loaded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            identity,
            dialect,
            batch_id,
            loaded_at: dialect.truncate_timestamp(loaded_at),
        }
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Event-grain candidate with resolved foreign keys.
    pub fn event_candidate<L: DimensionLookup>(
        &self,
        event: &TradeEvent,
        enricher: &Enricher<'_, L>,
    ) -> FactCandidate {
        let (keys, quality) = enricher.resolve(event);
        FactCandidate {
            event_bk: event.event_bk(),
            event_id: self
                .identity
                .generate_event_id(&event.source_system, &event.source_event_id),
            grain: FactGrain::Event,
            event_timestamp_utc: self.dialect.truncate_timestamp(event.event_timestamp_utc),
            payload: FactPayload::from_event(event),
            sub_events: Vec::new(),
            keys,
            quality,
            extra: event.extra.clone(),
        }
    }

    /// Version event-grain facts against the current event facts.
    pub fn version_events<L: DimensionLookup>(
        &self,
        events: &[&TradeEvent],
        current: &[FactVersion],
        enricher: &Enricher<'_, L>,
        registry: &mut ExtraAttributeRegistry<'_>,
    ) -> Result<(FactDelta, FactStats), IntegrityError> {
        let candidates = events
            .iter()
            .map(|e| self.event_candidate(e, enricher))
            .collect();
        self.version(candidates, current, registry)
    }

    /// Compare candidates with the current versions and plan the delta.
    pub fn version(
        &self,
        candidates: Vec<FactCandidate>,
        current: &[FactVersion],
        registry: &mut ExtraAttributeRegistry<'_>,
    ) -> Result<(FactDelta, FactStats), IntegrityError> {
        let current = current_by_key(current)?;
        let mut stats = FactStats::default();

        let total = candidates.len();
        let mut latest: BTreeMap<BusinessKey, FactCandidate> = BTreeMap::new();
        for candidate in candidates {
            latest.insert(candidate.event_bk.clone(), candidate);
        }
        stats.duplicates = total - latest.len();

        let mut delta = FactDelta::empty();
        for (bk, candidate) in latest {
            let hash = candidate.content_hash();
            match current.get(&bk) {
                None => {
                    debug!(event_bk = %bk, grain = ?candidate.grain, "New fact");
                    delta.to_insert.push(self.open_version(candidate, hash, registry));
                    stats.inserted += 1;
                }
                Some(existing) if existing.payload_hash == hash => {
                    stats.unchanged += 1;
                }
                Some(existing) if self.loaded_at <= existing.valid_from_utc => {
                    error!(
                        event_bk = %bk,
                        current_from = %existing.valid_from_utc,
                        loaded_at = %self.loaded_at,
                        "Correction is not after the current version"
                    );
                    return Err(IntegrityError::OutOfOrderBatch {
                        business_key: bk.to_string(),
                        current_from: existing.valid_from_utc,
                        loaded_at: self.loaded_at,
                    });
                }
                Some(existing) => {
                    debug!(
                        event_bk = %bk,
                        grain = ?candidate.grain,
                        previous_sk = %existing.fact_sk,
                        "Correction, closing current version"
                    );
                    delta.to_close.push(CloseOp {
                        sk: existing.fact_sk.clone(),
                        business_key: bk.clone(),
                        valid_to: self.loaded_at,
                    });
                    delta.to_insert.push(self.open_version(candidate, hash, registry));
                    stats.corrected += 1;
                }
            }
        }
        Ok((delta, stats))
    }

    /// `MD5(event_bk-loaded_at)`.
    pub fn fact_sk(&self, bk: &BusinessKey) -> SurrogateKey {
        let rendered = self.dialect.render_timestamp(self.loaded_at);
        surrogate_key([Some(bk.as_str()), Some(rendered.as_str())])
    }

    fn open_version(
        &self,
        candidate: FactCandidate,
        payload_hash: String,
        registry: &mut ExtraAttributeRegistry<'_>,
    ) -> FactVersion {
        let extra_attributes_key = registry.register(&candidate.extra);
        FactVersion {
            fact_sk: self.fact_sk(&candidate.event_bk),
            event_bk: candidate.event_bk,
            event_id: candidate.event_id,
            grain: candidate.grain,
            event_timestamp_utc: candidate.event_timestamp_utc,
            payload: candidate.payload,
            sub_events: candidate.sub_events,
            keys: candidate.keys,
            quality: candidate.quality,
            extra_attributes_key,
            payload_hash,
            batch_id: self.batch_id,
            valid_from_utc: self.loaded_at,
            valid_to_utc: end_of_time(),
            is_current: true,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{EnrichmentConfig, MARKETS_NAMESPACE};
    use crate::dialect::DialectKind;
    use crate::enrichment::CurrentDimensionIndex;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use serde_json::json;
    use types::fact::{ExtraAttributeRow, Side};
    use types::ids::ExtraAttributesKey;

    pub(crate) fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    pub(crate) fn trade(order_id: &str, seq: u64, status: &str, price: i64) -> TradeEvent {
        TradeEvent {
            source_system: "MUREX".into(),
            source_event_id: format!("{order_id}-{seq}"),
            order_id: order_id.into(),
            event_seq: seq,
            event_type: if seq == 1 { "NEW".into() } else { "FILL".into() },
            event_timestamp_utc: Utc.with_ymd_and_hms(2024, 3, 1, 9, seq as u32, 0).unwrap(),
            side: Side::BUY,
            quantity: Decimal::from(100),
            price: Decimal::from(price),
            currency: "USD".into(),
            status: status.into(),
            trader_id: Some("TRD001".into()),
            counterparty_id: None,
            counterparty_name: None,
            instrument_id: None,
            book_id: None,
            extra: AttributeMap::new(),
        }
    }

    pub(crate) fn identity() -> IdentityGenerator {
        IdentityGenerator::new(MARKETS_NAMESPACE, "markets", DialectKind::BigQuery.dialect()).unwrap()
    }

    struct Fixture {
        identity: IdentityGenerator,
        index: CurrentDimensionIndex,
        config: EnrichmentConfig,
        known: BTreeMap<ExtraAttributesKey, ExtraAttributeRow>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                identity: identity(),
                index: CurrentDimensionIndex::new(),
                config: EnrichmentConfig::default(),
                known: BTreeMap::new(),
            }
        }

        fn run(
            &self,
            loaded_at: DateTime<Utc>,
            events: &[TradeEvent],
            current: &[FactVersion],
        ) -> Result<(FactDelta, FactStats), IntegrityError> {
            let dialect = DialectKind::BigQuery.dialect();
            let versioner = FactVersioner::new(&self.identity, dialect, BatchId::new(), loaded_at);
            let enricher = Enricher::new(&self.index, &self.config);
            let mut registry = ExtraAttributeRegistry::new(&self.known, loaded_at);
            let (events, _) = dedupe_events(events);
            versioner.version_events(&events, current, &enricher, &mut registry)
        }
    }

    fn apply(mut rows: Vec<FactVersion>, delta: &FactDelta) -> Vec<FactVersion> {
        for op in &delta.to_close {
            let r = rows.iter_mut().find(|r| r.fact_sk == op.sk).unwrap();
            r.valid_to_utc = op.valid_to;
            r.is_current = false;
        }
        rows.extend(delta.to_insert.iter().cloned());
        rows
    }

    fn current(rows: &[FactVersion]) -> Vec<FactVersion> {
        rows.iter().filter(|r| r.is_current).cloned().collect()
    }

    #[test]
    fn test_new_event_starts_at_loaded_at() {
        let fx = Fixture::new();
        let t1 = at(2024, 3, 2);
        let (delta, stats) = fx.run(t1, &[trade("ORD-1", 1, "OPEN", 100)], &[]).unwrap();
        assert_eq!(stats.inserted, 1);

        let v = &delta.to_insert[0];
        assert_eq!(v.event_bk.as_str(), "ORD-1|1");
        assert_eq!(v.valid_from_utc, t1);
        assert_eq!(v.valid_to_utc, end_of_time());
        assert!(v.is_current);
        assert_eq!(v.extra_attributes_key, ExtraAttributesKey::NONE);
        assert_eq!(
            v.event_id,
            fx.identity.generate_event_id("MUREX", "ORD-1-1")
        );
    }

    #[test]
    fn test_rerun_is_noop() {
        let fx = Fixture::new();
        let events = vec![trade("ORD-1", 1, "OPEN", 100)];
        let (d1, _) = fx.run(at(2024, 3, 2), &events, &[]).unwrap();
        let table = apply(vec![], &d1);

        let (d2, stats) = fx.run(at(2024, 3, 3), &events, &current(&table)).unwrap();
        assert!(d2.is_empty());
        assert_eq!(stats.unchanged, 1);
    }

    #[test]
    fn test_correction_closes_prior_version() {
        let fx = Fixture::new();
        let (d1, _) = fx
            .run(at(2024, 3, 2), &[trade("ORD-1", 2, "FILLED", 100)], &[])
            .unwrap();
        let table = apply(vec![], &d1);

        let t2 = at(2024, 3, 5);
        let (d2, stats) = fx
            .run(t2, &[trade("ORD-1", 2, "FILLED", 101)], &current(&table))
            .unwrap();
        assert_eq!(stats.corrected, 1);
        assert_eq!(d2.to_close[0].valid_to, t2);

        let table = apply(table, &d2);
        assert_eq!(table.len(), 2);
        assert_eq!(current(&table).len(), 1);
        assert_eq!(current(&table)[0].payload.price, Decimal::from(101));
        assert!(types::versioned::check_history(&table).is_ok());
    }

    #[test]
    fn test_out_of_order_correction_is_fatal() {
        let fx = Fixture::new();
        let (d1, _) = fx
            .run(at(2024, 3, 5), &[trade("ORD-1", 1, "OPEN", 100)], &[])
            .unwrap();
        let table = apply(vec![], &d1);

        let result = fx.run(at(2024, 3, 5), &[trade("ORD-1", 1, "OPEN", 99)], &current(&table));
        assert!(matches!(result, Err(IntegrityError::OutOfOrderBatch { .. })));
    }

    #[test]
    fn test_duplicate_event_last_wins() {
        let fx = Fixture::new();
        let events = vec![
            trade("ORD-1", 1, "OPEN", 100),
            trade("ORD-1", 1, "OPEN", 105),
        ];
        let (delta, _) = fx.run(at(2024, 3, 2), &events, &[]).unwrap();
        assert_eq!(delta.to_insert.len(), 1);
        assert_eq!(delta.to_insert[0].payload.price, Decimal::from(105));
        assert_eq!(dedupe_events(&events).1, 1);
    }

    #[test]
    fn test_unresolved_trader_still_inserted() {
        let fx = Fixture::new();
        let (delta, _) = fx
            .run(at(2024, 3, 2), &[trade("ORD-1", 1, "OPEN", 100)], &[])
            .unwrap();
        let v = &delta.to_insert[0];
        assert!(v.quality.trader_not_found);
        assert!(v.keys.trader_sk.is_none());
    }

    #[test]
    fn test_extra_attributes_registered() {
        let fx = Fixture::new();
        let mut e = trade("ORD-1", 1, "OPEN", 100);
        e.extra.insert("venue".into(), json!("XLON"));
        let loaded_at = at(2024, 3, 2);

        let dialect = DialectKind::BigQuery.dialect();
        let versioner = FactVersioner::new(&fx.identity, dialect, BatchId::new(), loaded_at);
        let enricher = Enricher::new(&fx.index, &fx.config);
        let mut registry = ExtraAttributeRegistry::new(&fx.known, loaded_at);
        let (delta, _) = versioner
            .version_events(&[&e], &[], &enricher, &mut registry)
            .unwrap();

        let key = delta.to_insert[0].extra_attributes_key;
        assert!(!key.is_sentinel());
        let rows = registry.into_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, key);
    }
}
