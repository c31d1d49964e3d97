//! End-to-end tests for the batch pipeline
//!
//! Drives whole batches through `BatchProcessor` and checks the resulting
//! warehouse tables:
//! - Trader desk change lifecycle with point-in-time reads
//! - Identity determinism, namespace sensitivity, source isolation
//! - Fact corrections, enrichment failures, order aggregation
//! - Atomicity of rejected batches and snapshot round trip

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use tempfile::TempDir;

use merge_engine::config::{EngineConfig, MARKETS_NAMESPACE};
use merge_engine::identity::generate_id;
use merge_engine::pipeline::{BatchProcessor, PipelineError};
use merge_engine::resolver::PointInTimeResolver;
use persistence::snapshot::{Snapshot, SnapshotLoader, SnapshotWriter};
use persistence::warehouse::WarehouseState;
use types::batch::IngestBatch;
use types::dimension::IncomingDimensionRow;
use types::errors::{ConfigError, IntegrityError};
use types::fact::{FactGrain, Side, TradeEvent};
use types::ids::BusinessKey;
use types::time::end_of_time;
use types::versioned::check_history;

fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

fn trader(desk: &str, effective: DateTime<Utc>) -> IncomingDimensionRow {
    IncomingDimensionRow::from_pairs(
        [
            ("trader_id", "TRD001"),
            ("trader_name", "Alice Smith"),
            ("desk", desk),
            ("compliance_officer", "Bob Jones"),
        ],
        effective,
    )
}

fn event(order_id: &str, seq: u64, status: &str, price: i64) -> TradeEvent {
    TradeEvent {
        source_system: "MUREX".to_string(),
        source_event_id: format!("MX-{order_id}-{seq}"),
        order_id: order_id.to_string(),
        event_seq: seq,
        event_type: if seq == 1 { "NEW" } else { "FILL" }.to_string(),
        event_timestamp_utc: Utc.with_ymd_and_hms(2024, 3, 1, 10, seq as u32, 0).unwrap(),
        side: Side::SELL,
        quantity: Decimal::from(500),
        price: Decimal::from(price),
        currency: "USD".to_string(),
        status: status.to_string(),
        trader_id: Some("TRD001".to_string()),
        counterparty_id: None,
        counterparty_name: None,
        instrument_id: None,
        book_id: None,
        extra: Default::default(),
    }
}

fn processor() -> BatchProcessor {
    BatchProcessor::new(EngineConfig::default()).unwrap()
}

fn traders_batch(desk: &str, effective: DateTime<Utc>, loaded_at: DateTime<Utc>) -> IngestBatch {
    IngestBatch::new(loaded_at).with_dimension_rows("traders", vec![trader(desk, effective)])
}

#[test]
fn test_trader_desk_change_lifecycle() {
    let p = processor();
    let mut state = WarehouseState::empty();

    p.process(&mut state, &traders_batch("Commodities", at(2024, 1, 1), at(2024, 1, 1)))
        .unwrap();
    let traders = state.dimension("traders").unwrap();
    assert_eq!(traders.len(), 1);
    let first = traders.current_rows()[0].clone();
    assert_eq!(first.valid_from, at(2024, 1, 1));
    assert_eq!(first.valid_to, end_of_time());

    // Same attributes again: nothing changes.
    let hash = state.compute_hash();
    let rerun = p
        .process(&mut state, &traders_batch("Commodities", at(2024, 1, 1), at(2024, 1, 2)))
        .unwrap();
    assert!(!rerun.changed);
    assert_eq!(state.compute_hash(), hash);

    p.process(&mut state, &traders_batch("Rates", at(2024, 6, 15), at(2024, 6, 15)))
        .unwrap();
    let traders = state.dimension("traders").unwrap();
    let history = traders.history(&BusinessKey::new("TRD001"));
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].sk, first.sk);
    assert_eq!(history[0].valid_to, at(2024, 6, 15));
    assert!(!history[0].is_current);
    assert_eq!(history[1].valid_from, at(2024, 6, 15));
    assert!(history[1].is_current);
    assert!(check_history(traders.rows()).is_ok());

    let resolver = PointInTimeResolver::from_table(traders);
    let bk = BusinessKey::new("TRD001");
    let march = resolver.resolve(&bk, at(2024, 3, 1)).unwrap().unwrap();
    assert_eq!(march.attribute_str("desk").as_deref(), Some("Commodities"));
    let july = resolver.resolve(&bk, at(2024, 7, 1)).unwrap().unwrap();
    assert_eq!(july.attribute_str("desk").as_deref(), Some("Rates"));
}

#[test]
fn test_identity_properties() {
    let a = generate_id(MARKETS_NAMESPACE, "markets", "MUREX", "T-1");
    assert_eq!(a, generate_id(MARKETS_NAMESPACE, "markets", "MUREX", "T-1"));
    assert_eq!(a.as_str().len(), 32);

    let other_ns = generate_id("00000000-0000-0000-0000-000000000000", "markets", "MUREX", "T-1");
    assert_ne!(a, other_ns);

    let other_source = generate_id(MARKETS_NAMESPACE, "markets", "CALYPSO", "T-1");
    assert_ne!(a, other_source);
}

#[test]
fn test_fact_correction_versioning() {
    let p = processor();
    let mut state = WarehouseState::empty();
    let setup = traders_batch("Rates", at(2024, 1, 1), at(2024, 1, 1));
    p.process(&mut state, &setup).unwrap();

    let t1 = at(2024, 3, 1);
    let b1 = IngestBatch::new(t1).with_events(vec![event("ORD-9", 1, "OPEN", 100)]);
    p.process(&mut state, &b1).unwrap();

    let t2 = at(2024, 3, 4);
    let b2 = IngestBatch::new(t2).with_events(vec![event("ORD-9", 1, "OPEN", 102)]);
    let report = p.process(&mut state, &b2).unwrap();
    assert_eq!(report.events.corrected, 1);

    let history = state.event_facts.history(&BusinessKey::new("ORD-9|1"));
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].valid_from_utc, t1);
    assert_eq!(history[0].valid_to_utc, t2);
    assert!(!history[0].is_current);
    assert_eq!(history[1].valid_from_utc, t2);
    assert_eq!(history[1].payload.price, Decimal::from(102));
    assert_eq!(history[0].event_id, history[1].event_id);
    assert_ne!(history[0].fact_sk, history[1].fact_sk);

    // What did we believe on 2024-03-02?
    let resolver = PointInTimeResolver::from_table(&state.event_facts);
    let believed = resolver
        .resolve(&BusinessKey::new("ORD-9|1"), at(2024, 3, 2))
        .unwrap()
        .unwrap();
    assert_eq!(believed.payload.price, Decimal::from(100));
    assert!(state.check_integrity().is_ok());
}

#[test]
fn test_enrichment_failure_is_graceful() {
    let p = processor();
    let mut state = WarehouseState::empty();
    let mut e = event("ORD-5", 1, "OPEN", 100);
    e.trader_id = Some("TRD404".to_string());

    let report = p
        .process(&mut state, &IngestBatch::new(at(2024, 3, 1)).with_events(vec![e]))
        .unwrap();
    assert_eq!(report.events.inserted, 1);
    assert_eq!(report.quality.trader_not_found, 1);

    let fact = state.event_facts.current_rows()[0];
    assert!(fact.keys.trader_sk.is_none());
    assert!(fact.quality.trader_not_found);
    assert!(!fact.quality.counterparty_not_found);
}

#[test]
fn test_order_aggregate_tracks_lifecycle() {
    let p = processor();
    let mut state = WarehouseState::empty();

    let b1 = IngestBatch::new(at(2024, 3, 1)).with_events(vec![
        event("ORD-1", 2, "PARTIAL", 100),
        event("ORD-1", 1, "OPEN", 100),
    ]);
    p.process(&mut state, &b1).unwrap();

    let b2 = IngestBatch::new(at(2024, 3, 2)).with_events(vec![event("ORD-1", 3, "FILLED", 100)]);
    let report = p.process(&mut state, &b2).unwrap();
    assert_eq!(report.orders.corrected, 1);

    let orders = state.order_facts.history(&BusinessKey::new("ORD-1"));
    assert_eq!(orders.len(), 2);
    let latest = orders[1];
    assert_eq!(latest.grain, FactGrain::Order);
    assert_eq!(latest.payload.status, "FILLED");
    let seqs: Vec<u64> = latest.sub_events.iter().map(|s| s.event_seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(orders[0].sub_events.len(), 2);
    assert_eq!(
        latest.event_id,
        p.identity().generate_order_id("MUREX", "ORD-1")
    );
}

#[test]
fn test_extra_attributes_deduplicated() {
    let p = processor();
    let mut state = WarehouseState::empty();

    let mut a = event("ORD-1", 1, "OPEN", 100);
    a.extra.insert("venue".to_string(), serde_json::json!("XLON"));
    let mut b = event("ORD-2", 1, "OPEN", 100);
    b.extra.insert("venue".to_string(), serde_json::json!("XLON"));
    let plain = event("ORD-3", 1, "OPEN", 100);

    let report = p
        .process(&mut state, &IngestBatch::new(at(2024, 3, 1)).with_events(vec![a, b, plain]))
        .unwrap();
    assert_eq!(report.extra_attributes_added, 1);
    // Sentinel plus one payload.
    assert_eq!(state.extra_attributes.len(), 2);

    let keys: Vec<i64> = state
        .event_facts
        .rows()
        .map(|f| f.extra_attributes_key.value())
        .collect();
    assert_eq!(keys.iter().filter(|k| **k == -1).count(), 1);
}

#[test]
fn test_rejected_batch_leaves_state_unchanged() {
    let p = processor();
    let mut state = WarehouseState::empty();
    let loaded_at = at(2024, 3, 5);
    p.process(
        &mut state,
        &IngestBatch::new(loaded_at).with_events(vec![event("ORD-1", 1, "OPEN", 100)]),
    )
    .unwrap();
    let before = state.compute_hash();

    // A correction loaded at the same instant as the current version.
    let bad = traders_batch("Rates", at(2024, 3, 1), loaded_at)
        .with_events(vec![event("ORD-1", 1, "OPEN", 101)]);
    let err = p.process(&mut state, &bad).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Integrity(IntegrityError::OutOfOrderBatch { .. })
    ));
    assert_eq!(state.compute_hash(), before);
    assert!(state.dimension("traders").is_none());
}

#[test]
fn test_namespace_guard() {
    let mut state = WarehouseState::empty();
    processor()
        .process(&mut state, &traders_batch("Rates", at(2024, 1, 1), at(2024, 1, 1)))
        .unwrap();

    let config = EngineConfig {
        namespace: "11111111-2222-3333-4444-555555555555".to_string(),
        ..EngineConfig::default()
    };
    let err = BatchProcessor::new(config)
        .unwrap()
        .process(&mut state, &traders_batch("Credit", at(2024, 2, 1), at(2024, 2, 1)))
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Config(ConfigError::NamespaceMismatch { .. })
    ));
}

#[test]
fn test_snapshot_round_trip_after_batches() {
    let p = processor();
    let mut state = WarehouseState::empty();
    p.process(&mut state, &traders_batch("Commodities", at(2024, 1, 1), at(2024, 1, 1)))
        .unwrap();
    p.process(
        &mut state,
        &traders_batch("Rates", at(2024, 6, 15), at(2024, 6, 15))
            .with_events(vec![event("ORD-1", 1, "OPEN", 100)]),
    )
    .unwrap();

    let dir = TempDir::new().unwrap();
    let snapshot = Snapshot::of(state.clone(), at(2024, 6, 16));
    SnapshotWriter::new(dir.path(), true).write(&snapshot).unwrap();

    let loaded = SnapshotLoader::new(dir.path()).load_latest().unwrap();
    assert!(loaded.verify_integrity());
    assert_eq!(loaded.state.compute_hash(), state.compute_hash());
    assert_eq!(loaded.sequence, 2);

    // Processing continues from the loaded state.
    let mut resumed = loaded.state;
    let report = p
        .process(&mut resumed, &traders_batch("Rates", at(2024, 6, 15), at(2024, 6, 20)))
        .unwrap();
    assert!(!report.changed);
}
