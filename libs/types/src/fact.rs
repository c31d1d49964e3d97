//! Trade/order fact rows (bi-temporal)
//!
//! Two time axes are carried independently:
//! - business time: `event_timestamp_utc`, when the event happened
//! - system time: `[valid_from_utc, valid_to_utc)`, when we believed it
//!
//! Facts exist at two grains. An `Event` fact is one lifecycle event keyed
//! `order_id|event_seq`. An `Order` fact is the parent order keyed by
//! `order_id`, embedding its lifecycle events as an ordered list.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::dimension::AttributeMap;
use crate::hashing::sha256_hex;
use crate::ids::{BatchId, BusinessKey, EntityId, ExtraAttributesKey, SurrogateKey};
use crate::versioned::{Delta, Versioned};

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    BUY,
    SELL,
}

/// Canonical trade/order lifecycle event from a source system.
///
/// Rows reach the engine already parsed and validated; anything outside
/// the canonical schema lands in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub source_system: String,
    /// Native id of the event in the source system.
    pub source_event_id: String,
    pub order_id: String,
    pub event_seq: u64,
    pub event_type: String,
    pub event_timestamp_utc: DateTime<Utc>,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub currency: String,
    pub status: String,
    #[serde(default)]
    pub trader_id: Option<String>,
    #[serde(default)]
    pub counterparty_id: Option<String>,
    #[serde(default)]
    pub counterparty_name: Option<String>,
    #[serde(default)]
    pub instrument_id: Option<String>,
    #[serde(default)]
    pub book_id: Option<String>,
    /// Schema-drift fields not in the canonical schema.
    #[serde(default)]
    pub extra: AttributeMap,
}

impl TradeEvent {
    pub fn event_bk(&self) -> BusinessKey {
        BusinessKey::event(&self.order_id, self.event_seq)
    }

    pub fn order_bk(&self) -> BusinessKey {
        BusinessKey::new(self.order_id.clone())
    }
}

/// Lifecycle event embedded in its parent order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubEvent {
    pub event_seq: u64,
    pub event_id: EntityId,
    pub event_type: String,
    pub event_timestamp_utc: DateTime<Utc>,
    pub status: String,
    pub quantity: Decimal,
    pub price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FactGrain {
    Event,
    Order,
}

/// Versioned business content of a fact. Changes here cause a new version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactPayload {
    pub source_system: String,
    pub order_id: String,
    /// `None` for order-grain facts.
    pub event_seq: Option<u64>,
    pub event_type: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub currency: String,
    pub status: String,
    pub trader_id: Option<String>,
    pub counterparty_id: Option<String>,
    pub counterparty_name: Option<String>,
    pub instrument_id: Option<String>,
    pub book_id: Option<String>,
}

impl FactPayload {
    pub fn from_event(event: &TradeEvent) -> Self {
        Self {
            source_system: event.source_system.clone(),
            order_id: event.order_id.clone(),
            event_seq: Some(event.event_seq),
            event_type: event.event_type.clone(),
            side: event.side,
            quantity: event.quantity,
            price: event.price,
            currency: event.currency.clone(),
            status: event.status.clone(),
            trader_id: event.trader_id.clone(),
            counterparty_id: event.counterparty_id.clone(),
            counterparty_name: event.counterparty_name.clone(),
            instrument_id: event.instrument_id.clone(),
            book_id: event.book_id.clone(),
        }
    }
}

/// Dimension surrogate keys resolved at ingestion time. `None` = unresolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeys {
    pub trader_sk: Option<SurrogateKey>,
    pub counterparty_sk: Option<SurrogateKey>,
    pub instrument_sk: Option<SurrogateKey>,
    pub book_sk: Option<SurrogateKey>,
}

/// Enrichment failures, surfaced for downstream alerting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityFlags {
    pub trader_not_found: bool,
    pub counterparty_not_found: bool,
    pub instrument_not_found: bool,
    pub book_not_found: bool,
}

impl QualityFlags {
    pub fn any(&self) -> bool {
        self.trader_not_found
            || self.counterparty_not_found
            || self.instrument_not_found
            || self.book_not_found
    }
}

/// Hash of the versioned content of a fact.
///
/// Covers payload, ordered sub-events and the extra-attribute payload.
/// Resolved foreign keys are excluded: re-running a batch after a dimension
/// changed must not re-version facts whose business content is unchanged.
pub fn content_hash(payload: &FactPayload, sub_events: &[SubEvent], extra: &AttributeMap) -> String {
    #[derive(Serialize)]
    struct Content<'a> {
        payload: &'a FactPayload,
        sub_events: &'a [SubEvent],
        extra: &'a AttributeMap,
    }
    let bytes = serde_json::to_vec(&Content {
        payload,
        sub_events,
        extra,
    })
    .unwrap_or_default();
    sha256_hex(&bytes)
}

/// One system-time version of a fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactVersion {
    pub fact_sk: SurrogateKey,
    pub event_bk: BusinessKey,
    pub event_id: EntityId,
    pub grain: FactGrain,
    pub event_timestamp_utc: DateTime<Utc>,
    pub payload: FactPayload,
    #[serde(default)]
    pub sub_events: Vec<SubEvent>,
    pub keys: ForeignKeys,
    pub quality: QualityFlags,
    pub extra_attributes_key: ExtraAttributesKey,
    pub payload_hash: String,
    pub batch_id: BatchId,
    pub valid_from_utc: DateTime<Utc>,
    pub valid_to_utc: DateTime<Utc>,
    pub is_current: bool,
}

impl Versioned for FactVersion {
    fn surrogate_key(&self) -> &SurrogateKey {
        &self.fact_sk
    }

    fn business_key(&self) -> &BusinessKey {
        &self.event_bk
    }

    fn valid_from(&self) -> DateTime<Utc> {
        self.valid_from_utc
    }

    fn valid_to(&self) -> DateTime<Utc> {
        self.valid_to_utc
    }

    fn is_current(&self) -> bool {
        self.is_current
    }

    fn close(&mut self, at: DateTime<Utc>) {
        self.valid_to_utc = at;
        self.is_current = false;
    }
}

pub type FactDelta = Delta<FactVersion>;

/// Deduplicated schema-drift payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraAttributeRow {
    pub key: ExtraAttributesKey,
    pub payload: AttributeMap,
    pub first_seen_utc: DateTime<Utc>,
}
