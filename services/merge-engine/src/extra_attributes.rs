//! Extra-attribute dimension
//!
//! Fields outside the canonical event schema are stored once per distinct
//! payload, keyed by a 63-bit fingerprint of the payload's canonical JSON.
//! Facts without extra fields point at the `-1` sentinel row.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;
use types::dimension::AttributeMap;
use types::fact::ExtraAttributeRow;
use types::hashing::fingerprint_i64;
use types::ids::ExtraAttributesKey;

/// Key of `payload`; the sentinel for an empty payload.
pub fn extra_attributes_key(payload: &AttributeMap) -> ExtraAttributesKey {
    if payload.is_empty() {
        return ExtraAttributesKey::NONE;
    }
    // BTreeMap serialises with sorted keys, so equal payloads share a key.
    let canonical = serde_json::to_string(payload).unwrap_or_default();
    ExtraAttributesKey::new(fingerprint_i64(&canonical))
}

/// Collects payloads not yet present in the warehouse during one batch.
pub struct ExtraAttributeRegistry<'a> {
    known: &'a BTreeMap<ExtraAttributesKey, ExtraAttributeRow>,
    first_seen: DateTime<Utc>,
    new_rows: BTreeMap<ExtraAttributesKey, ExtraAttributeRow>,
}

impl<'a> ExtraAttributeRegistry<'a> {
    pub fn new(known: &'a BTreeMap<ExtraAttributesKey, ExtraAttributeRow>, first_seen: DateTime<Utc>) -> Self {
        Self {
            known,
            first_seen,
            new_rows: BTreeMap::new(),
        }
    }

    /// Register `payload` and return its key.
    pub fn register(&mut self, payload: &AttributeMap) -> ExtraAttributesKey {
        let key = extra_attributes_key(payload);
        if key.is_sentinel() || self.known.contains_key(&key) || self.new_rows.contains_key(&key) {
            return key;
        }
        debug!(key = key.value(), fields = payload.len(), "New extra-attribute payload");
        self.new_rows.insert(
            key,
            ExtraAttributeRow {
                key,
                payload: payload.clone(),
                first_seen_utc: self.first_seen,
            },
        );
        key
    }

    pub fn new_count(&self) -> usize {
        self.new_rows.len()
    }

    pub fn into_rows(self) -> Vec<ExtraAttributeRow> {
        self.new_rows.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn payload(pairs: &[(&str, serde_json::Value)]) -> AttributeMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_empty_payload_is_sentinel() {
        assert_eq!(extra_attributes_key(&AttributeMap::new()), ExtraAttributesKey::NONE);
    }

    #[test]
    fn test_key_ignores_insertion_order() {
        let a = payload(&[("venue", json!("XLON")), ("algo", json!("TWAP"))]);
        let b = payload(&[("algo", json!("TWAP")), ("venue", json!("XLON"))]);
        assert_eq!(extra_attributes_key(&a), extra_attributes_key(&b));
        assert!(extra_attributes_key(&a).value() >= 0);
    }

    #[test]
    fn test_registry_dedups_known_and_new() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let p1 = payload(&[("venue", json!("XLON"))]);
        let p2 = payload(&[("venue", json!("XPAR"))]);

        let mut known = BTreeMap::new();
        let k1 = extra_attributes_key(&p1);
        known.insert(
            k1,
            ExtraAttributeRow {
                key: k1,
                payload: p1.clone(),
                first_seen_utc: ts,
            },
        );

        let mut registry = ExtraAttributeRegistry::new(&known, ts);
        assert_eq!(registry.register(&p1), k1);
        let k2 = registry.register(&p2);
        assert_eq!(registry.register(&p2), k2);
        assert_eq!(registry.register(&AttributeMap::new()), ExtraAttributesKey::NONE);
        assert_eq!(registry.new_count(), 1);

        let rows = registry.into_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload, p2);
    }
}
