//! Identifier types for warehouse entities
//!
//! Entity and surrogate keys are hash-derived and never random, so that
//! reprocessing the same source data regenerates identical keys. Batch ids
//! are the one exception: they use UUID v7 for time-sortable run tracking.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Separator for composite business keys (`order_id|event_seq`).
pub const BUSINESS_KEY_SEPARATOR: char = '|';

/// Deterministic cross-source entity identifier (trade_id / event_id).
///
/// 32 lowercase hex chars: MD5 over the colon-joined identity tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical join key of a version row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurrogateKey(String);

impl SurrogateKey {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SurrogateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Natural, source-independent identifier of an entity.
///
/// Either a single natural id (`TRD001`) or a composite key whose parts are
/// joined with [`BUSINESS_KEY_SEPARATOR`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusinessKey(String);

impl BusinessKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Build a composite key from ordered parts.
    pub fn composite<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = parts
            .into_iter()
            .map(|p| p.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(BUSINESS_KEY_SEPARATOR.to_string().as_str());
        Self(joined)
    }

    /// Key of a single lifecycle event within an order: `order_id|event_seq`.
    pub fn event(order_id: &str, event_seq: u64) -> Self {
        Self::composite([order_id.to_string(), event_seq.to_string()])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split a composite key back into its parts.
    pub fn parts(&self) -> Vec<&str> {
        self.0.split(BUSINESS_KEY_SEPARATOR).collect()
    }
}

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BusinessKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of one ingestion batch (one run of the pipeline).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    /// Create a new BatchId with current timestamp
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key into the extra-attribute dimension.
///
/// `-1` is the sentinel for "no extra attributes"; real keys are
/// non-negative fingerprints of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtraAttributesKey(i64);

impl ExtraAttributesKey {
    pub const NONE: ExtraAttributesKey = ExtraAttributesKey(-1);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn is_sentinel(&self) -> bool {
        *self == Self::NONE
    }
}

impl fmt::Display for ExtraAttributesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_id_creation() {
        let id1 = BatchId::new();
        let id2 = BatchId::new();
        assert_ne!(id1, id2, "BatchIds should be unique");
    }

    #[test]
    fn test_composite_business_key() {
        let bk = BusinessKey::composite(["ICE", "BRN", "2024-12"]);
        assert_eq!(bk.as_str(), "ICE|BRN|2024-12");
        assert_eq!(bk.parts(), vec!["ICE", "BRN", "2024-12"]);
    }

    #[test]
    fn test_event_business_key() {
        let bk = BusinessKey::event("ORD-42", 3);
        assert_eq!(bk.as_str(), "ORD-42|3");
    }

    #[test]
    fn test_extra_attributes_sentinel() {
        assert!(ExtraAttributesKey::NONE.is_sentinel());
        assert_eq!(ExtraAttributesKey::NONE.value(), -1);
        assert!(!ExtraAttributesKey::new(17).is_sentinel());
    }

    #[test]
    fn test_business_key_serialization() {
        let bk = BusinessKey::new("TRD001");
        let json = serde_json::to_string(&bk).unwrap();
        assert_eq!(json, "\"TRD001\"");

        let deserialized: BusinessKey = serde_json::from_str(&json).unwrap();
        assert_eq!(bk, deserialized);
    }
}
