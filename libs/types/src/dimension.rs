//! Dimension rows (SCD Type 2)
//!
//! An incoming row is a candidate observation of an entity's attributes at
//! an effective timestamp. A version row is one stored interval of history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::ids::{BusinessKey, SurrogateKey};
use crate::time::end_of_time;
use crate::versioned::{Delta, Versioned};

/// Column name → value. BTreeMap keeps serialization and hashing ordered.
pub type AttributeMap = BTreeMap<String, Value>;

/// Candidate dimension row supplied by the upstream parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingDimensionRow {
    /// All columns of the source row, business key columns included.
    pub attributes: AttributeMap,
    /// When this state of the entity was observed.
    pub effective_ts: DateTime<Utc>,
    /// Source reports the entity as deleted.
    #[serde(default)]
    pub is_deleted: bool,
}

impl IncomingDimensionRow {
    pub fn new(attributes: AttributeMap, effective_ts: DateTime<Utc>) -> Self {
        Self {
            attributes,
            effective_ts,
            is_deleted: false,
        }
    }

    /// Convenience constructor from `(column, string value)` pairs.
    pub fn from_pairs<'a, I>(pairs: I, effective_ts: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let attributes = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        Self::new(attributes, effective_ts)
    }

    pub fn deleted(mut self) -> Self {
        self.is_deleted = true;
        self
    }
}

/// One interval of a dimension entity's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionVersion {
    pub sk: SurrogateKey,
    pub bk: BusinessKey,
    /// Tracked attribute columns only.
    pub attributes: AttributeMap,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub is_current: bool,
    #[serde(default)]
    pub is_deleted: bool,
}

impl DimensionVersion {
    /// A new current (open-ended) version.
    pub fn open(
        sk: SurrogateKey,
        bk: BusinessKey,
        attributes: AttributeMap,
        valid_from: DateTime<Utc>,
        is_deleted: bool,
    ) -> Self {
        Self {
            sk,
            bk,
            attributes,
            valid_from,
            valid_to: end_of_time(),
            is_current: true,
            is_deleted,
        }
    }

    pub fn attribute(&self, column: &str) -> Option<&Value> {
        self.attributes.get(column)
    }

    /// Attribute rendered as a plain string (`None` for null or absent).
    pub fn attribute_str(&self, column: &str) -> Option<String> {
        match self.attributes.get(column)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

impl Versioned for DimensionVersion {
    fn surrogate_key(&self) -> &SurrogateKey {
        &self.sk
    }

    fn business_key(&self) -> &BusinessKey {
        &self.bk
    }

    fn valid_from(&self) -> DateTime<Utc> {
        self.valid_from
    }

    fn valid_to(&self) -> DateTime<Utc> {
        self.valid_to
    }

    fn is_current(&self) -> bool {
        self.is_current
    }

    fn close(&mut self, at: DateTime<Utc>) {
        self.valid_to = at;
        self.is_current = false;
    }
}

pub type DimensionDelta = Delta<DimensionVersion>;
