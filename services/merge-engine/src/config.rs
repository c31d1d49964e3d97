//! Engine configuration
//!
//! Loaded from a JSON document. Every field has a default so a document only
//! needs to name what differs from the markets deployment.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use types::errors::ConfigError;

use crate::dialect::DialectKind;
use crate::identity::validate_namespace;

/// Identity namespace of the markets deployment. Never change it on a live
/// warehouse: every entity id is derived from it.
pub const MARKETS_NAMESPACE: &str = "a1b2c3d4-e5f6-7890-abcd-ef1234567890";

pub const DEFAULT_DOMAIN: &str = "markets";

/// Merge configuration for one dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionConfig {
    pub name: String,
    /// Columns forming the business key, joined with `|` when composite.
    pub business_key_columns: Vec<String>,
    /// Columns whose change opens a new version.
    pub tracked_columns: Vec<String>,
}

impl DimensionConfig {
    pub fn new<I, J, S, T>(name: impl Into<String>, business_key_columns: I, tracked_columns: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            name: name.into(),
            business_key_columns: business_key_columns.into_iter().map(Into::into).collect(),
            tracked_columns: tracked_columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Business key columns followed by tracked columns.
    pub fn required_columns(&self) -> impl Iterator<Item = &String> {
        self.business_key_columns.iter().chain(self.tracked_columns.iter())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.business_key_columns.is_empty() {
            return Err(ConfigError::NoColumns {
                dimension: self.name.clone(),
                what: "business key".to_string(),
            });
        }
        if self.tracked_columns.is_empty() {
            return Err(ConfigError::NoColumns {
                dimension: self.name.clone(),
                what: "tracked".to_string(),
            });
        }
        let mut seen = BTreeSet::new();
        for column in self.required_columns() {
            if !seen.insert(column) {
                return Err(ConfigError::DuplicateColumn {
                    dimension: self.name.clone(),
                    column: column.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Dimensions that fact foreign keys resolve against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub traders: String,
    pub counterparties: String,
    /// Tracked counterparty column used when an event carries only a name.
    pub counterparty_name_column: String,
    pub instruments: String,
    pub books: String,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            traders: "traders".to_string(),
            counterparties: "counterparties".to_string(),
            counterparty_name_column: "counterparty_name".to_string(),
            instruments: "instruments".to_string(),
            books: "books".to_string(),
        }
    }
}

impl EnrichmentConfig {
    fn dimension_names(&self) -> [&str; 4] {
        [
            self.traders.as_str(),
            self.counterparties.as_str(),
            self.instruments.as_str(),
            self.books.as_str(),
        ]
    }
}

/// Configuration for the batch processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub namespace: String,
    pub domain: String,
    pub dialect: DialectKind,
    pub dimensions: Vec<DimensionConfig>,
    pub enrichment: EnrichmentConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: MARKETS_NAMESPACE.to_string(),
            domain: DEFAULT_DOMAIN.to_string(),
            dialect: DialectKind::default(),
            dimensions: vec![
                DimensionConfig::new(
                    "traders",
                    ["trader_id"],
                    ["trader_name", "desk", "compliance_officer"],
                ),
                DimensionConfig::new(
                    "counterparties",
                    ["counterparty_id"],
                    ["counterparty_name", "lei"],
                ),
                DimensionConfig::new(
                    "instruments",
                    ["instrument_id"],
                    ["symbol", "isin", "asset_class"],
                ),
                DimensionConfig::new("books", ["book_id"], ["book_name", "desk"]),
            ],
            enrichment: EnrichmentConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidDocument {
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidDocument {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_json_str(&json)
    }

    pub fn dimension(&self, name: &str) -> Option<&DimensionConfig> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_namespace(&self.namespace)?;
        if self.domain.trim().is_empty() {
            return Err(ConfigError::InvalidDocument {
                reason: "domain is empty".to_string(),
            });
        }

        let mut names = BTreeSet::new();
        for dimension in &self.dimensions {
            if !names.insert(dimension.name.as_str()) {
                return Err(ConfigError::DuplicateDimension {
                    name: dimension.name.clone(),
                });
            }
            dimension.validate()?;
        }

        for name in self.enrichment.dimension_names() {
            if !names.contains(name) {
                return Err(ConfigError::UnknownDimension {
                    name: name.to_string(),
                });
            }
        }

        let counterparties = &self.enrichment.counterparties;
        let name_column = &self.enrichment.counterparty_name_column;
        let tracked = self
            .dimension(counterparties)
            .map(|d| d.tracked_columns.contains(name_column))
            .unwrap_or(false);
        if !tracked {
            return Err(ConfigError::UnknownColumn {
                dimension: counterparties.clone(),
                column: name_column.clone(),
            });
        }
        Ok(())
    }
}
