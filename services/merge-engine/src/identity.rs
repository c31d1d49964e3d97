//! Deterministic cross-source identity
//!
//! `id = MD5(namespace:domain:source_system:source_native_id)`
//!
//! No salt and no randomness: the same tuple yields the same id in every
//! process, so reprocessing a source file merges instead of duplicating.
//! The namespace is fixed per deployment. Changing it silently invalidates
//! every id already written, so the recorded namespace is checked before
//! any batch runs.

use tracing::error;
use types::errors::ConfigError;
use types::hashing::md5_hex;
use types::ids::EntityId;

use crate::dialect::Dialect;

/// Delimiter between identity components.
pub const ID_DELIMITER: char = ':';

const EVENT_KIND: &str = "event";
const ORDER_KIND: &str = "order";

/// Entity id for a source record.
pub fn generate_id(
    namespace: &str,
    domain: &str,
    source_system: &str,
    source_native_id: &str,
) -> EntityId {
    EntityId::from_hex(md5_hex(&join([
        namespace,
        domain,
        source_system,
        source_native_id,
    ])))
}

pub fn validate_namespace(namespace: &str) -> Result<(), ConfigError> {
    let reason = if namespace.trim().is_empty() {
        "namespace is empty"
    } else if namespace.contains(ID_DELIMITER) {
        "namespace contains ':'"
    } else {
        return Ok(());
    };
    Err(ConfigError::InvalidNamespace {
        namespace: namespace.to_string(),
        reason: reason.to_string(),
    })
}

fn join<const N: usize>(parts: [&str; N]) -> String {
    parts.join(ID_DELIMITER.to_string().as_str())
}

/// Identity generator bound to one deployment namespace and domain.
pub struct IdentityGenerator {
    namespace: String,
    domain: String,
    dialect: &'static dyn Dialect,
}

impl IdentityGenerator {
    pub fn new(
        namespace: impl Into<String>,
        domain: impl Into<String>,
        dialect: &'static dyn Dialect,
    ) -> Result<Self, ConfigError> {
        let namespace = namespace.into();
        validate_namespace(&namespace)?;
        Ok(Self {
            namespace,
            domain: domain.into(),
            dialect,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn generate_id(&self, domain: &str, source_system: &str, native_id: &str) -> EntityId {
        self.hash([self.namespace.as_str(), domain, source_system, native_id])
    }

    /// `None` when the native id is missing or blank; such rows get no id.
    pub fn try_generate_id(
        &self,
        domain: &str,
        source_system: &str,
        native_id: Option<&str>,
    ) -> Option<EntityId> {
        match native_id.map(str::trim) {
            Some(id) if !id.is_empty() => Some(self.generate_id(domain, source_system, id)),
            _ => None,
        }
    }

    /// Event id compatible with the warehouse macro:
    /// `MD5(namespace:event:domain:source_system:source_event_id)`.
    pub fn generate_event_id(&self, source_system: &str, source_event_id: &str) -> EntityId {
        self.hash([
            self.namespace.as_str(),
            EVENT_KIND,
            self.domain.as_str(),
            source_system,
            source_event_id,
        ])
    }

    /// Order id: `MD5(namespace:order:domain:source_system:order_id)`.
    pub fn generate_order_id(&self, source_system: &str, order_id: &str) -> EntityId {
        self.hash([
            self.namespace.as_str(),
            ORDER_KIND,
            self.domain.as_str(),
            source_system,
            order_id,
        ])
    }

    /// Namespace guard: the configured namespace must equal the one the
    /// warehouse was built with. A warehouse with no recorded namespace
    /// accepts any valid namespace.
    pub fn check_namespace(&self, recorded: Option<&str>) -> Result<(), ConfigError> {
        match recorded {
            Some(recorded) if recorded != self.namespace => {
                error!(
                    recorded = recorded,
                    configured = %self.namespace,
                    "Namespace mismatch, refusing to process"
                );
                Err(ConfigError::NamespaceMismatch {
                    recorded: recorded.to_string(),
                    configured: self.namespace.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    fn hash<const N: usize>(&self, parts: [&str; N]) -> EntityId {
        EntityId::from_hex(self.dialect.hash_hex(&join(parts)))
    }
}
