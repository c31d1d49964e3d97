//! Fact enrichment against current dimension state
//!
//! Foreign keys resolve against the current version of each dimension, not
//! against history at the event's business time. A key that cannot be
//! resolved leaves the foreign key empty and raises a quality flag; the fact
//! is still written.

use std::collections::BTreeMap;

use tracing::warn;
use types::dimension::DimensionVersion;
use types::fact::{ForeignKeys, QualityFlags, TradeEvent};
use types::ids::{BusinessKey, SurrogateKey};

use persistence::warehouse::WarehouseState;

use crate::config::EnrichmentConfig;
use crate::dialect::Dialect;

/// Read access to current dimension rows.
pub trait DimensionLookup {
    fn lookup(&self, dimension: &str, bk: &BusinessKey) -> Option<&DimensionVersion>;

    /// Current row whose `column` renders as `value`.
    fn lookup_by_attribute(&self, dimension: &str, column: &str, value: &str) -> Option<&DimensionVersion>;
}

/// Current rows of every dimension, indexed by business key, plus
/// secondary attribute indexes.
#[derive(Debug, Default)]
pub struct CurrentDimensionIndex {
    by_key: BTreeMap<String, BTreeMap<BusinessKey, DimensionVersion>>,
    /// (dimension, column) → rendered value → business key.
    by_attribute: BTreeMap<(String, String), BTreeMap<String, BusinessKey>>,
}

impl CurrentDimensionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index the current, non-deleted rows of every dimension in `state`.
    pub fn from_state(state: &WarehouseState) -> Self {
        let mut index = Self::new();
        for (name, table) in &state.dimensions {
            index.insert_rows(name, table.current_rows().into_iter().cloned());
        }
        index
    }

    pub fn insert_rows(&mut self, dimension: &str, rows: impl IntoIterator<Item = DimensionVersion>) {
        let table = self.by_key.entry(dimension.to_string()).or_default();
        for row in rows.into_iter().filter(|r| r.is_current && !r.is_deleted) {
            table.insert(row.bk.clone(), row);
        }
    }

    /// Add a secondary index on `column`. On duplicate values the row with
    /// the smallest business key wins.
    pub fn index_attribute(&mut self, dimension: &str, column: &str, dialect: &dyn Dialect) {
        let mut values: BTreeMap<String, BusinessKey> = BTreeMap::new();
        if let Some(rows) = self.by_key.get(dimension) {
            for (bk, row) in rows {
                if let Some(value) = row.attribute(column) {
                    let rendered = dialect.cast_to_string(value);
                    if !rendered.is_empty() {
                        values.entry(rendered).or_insert_with(|| bk.clone());
                    }
                }
            }
        }
        self.by_attribute
            .insert((dimension.to_string(), column.to_string()), values);
    }

    pub fn len(&self, dimension: &str) -> usize {
        self.by_key.get(dimension).map(BTreeMap::len).unwrap_or(0)
    }
}

impl DimensionLookup for CurrentDimensionIndex {
    fn lookup(&self, dimension: &str, bk: &BusinessKey) -> Option<&DimensionVersion> {
        self.by_key.get(dimension)?.get(bk)
    }

    fn lookup_by_attribute(&self, dimension: &str, column: &str, value: &str) -> Option<&DimensionVersion> {
        let bk = self
            .by_attribute
            .get(&(dimension.to_string(), column.to_string()))?
            .get(value)?;
        self.lookup(dimension, bk)
    }
}

/// Resolves the foreign keys of trade events.
pub struct Enricher<'a, L: DimensionLookup> {
    lookup: &'a L,
    config: &'a EnrichmentConfig,
}

impl<'a, L: DimensionLookup> Enricher<'a, L> {
    pub fn new(lookup: &'a L, config: &'a EnrichmentConfig) -> Self {
        Self { lookup, config }
    }

    /// Foreign keys and quality flags for `event`.
    ///
    /// A flag is raised only when the event names an entity that cannot be
    /// found; an event without a trader id simply has no trader key.
    pub fn resolve(&self, event: &TradeEvent) -> (ForeignKeys, QualityFlags) {
        let mut keys = ForeignKeys::default();
        let mut flags = QualityFlags::default();

        (keys.trader_sk, flags.trader_not_found) =
            self.by_id(&self.config.traders, event.trader_id.as_deref(), event);
        (keys.instrument_sk, flags.instrument_not_found) =
            self.by_id(&self.config.instruments, event.instrument_id.as_deref(), event);
        (keys.book_sk, flags.book_not_found) =
            self.by_id(&self.config.books, event.book_id.as_deref(), event);

        // Counterparty: id first, name as fallback.
        (keys.counterparty_sk, flags.counterparty_not_found) = match (
            event.counterparty_id.as_deref(),
            event.counterparty_name.as_deref(),
        ) {
            (Some(id), _) => self.by_id(&self.config.counterparties, Some(id), event),
            (None, Some(name)) => {
                let found = self.lookup.lookup_by_attribute(
                    &self.config.counterparties,
                    &self.config.counterparty_name_column,
                    name,
                );
                self.outcome(&self.config.counterparties, name, found, event)
            }
            (None, None) => (None, false),
        };

        (keys, flags)
    }

    fn by_id(&self, dimension: &str, id: Option<&str>, event: &TradeEvent) -> (Option<SurrogateKey>, bool) {
        match id {
            Some(id) => {
                let found = self.lookup.lookup(dimension, &BusinessKey::new(id));
                self.outcome(dimension, id, found, event)
            }
            None => (None, false),
        }
    }

    fn outcome(
        &self,
        dimension: &str,
        key: &str,
        found: Option<&DimensionVersion>,
        event: &TradeEvent,
    ) -> (Option<SurrogateKey>, bool) {
        match found {
            Some(row) => (Some(row.sk.clone()), false),
            None => {
                warn!(
                    dimension = dimension,
                    key = key,
                    order_id = %event.order_id,
                    event_seq = event.event_seq,
                    "Dimension lookup failed, foreign key left empty"
                );
                (None, true)
            }
        }
    }
}
