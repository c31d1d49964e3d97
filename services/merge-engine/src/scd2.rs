//! SCD Type 2 merge
//!
//! Pure function from (current rows, incoming rows) to a delta. For each
//! business key in the batch:
//! - no current row: insert a new open version
//! - tracked attributes equal (string-normalised, null == ""): no-op
//! - any tracked attribute differs: close the current row at the incoming
//!   effective timestamp and insert a new open version
//!
//! Rows of one key are applied in ascending `(effective_ts, input index)`
//! order, so several changes in one batch chain into closed intermediate
//! versions. Two rows at the same instant: the later input row wins and the
//! earlier pending version is retracted, never left as a zero-length
//! interval. A row that is not after the stored current version and differs
//! from it is stale and skipped.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use types::dimension::{AttributeMap, DimensionDelta, DimensionVersion, IncomingDimensionRow};
use types::errors::{ConfigError, EngineError, MissingColumn};
use types::hashing::surrogate_key;
use types::ids::{BusinessKey, SurrogateKey};
use types::time::end_of_time;
use types::versioned::{current_by_key, CloseOp};

use crate::config::DimensionConfig;
use crate::dialect::Dialect;

/// Outcome counts of one dimension merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub closed: usize,
    pub unchanged: usize,
    /// Rows not after the stored current version, skipped.
    pub stale: usize,
    /// Pending versions replaced by a later row at the same instant.
    pub superseded: usize,
}

/// Latest version of a key while its rows are being applied.
#[derive(Debug, Clone, Copy)]
enum Head<'r> {
    Stored(&'r DimensionVersion),
    /// Index into `to_insert`.
    Pending(usize),
}

enum Decision {
    Insert,
    Unchanged,
    Supersede,
    Retract,
    Stale(DateTime<Utc>),
}

pub struct Scd2MergeEngine<'a> {
    config: &'a DimensionConfig,
    dialect: &'a dyn Dialect,
}

impl<'a> Scd2MergeEngine<'a> {
    pub fn new(config: &'a DimensionConfig, dialect: &'a dyn Dialect) -> Self {
        Self { config, dialect }
    }

    /// Business key of an incoming row: key columns cast to string and
    /// joined with `|`.
    pub fn business_key(&self, row: &IncomingDimensionRow) -> BusinessKey {
        BusinessKey::composite(self.config.business_key_columns.iter().map(|column| {
            self.dialect
                .cast_to_string(row.attributes.get(column).unwrap_or(&Value::Null))
        }))
    }

    /// `MD5(bk-effective_ts)`.
    pub fn surrogate_key(&self, bk: &BusinessKey, effective_ts: DateTime<Utc>) -> SurrogateKey {
        let rendered = self.dialect.render_timestamp(effective_ts);
        surrogate_key([Some(bk.as_str()), Some(rendered.as_str())])
    }

    pub fn merge(
        &self,
        existing_current: &[DimensionVersion],
        incoming: &[IncomingDimensionRow],
    ) -> Result<(DimensionDelta, MergeStats), EngineError> {
        self.check_columns(incoming)?;
        let current = current_by_key(existing_current)?;

        let mut groups: BTreeMap<BusinessKey, Vec<(usize, DateTime<Utc>, &IncomingDimensionRow)>> =
            BTreeMap::new();
        for (index, row) in incoming.iter().enumerate() {
            let ts = self.dialect.truncate_timestamp(row.effective_ts);
            groups
                .entry(self.business_key(row))
                .or_default()
                .push((index, ts, row));
        }

        let mut delta = DimensionDelta::empty();
        let mut stats = MergeStats::default();

        for (bk, mut rows) in groups {
            rows.sort_by_key(|(index, ts, _)| (*ts, *index));
            let mut chain: Vec<Head> = current.get(&bk).map(|v| Head::Stored(*v)).into_iter().collect();

            for (index, ts, row) in rows {
                let attributes = self.tracked(&row.attributes);
                loop {
                    match self.decide(chain.last().copied(), &delta, &attributes, row.is_deleted, ts) {
                        Decision::Retract => {
                            self.retract(&mut chain, &mut delta, &mut stats);
                            continue;
                        }
                        Decision::Unchanged => {
                            stats.unchanged += 1;
                            debug!(
                                dimension = %self.config.name,
                                business_key = %bk,
                                row_index = index,
                                "Attributes unchanged, no-op"
                            );
                        }
                        Decision::Stale(current_from) => {
                            stats.stale += 1;
                            warn!(
                                dimension = %self.config.name,
                                business_key = %bk,
                                row_index = index,
                                effective_ts = %ts,
                                current_from = %current_from,
                                "Stale row skipped, history is not rewritten"
                            );
                        }
                        Decision::Supersede => {
                            match chain.last().copied() {
                                Some(Head::Stored(v)) => {
                                    delta.to_close.push(CloseOp {
                                        sk: v.sk.clone(),
                                        business_key: bk.clone(),
                                        valid_to: ts,
                                    });
                                    stats.closed += 1;
                                }
                                Some(Head::Pending(i)) => {
                                    let v = &mut delta.to_insert[i];
                                    v.valid_to = ts;
                                    v.is_current = false;
                                }
                                None => {}
                            }
                            chain.push(self.push_version(&mut delta, &bk, attributes.clone(), ts, row.is_deleted));
                            stats.inserted += 1;
                            debug!(
                                dimension = %self.config.name,
                                business_key = %bk,
                                effective_ts = %ts,
                                "Attributes changed, new version"
                            );
                        }
                        Decision::Insert => {
                            chain.push(self.push_version(&mut delta, &bk, attributes.clone(), ts, row.is_deleted));
                            stats.inserted += 1;
                            debug!(
                                dimension = %self.config.name,
                                business_key = %bk,
                                effective_ts = %ts,
                                "New business key"
                            );
                        }
                    }
                    break;
                }
            }
        }

        debug!(
            dimension = %self.config.name,
            inserted = stats.inserted,
            closed = stats.closed,
            unchanged = stats.unchanged,
            stale = stats.stale,
            "Dimension merge planned"
        );
        Ok((delta, stats))
    }

    fn decide(
        &self,
        head: Option<Head>,
        delta: &DimensionDelta,
        attributes: &AttributeMap,
        is_deleted: bool,
        ts: DateTime<Utc>,
    ) -> Decision {
        let Some(head) = head else {
            return Decision::Insert;
        };
        let version = match head {
            Head::Stored(v) => v,
            Head::Pending(i) => &delta.to_insert[i],
        };
        if self.same_content(version, attributes, is_deleted) {
            Decision::Unchanged
        } else if ts > version.valid_from {
            Decision::Supersede
        } else if matches!(head, Head::Pending(_)) {
            // Pending versions are never after `ts`: rows are sorted.
            Decision::Retract
        } else {
            Decision::Stale(version.valid_from)
        }
    }

    /// Drop the latest pending version and reopen its predecessor.
    fn retract(&self, chain: &mut Vec<Head>, delta: &mut DimensionDelta, stats: &mut MergeStats) {
        chain.pop();
        delta.to_insert.pop();
        stats.inserted -= 1;
        stats.superseded += 1;
        match chain.last().copied() {
            Some(Head::Stored(_)) => {
                delta.to_close.pop();
                stats.closed -= 1;
            }
            Some(Head::Pending(i)) => {
                let v = &mut delta.to_insert[i];
                v.valid_to = end_of_time();
                v.is_current = true;
            }
            None => {}
        }
    }

    fn push_version<'r>(
        &self,
        delta: &mut DimensionDelta,
        bk: &BusinessKey,
        attributes: AttributeMap,
        ts: DateTime<Utc>,
        is_deleted: bool,
    ) -> Head<'r> {
        delta.to_insert.push(DimensionVersion::open(
            self.surrogate_key(bk, ts),
            bk.clone(),
            attributes,
            ts,
            is_deleted,
        ));
        Head::Pending(delta.to_insert.len() - 1)
    }

    fn tracked(&self, attributes: &AttributeMap) -> AttributeMap {
        self.config
            .tracked_columns
            .iter()
            .map(|c| (c.clone(), attributes.get(c).cloned().unwrap_or(Value::Null)))
            .collect()
    }

    fn same_content(&self, version: &DimensionVersion, attributes: &AttributeMap, is_deleted: bool) -> bool {
        version.is_deleted == is_deleted
            && self.config.tracked_columns.iter().all(|c| {
                let stored = version.attributes.get(c).unwrap_or(&Value::Null);
                let incoming = attributes.get(c).unwrap_or(&Value::Null);
                self.dialect.cast_to_string(stored) == self.dialect.cast_to_string(incoming)
            })
    }

    fn check_columns(&self, incoming: &[IncomingDimensionRow]) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        for (row_index, row) in incoming.iter().enumerate() {
            let has_key = self
                .config
                .business_key_columns
                .iter()
                .all(|c| row.attributes.contains_key(c));
            for column in self.config.required_columns() {
                if !row.attributes.contains_key(column) {
                    missing.push(MissingColumn {
                        row_index,
                        business_key: has_key.then(|| self.business_key(row).to_string()),
                        column: column.clone(),
                    });
                }
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingColumns {
                dimension: self.config.name.clone(),
                rows: missing,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::DialectKind;
    use chrono::TimeZone;
    use types::errors::IntegrityError;
    use types::versioned::check_history;

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn traders() -> DimensionConfig {
        DimensionConfig::new("traders", ["trader_id"], ["desk"])
    }

    fn row(id: &str, desk: &str, ts: DateTime<Utc>) -> IncomingDimensionRow {
        IncomingDimensionRow::from_pairs([("trader_id", id), ("desk", desk)], ts)
    }

    fn merge(
        existing: &[DimensionVersion],
        incoming: &[IncomingDimensionRow],
    ) -> (DimensionDelta, MergeStats) {
        let config = traders();
        Scd2MergeEngine::new(&config, DialectKind::BigQuery.dialect())
            .merge(existing, incoming)
            .unwrap()
    }

    /// Apply a delta to a plain row list.
    fn apply(mut rows: Vec<DimensionVersion>, delta: &DimensionDelta) -> Vec<DimensionVersion> {
        for op in &delta.to_close {
            let r = rows.iter_mut().find(|r| r.sk == op.sk).unwrap();
            r.valid_to = op.valid_to;
            r.is_current = false;
        }
        rows.extend(delta.to_insert.iter().cloned());
        rows
    }

    fn current(rows: &[DimensionVersion]) -> Vec<DimensionVersion> {
        rows.iter().filter(|r| r.is_current).cloned().collect()
    }

    #[test]
    fn test_new_key_is_inserted_open() {
        let (delta, stats) = merge(&[], &[row("TRD001", "Commodities", day(2024, 1, 1))]);
        assert_eq!(stats.inserted, 1);
        assert!(delta.to_close.is_empty());
        let v = &delta.to_insert[0];
        assert_eq!(v.bk.as_str(), "TRD001");
        assert_eq!(v.valid_from, day(2024, 1, 1));
        assert_eq!(v.valid_to, end_of_time());
        assert!(v.is_current);
        assert_eq!(v.attribute_str("desk").as_deref(), Some("Commodities"));
    }

    #[test]
    fn test_identical_attributes_are_noop() {
        let (d1, _) = merge(&[], &[row("A", "X", day(2024, 1, 1))]);
        let table = apply(vec![], &d1);

        let (d2, stats) = merge(&current(&table), &[row("A", "X", day(2024, 3, 1))]);
        assert!(d2.is_empty());
        assert_eq!(stats.unchanged, 1);
    }

    #[test]
    fn test_attribute_change_closes_and_inserts() {
        let (d1, _) = merge(&[], &[row("A", "X", day(2024, 1, 1))]);
        let table = apply(vec![], &d1);

        let t = day(2024, 6, 15);
        let (d2, stats) = merge(&current(&table), &[row("A", "Y", t)]);
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.inserted, 1);
        assert_eq!(d2.to_close[0].sk, d1.to_insert[0].sk);
        assert_eq!(d2.to_close[0].valid_to, t);
        assert_eq!(d2.to_insert[0].valid_from, t);

        let table = apply(table, &d2);
        assert!(check_history(&table).is_ok());
    }

    #[test]
    fn test_null_equals_empty_string() {
        let mut attrs = AttributeMap::new();
        attrs.insert("trader_id".into(), Value::String("A".into()));
        attrs.insert("desk".into(), Value::Null);
        let (d1, _) = merge(&[], &[IncomingDimensionRow::new(attrs, day(2024, 1, 1))]);
        let table = apply(vec![], &d1);

        let (d2, stats) = merge(&current(&table), &[row("A", "", day(2024, 2, 1))]);
        assert!(d2.is_empty());
        assert_eq!(stats.unchanged, 1);
    }

    #[test]
    fn test_batch_chain_emits_closed_intermediates() {
        let incoming = vec![
            row("A", "Z", day(2024, 9, 1)),
            row("A", "X", day(2024, 1, 1)),
            row("A", "Y", day(2024, 5, 1)),
        ];
        let (delta, stats) = merge(&[], &incoming);
        assert_eq!(stats.inserted, 3);
        assert_eq!(delta.to_insert.len(), 3);

        let desks: Vec<_> = delta
            .to_insert
            .iter()
            .map(|v| v.attribute_str("desk").unwrap())
            .collect();
        assert_eq!(desks, vec!["X", "Y", "Z"]);
        assert_eq!(delta.to_insert[0].valid_to, day(2024, 5, 1));
        assert!(!delta.to_insert[0].is_current);
        assert_eq!(delta.to_insert[1].valid_to, day(2024, 9, 1));
        assert!(delta.to_insert[2].is_current);

        let table = apply(vec![], &delta);
        assert!(check_history(&table).is_ok());
    }

    #[test]
    fn test_equal_timestamps_later_input_wins() {
        let t = day(2024, 4, 1);
        let (delta, stats) = merge(&[], &[row("A", "X", t), row("A", "Y", t)]);
        assert_eq!(delta.to_insert.len(), 1);
        assert_eq!(stats.superseded, 1);
        assert_eq!(delta.to_insert[0].attribute_str("desk").as_deref(), Some("Y"));
    }

    #[test]
    fn test_equal_timestamp_reverting_change_is_noop() {
        let (d1, _) = merge(&[], &[row("A", "X", day(2024, 1, 1))]);
        let table = apply(vec![], &d1);

        let t = day(2024, 4, 1);
        let (d2, stats) = merge(&current(&table), &[row("A", "Y", t), row("A", "X", t)]);
        assert!(d2.is_empty(), "retracted change must leave nothing behind");
        assert_eq!(stats.superseded, 1);
        assert_eq!(stats.unchanged, 1);
    }

    #[test]
    fn test_stale_row_is_skipped() {
        let (d1, _) = merge(&[], &[row("A", "X", day(2024, 6, 1))]);
        let table = apply(vec![], &d1);

        let (d2, stats) = merge(&current(&table), &[row("A", "Y", day(2024, 1, 1))]);
        assert!(d2.is_empty());
        assert_eq!(stats.stale, 1);
    }

    #[test]
    fn test_rerun_of_superseded_batch_is_noop() {
        let (d1, _) = merge(&[], &[row("A", "X", day(2024, 1, 1))]);
        let table = apply(vec![], &d1);
        let (d2, _) = merge(&current(&table), &[row("A", "Y", day(2024, 6, 15))]);
        let table = apply(table, &d2);

        // Replaying the first batch after the second must not touch history.
        let (d3, stats) = merge(&current(&table), &[row("A", "X", day(2024, 1, 1))]);
        assert!(d3.is_empty());
        assert_eq!(stats.stale, 1);
    }

    #[test]
    fn test_deletion_is_a_new_version() {
        let (d1, _) = merge(&[], &[row("A", "X", day(2024, 1, 1))]);
        let table = apply(vec![], &d1);

        let (d2, stats) = merge(
            &current(&table),
            &[row("A", "X", day(2024, 2, 1)).deleted()],
        );
        assert_eq!(stats.closed, 1);
        assert!(d2.to_insert[0].is_deleted);
    }

    #[test]
    fn test_missing_columns_reported_per_row() {
        let config = traders();
        let engine = Scd2MergeEngine::new(&config, DialectKind::DuckDb.dialect());
        let incoming = vec![
            row("A", "X", day(2024, 1, 1)),
            IncomingDimensionRow::from_pairs([("trader_id", "B")], day(2024, 1, 1)),
            IncomingDimensionRow::from_pairs([("desk", "Y")], day(2024, 1, 1)),
        ];
        match engine.merge(&[], &incoming) {
            Err(EngineError::Config(ConfigError::MissingColumns { dimension, rows })) => {
                assert_eq!(dimension, "traders");
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0].row_index, 1);
                assert_eq!(rows[0].business_key.as_deref(), Some("B"));
                assert_eq!(rows[0].column, "desk");
                assert_eq!(rows[1].row_index, 2);
                assert_eq!(rows[1].business_key, None);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_two_current_rows_is_integrity_error() {
        let (d1, _) = merge(&[], &[row("A", "X", day(2024, 1, 1))]);
        let (d2, _) = merge(&[], &[row("A", "Y", day(2024, 2, 1))]);
        let corrupt = vec![d1.to_insert[0].clone(), d2.to_insert[0].clone()];

        let config = traders();
        let result = Scd2MergeEngine::new(&config, DialectKind::BigQuery.dialect())
            .merge(&corrupt, &[row("A", "Z", day(2024, 3, 1))]);
        assert!(matches!(
            result,
            Err(EngineError::Integrity(IntegrityError::MultipleCurrentRows { count: 2, .. }))
        ));
    }

    #[test]
    fn test_composite_business_key() {
        let config = DimensionConfig::new(
            "instruments",
            ["exchange", "symbol", "contract_month"],
            ["tick_size"],
        );
        let engine = Scd2MergeEngine::new(&config, DialectKind::BigQuery.dialect());
        let r = IncomingDimensionRow::from_pairs(
            [
                ("exchange", "ICE"),
                ("symbol", "BRN"),
                ("contract_month", "2024-12"),
                ("tick_size", "0.01"),
            ],
            day(2024, 1, 1),
        );
        assert_eq!(engine.business_key(&r).as_str(), "ICE|BRN|2024-12");
    }

    #[test]
    fn test_surrogate_key_depends_on_timestamp() {
        let config = traders();
        let engine = Scd2MergeEngine::new(&config, DialectKind::BigQuery.dialect());
        let bk = BusinessKey::new("A");
        assert_eq!(
            engine.surrogate_key(&bk, day(2024, 1, 1)),
            engine.surrogate_key(&bk, day(2024, 1, 1))
        );
        assert_ne!(
            engine.surrogate_key(&bk, day(2024, 1, 1)),
            engine.surrogate_key(&bk, day(2024, 1, 2))
        );
    }
}
