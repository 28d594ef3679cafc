//! Record/value model at the local-store boundary.
//!
//! Synced entities are flattened into ordered [`SqlValue`] rows. Loosely typed
//! nested payloads travel as opaque JSON documents; the engine never looks
//! inside them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::table::TableSpec;

/// A typed, nullable column value.
///
/// Every variant carries its own `Option` so a NULL still has a SQL type when
/// bound as a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlValue {
    Bool(Option<bool>),
    BigInt(Option<i64>),
    Double(Option<f64>),
    /// Arbitrary-precision decimal carried as its text form (e.g. lovelace).
    Numeric(Option<String>),
    Text(Option<String>),
    Json(Option<serde_json::Value>),
    Timestamp(Option<DateTime<Utc>>),
    Uuid(Option<Uuid>),
}

impl SqlValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(Some(value.into()))
    }

    pub fn bigint(value: i64) -> Self {
        Self::BigInt(Some(value))
    }

    pub fn numeric(value: impl ToString) -> Self {
        Self::Numeric(Some(value.to_string()))
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::Json(Some(value))
    }

    pub fn timestamp(value: DateTime<Utc>) -> Self {
        Self::Timestamp(Some(value))
    }

    pub fn is_null(&self) -> bool {
        match self {
            SqlValue::Bool(v) => v.is_none(),
            SqlValue::BigInt(v) => v.is_none(),
            SqlValue::Double(v) => v.is_none(),
            SqlValue::Numeric(v) => v.is_none(),
            SqlValue::Text(v) => v.is_none(),
            SqlValue::Json(v) => v.is_none(),
            SqlValue::Timestamp(v) => v.is_none(),
            SqlValue::Uuid(v) => v.is_none(),
        }
    }

    /// Stable textual form used to compare upsert keys.
    pub fn key_part(&self) -> String {
        fn part<T: ToString>(tag: &str, v: &Option<T>) -> String {
            match v {
                Some(v) => format!("{tag}:{}", v.to_string()),
                None => "null".to_string(),
            }
        }

        match self {
            SqlValue::Bool(v) => part("b", v),
            SqlValue::BigInt(v) => part("i", v),
            SqlValue::Double(v) => part("f", v),
            SqlValue::Numeric(v) => part("n", v),
            SqlValue::Text(v) => part("t", v),
            SqlValue::Json(v) => part("j", v),
            SqlValue::Timestamp(v) => match v {
                Some(ts) => format!("ts:{}", ts.to_rfc3339()),
                None => "null".to_string(),
            },
            SqlValue::Uuid(v) => part("u", v),
        }
    }
}

/// Upsert key of a row, as rendered by [`SqlValue::key_part`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey(Vec<String>);

impl RecordKey {
    pub fn new(parts: Vec<String>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl core::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

/// A record that can be written to a synced table.
pub trait SyncRecord: Send + Sync {
    /// Column values, in the order of the target [`TableSpec::columns`].
    fn values(&self) -> Vec<SqlValue>;

    /// Timestamp used to pick a winner among records sharing an upsert key.
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// A plain row of values; the shape rows take inside stores and tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<SqlValue>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self {
            values,
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }
}

impl SyncRecord for Row {
    fn values(&self) -> Vec<SqlValue> {
        self.values.clone()
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }
}

/// Collapse records sharing an upsert key, keeping one winner per key.
///
/// The record with the latest timestamp wins; on equal (or missing)
/// timestamps the later occurrence wins. Output keeps first-seen key order so
/// batches stay deterministic.
pub fn dedup_latest<R: SyncRecord>(table: &TableSpec, records: Vec<R>) -> Vec<R> {
    let mut order: Vec<Option<R>> = Vec::with_capacity(records.len());
    let mut index: HashMap<RecordKey, usize> = HashMap::with_capacity(records.len());

    for record in records {
        let key = table.key_of(&record.values());
        match index.get(&key) {
            Some(&slot) => {
                let replace = match order[slot].as_ref() {
                    Some(current) => record.timestamp() >= current.timestamp(),
                    None => true,
                };
                if replace {
                    order[slot] = Some(record);
                }
            }
            None => {
                index.insert(key, order.len());
                order.push(Some(record));
            }
        }
    }

    order.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn table() -> TableSpec {
        TableSpec::new("dreps", ["drep_id", "voting_power", "updated_at"], ["drep_id"]).unwrap()
    }

    fn row(id: &str, power: i64, secs: Option<i64>) -> Row {
        let ts = secs.map(|s| Utc.timestamp_opt(s, 0).unwrap());
        Row {
            values: vec![
                SqlValue::text(id),
                SqlValue::bigint(power),
                SqlValue::Timestamp(ts),
            ],
            timestamp: ts,
        }
    }

    #[test]
    fn latest_timestamp_wins() {
        let rows = vec![row("a", 1, Some(200)), row("a", 2, Some(100))];
        let out = dedup_latest(&table(), rows);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].values[1], SqlValue::bigint(1));
    }

    #[test]
    fn later_occurrence_wins_without_timestamps() {
        let rows = vec![row("a", 1, None), row("b", 5, None), row("a", 2, None)];
        let out = dedup_latest(&table(), rows);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].values[1], SqlValue::bigint(2));
        assert_eq!(out[1].values[0], SqlValue::text("b"));
    }

    #[test]
    fn timestamped_record_beats_untimestamped() {
        let rows = vec![row("a", 1, Some(5)), row("a", 2, None)];
        let out = dedup_latest(&table(), rows);
        assert_eq!(out[0].values[1], SqlValue::bigint(1));
    }

    #[test]
    fn null_and_text_keys_differ() {
        assert_ne!(SqlValue::Text(None).key_part(), SqlValue::text("null").key_part());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: dedup yields exactly one record per distinct key, and
        /// each survivor carries the maximal timestamp for its key.
        #[test]
        fn one_survivor_per_key(
            input in prop::collection::vec((0u8..8, 0i64..1_000, 0i64..50), 0..64)
        ) {
            let rows: Vec<Row> = input
                .iter()
                .map(|(k, p, t)| row(&format!("k{k}"), *p, Some(*t)))
                .collect();
            let out = dedup_latest(&table(), rows);

            let mut distinct: Vec<u8> = input.iter().map(|(k, _, _)| *k).collect();
            distinct.sort_unstable();
            distinct.dedup();
            prop_assert_eq!(out.len(), distinct.len());

            for survivor in &out {
                let id = match &survivor.values[0] {
                    SqlValue::Text(Some(id)) => id.clone(),
                    other => panic!("unexpected key {other:?}"),
                };
                let max_ts = input
                    .iter()
                    .filter(|(k, _, _)| format!("k{k}") == id)
                    .map(|(_, _, t)| *t)
                    .max()
                    .unwrap();
                prop_assert_eq!(survivor.timestamp.unwrap().timestamp(), max_ts);
            }
        }
    }
}
