//! Bulk refresh protocol: the only write path into synced tables.
//!
//! A refresh replaces a table's whole extent: delete every row, then insert
//! the fresh set in fixed-size batches with one multi-row upsert per batch.
//! The per-unit [`RefreshStore::upsert`] path used by the retry queue writes
//! without deleting.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use chainsync_core::{CoreError, Row, SqlValue, SyncRecord, TableSpec, dedup_latest};

pub use memory::InMemoryRefreshStore;

/// How delete and insert batches are committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    /// Delete and every batch share one transaction; readers see old or new
    /// data, never an empty table.
    #[default]
    Atomic,
    /// Delete commits on its own and each batch commits individually. A
    /// failed batch aborts the rest and earlier batches stay.
    DeleteThenInsert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshConfig {
    pub batch_size: usize,
    pub mode: RefreshMode,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            mode: RefreshMode::Atomic,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Invalid(#[from] CoreError),

    #[error("batch {batch}/{total} into `{table}` failed: {message}")]
    Batch {
        table: String,
        batch: usize,
        total: usize,
        message: String,
    },

    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

/// Summary of one refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshReport {
    pub table: String,
    pub mode: RefreshMode,
    pub deleted: u64,
    pub inserted: usize,
    /// Incoming records collapsed into another record with the same key.
    pub duplicates: usize,
    pub batches: usize,
    pub duration: Duration,
}

/// Write side of a sync job.
#[async_trait]
pub trait RefreshStore: Send + Sync {
    /// Replace the full contents of `table` with `records`.
    async fn refresh<R>(&self, table: &TableSpec, records: Vec<R>) -> Result<RefreshReport, StoreError>
    where
        R: SyncRecord + 'static;

    /// Upsert `records` into `table` without deleting anything. Returns the
    /// number of rows written.
    async fn upsert<R>(&self, table: &TableSpec, records: Vec<R>) -> Result<usize, StoreError>
    where
        R: SyncRecord + 'static;
}

/// Rows ready to write: deduplicated by upsert key, arity checked.
#[derive(Debug, Clone)]
pub struct PreparedRows {
    pub rows: Vec<Vec<SqlValue>>,
    pub duplicates: usize,
}

impl PreparedRows {
    pub fn batches(&self, batch_size: usize) -> std::slice::Chunks<'_, Vec<SqlValue>> {
        self.rows.chunks(batch_size.max(1))
    }

    pub fn batch_count(&self, batch_size: usize) -> usize {
        self.rows.len().div_ceil(batch_size.max(1))
    }
}

/// Arity is checked on every record before dedup; dedup then runs over the
/// whole set so no statement (and no pair of batches) assigns the same
/// conflict key twice.
pub fn prepare_rows<R: SyncRecord>(table: &TableSpec, records: Vec<R>) -> Result<PreparedRows, StoreError> {
    let incoming = records.len();
    let checked = records
        .iter()
        .map(|r| {
            let values = r.values();
            table.check_arity(&values)?;
            Ok(Row {
                values,
                timestamp: r.timestamp(),
            })
        })
        .collect::<Result<Vec<_>, CoreError>>()?;

    let rows: Vec<Vec<SqlValue>> = dedup_latest(table, checked)
        .into_iter()
        .map(|row| row.values)
        .collect();
    let duplicates = incoming - rows.len();

    Ok(PreparedRows { rows, duplicates })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableSpec {
        TableSpec::new("pool_stats", ["pool_id", "epoch", "stake"], ["pool_id", "epoch"]).unwrap()
    }

    #[test]
    fn prepare_counts_duplicates() {
        let rows = vec![
            Row::new(vec![SqlValue::text("p1"), SqlValue::bigint(1), SqlValue::numeric(10)]),
            Row::new(vec![SqlValue::text("p1"), SqlValue::bigint(1), SqlValue::numeric(11)]),
            Row::new(vec![SqlValue::text("p2"), SqlValue::bigint(1), SqlValue::numeric(12)]),
        ];
        let prepared = prepare_rows(&table(), rows).unwrap();
        assert_eq!(prepared.duplicates, 1);
        assert_eq!(prepared.rows.len(), 2);
        assert_eq!(prepared.rows[0][2], SqlValue::numeric(11));
        assert_eq!(prepared.batch_count(1), 2);
    }

    #[test]
    fn prepare_rejects_wrong_arity() {
        let rows = vec![Row::new(vec![SqlValue::text("p1")])];
        let err = prepare_rows(&table(), rows).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(CoreError::Validation(_))));
    }

    #[test]
    fn short_row_is_rejected_even_when_a_later_row_shares_its_key() {
        // Both rows key to ("p1", 1); the valid one would win dedup.
        let rows = vec![
            Row::new(vec![SqlValue::text("p1"), SqlValue::bigint(1)]),
            Row::new(vec![SqlValue::text("p1"), SqlValue::bigint(1), SqlValue::numeric(10)]),
        ];
        let err = prepare_rows(&table(), rows).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(CoreError::Validation(_))));
    }

    #[test]
    fn short_row_losing_dedup_is_still_rejected() {
        let rows = vec![
            Row::new(vec![SqlValue::text("p1"), SqlValue::bigint(1), SqlValue::numeric(10)]),
            Row::new(vec![SqlValue::text("p1"), SqlValue::bigint(1)]),
        ];
        assert!(prepare_rows(&table(), rows).is_err());
    }
}
