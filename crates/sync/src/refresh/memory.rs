//! In-memory refresh store (tests/dev).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::info;

use chainsync_core::{RecordKey, SqlValue, SyncRecord, TableSpec};

use super::{RefreshConfig, RefreshMode, RefreshReport, RefreshStore, StoreError, prepare_rows};

type TableRows = BTreeMap<RecordKey, Vec<SqlValue>>;

/// Tables keyed by name, rows keyed by upsert key.
///
/// Honours [`RefreshMode`] the same way the Postgres store does, and can be
/// told to fail a given batch to exercise partial-refresh behaviour.
#[derive(Debug, Default)]
pub struct InMemoryRefreshStore {
    config: RefreshConfig,
    tables: Mutex<HashMap<String, TableRows>>,
    fail_batch: Mutex<Option<usize>>,
}

impl InMemoryRefreshStore {
    pub fn new(config: RefreshConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Fail the `batch`-th (1-based) batch of the next write.
    pub fn fail_on_batch(&self, batch: usize) {
        *self.fail_batch.lock().unwrap_or_else(|e| e.into_inner()) = Some(batch);
    }

    /// Current rows of `table`, ordered by upsert key.
    pub fn rows(&self, table: &str) -> Vec<Vec<SqlValue>> {
        self.lock_tables()
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock_tables().get(table).map(BTreeMap::len).unwrap_or(0)
    }

    /// Seed rows directly, bypassing the refresh protocol.
    pub fn seed(&self, table: &TableSpec, rows: Vec<Vec<SqlValue>>) {
        let mut tables = self.lock_tables();
        let entry = tables.entry(table.name().to_string()).or_default();
        for row in rows {
            entry.insert(table.key_of(&row), row);
        }
    }

    fn take_failure(&self) -> Option<usize> {
        self.fail_batch.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn lock_tables(&self) -> MutexGuard<'_, HashMap<String, TableRows>> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_batches(
        &self,
        table: &TableSpec,
        target: &mut TableRows,
        batches: &[&[Vec<SqlValue>]],
        fail_at: Option<usize>,
        mut commit: impl FnMut(&TableRows),
    ) -> Result<usize, StoreError> {
        let total = batches.len();
        let mut written = 0;
        for (idx, batch) in batches.iter().enumerate() {
            if fail_at == Some(idx + 1) {
                return Err(StoreError::Batch {
                    table: table.name().to_string(),
                    batch: idx + 1,
                    total,
                    message: "injected failure".to_string(),
                });
            }
            for row in batch.iter() {
                target.insert(table.key_of(row), row.clone());
            }
            written += batch.len();
            commit(target);
        }
        Ok(written)
    }
}

#[async_trait]
impl RefreshStore for InMemoryRefreshStore {
    async fn refresh<R>(&self, table: &TableSpec, records: Vec<R>) -> Result<RefreshReport, StoreError>
    where
        R: SyncRecord + 'static,
    {
        let started = Instant::now();
        let prepared = prepare_rows(table, records)?;
        let batches: Vec<_> = prepared.batches(self.config.batch_size).collect();
        let fail_at = self.take_failure();
        let name = table.name().to_string();

        let deleted = self.row_count(&name) as u64;
        let mut fresh = TableRows::new();

        let inserted = match self.config.mode {
            RefreshMode::Atomic => {
                let written = self.write_batches(table, &mut fresh, &batches, fail_at, |_| {})?;
                self.lock_tables().insert(name.clone(), fresh);
                written
            }
            RefreshMode::DeleteThenInsert => {
                self.lock_tables().insert(name.clone(), TableRows::new());
                self.write_batches(table, &mut fresh, &batches, fail_at, |committed| {
                    self.lock_tables().insert(name.clone(), committed.clone());
                })?
            }
        };

        let report = RefreshReport {
            table: name,
            mode: self.config.mode,
            deleted,
            inserted,
            duplicates: prepared.duplicates,
            batches: batches.len(),
            duration: started.elapsed(),
        };
        info!(
            table = %report.table,
            deleted = report.deleted,
            inserted = report.inserted,
            batches = report.batches,
            "in-memory refresh complete"
        );
        Ok(report)
    }

    async fn upsert<R>(&self, table: &TableSpec, records: Vec<R>) -> Result<usize, StoreError>
    where
        R: SyncRecord + 'static,
    {
        let prepared = prepare_rows(table, records)?;
        let batches: Vec<_> = prepared.batches(self.config.batch_size).collect();
        let fail_at = self.take_failure();

        let mut current = self.lock_tables().get(table.name()).cloned().unwrap_or_default();
        let written = self.write_batches(table, &mut current, &batches, fail_at, |_| {})?;
        self.lock_tables().insert(table.name().to_string(), current);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsync_core::Row;
    use chrono::{TimeZone, Utc};

    fn table() -> TableSpec {
        TableSpec::new("drep_info", ["drep_id", "amount", "updated_at"], ["drep_id"]).unwrap()
    }

    fn row(id: &str, amount: i64, secs: i64) -> Row {
        let at = Utc.timestamp_opt(secs, 0).unwrap();
        Row::new(vec![SqlValue::text(id), SqlValue::bigint(amount), SqlValue::timestamp(at)]).with_timestamp(at)
    }

    fn store(batch_size: usize, mode: RefreshMode) -> InMemoryRefreshStore {
        InMemoryRefreshStore::new(RefreshConfig { batch_size, mode })
    }

    #[tokio::test]
    async fn refresh_twice_is_idempotent() {
        let s = store(2, RefreshMode::Atomic);
        let input = vec![row("a", 1, 10), row("b", 2, 10), row("c", 3, 10)];

        s.refresh(&table(), input.clone()).await.unwrap();
        let once = s.rows("drep_info");
        let report = s.refresh(&table(), input).await.unwrap();

        assert_eq!(s.rows("drep_info"), once);
        assert_eq!(once.len(), 3);
        assert_eq!(report.deleted, 3);
        assert_eq!(report.batches, 2);
    }

    #[tokio::test]
    async fn duplicate_keys_keep_latest_timestamp() {
        let s = store(500, RefreshMode::Atomic);
        let report = s
            .refresh(&table(), vec![row("a", 1, 20), row("a", 2, 10)])
            .await
            .unwrap();

        let rows = s.rows("drep_info");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1], SqlValue::bigint(1));
        assert_eq!(report.duplicates, 1);
    }

    #[tokio::test]
    async fn refresh_drops_rows_absent_from_new_set() {
        let s = store(500, RefreshMode::Atomic);
        s.refresh(&table(), vec![row("a", 1, 1), row("b", 1, 1)]).await.unwrap();
        s.refresh(&table(), vec![row("b", 5, 2)]).await.unwrap();

        let rows = s.rows("drep_info");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], SqlValue::text("b"));
    }

    #[tokio::test]
    async fn atomic_failure_keeps_old_data() {
        let s = store(1, RefreshMode::Atomic);
        s.refresh(&table(), vec![row("old", 1, 1)]).await.unwrap();

        s.fail_on_batch(2);
        let err = s
            .refresh(&table(), vec![row("a", 1, 1), row("b", 1, 1), row("c", 1, 1)])
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Batch { batch: 2, total: 3, .. }));
        let rows = s.rows("drep_info");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], SqlValue::text("old"));
    }

    #[tokio::test]
    async fn delete_then_insert_failure_keeps_committed_batches() {
        let s = store(1, RefreshMode::DeleteThenInsert);
        s.refresh(&table(), vec![row("old", 1, 1)]).await.unwrap();

        s.fail_on_batch(3);
        s.refresh(&table(), vec![row("a", 1, 1), row("b", 1, 1), row("c", 1, 1)])
            .await
            .unwrap_err();

        let ids: Vec<_> = s.rows("drep_info").into_iter().map(|r| r[0].clone()).collect();
        assert_eq!(ids, vec![SqlValue::text("a"), SqlValue::text("b")]);
    }

    #[tokio::test]
    async fn upsert_does_not_delete() {
        let s = store(500, RefreshMode::Atomic);
        s.refresh(&table(), vec![row("a", 1, 1), row("b", 1, 1)]).await.unwrap();

        let written = s.upsert(&table(), vec![row("b", 9, 2), row("c", 3, 2)]).await.unwrap();
        assert_eq!(written, 2);

        let rows = s.rows("drep_info");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1][1], SqlValue::bigint(9));
    }
}
