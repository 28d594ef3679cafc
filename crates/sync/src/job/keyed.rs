//! Generic "fetch per key, refresh the table" job.

use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{info, warn};

use chainsync_core::{SyncRecord, TableSpec};

use crate::executor::ExecutorError;
use crate::orchestrator::{BatchOrchestrator, Deferrable, Partitioning};
use crate::refresh::RefreshStore;
use crate::retry_queue::{RetryError, RetryHandler, WorkUnit};

use super::{JobError, SyncJob, SyncSummary};

/// Per-entity glue: where keys come from, how to fetch, where rows go.
#[async_trait]
pub trait EntitySync: Send + Sync {
    type Key: Clone + Eq + Hash + Serialize + DeserializeOwned + Send + Sync + 'static;
    type Record: SyncRecord + 'static;

    /// Job identity; also tags this entity's units in the retry queue.
    fn job_name(&self) -> &str;

    fn table(&self) -> &TableSpec;

    fn partitioning(&self) -> Partitioning {
        Partitioning::Singleton
    }

    async fn driving_keys(&self) -> Result<Vec<Self::Key>, ExecutorError>;

    async fn fetch(&self, keys: Vec<Self::Key>) -> Result<Vec<Self::Record>, ExecutorError>;
}

/// Orchestrated fetch followed by a full refresh, written once for every
/// entity. Also the entity's retry handler: fetch the unit's keys again and
/// upsert them.
///
/// A run and a retried unit never write at the same time: the run holds
/// `write_lock` from orchestration through the refresh, so a retry either
/// lands before the run starts or upserts after its refresh.
pub struct KeyedRefreshJob<E, W> {
    entity: Arc<E>,
    store: Arc<W>,
    orchestrator: BatchOrchestrator,
    write_lock: Mutex<()>,
}

impl<E, W> KeyedRefreshJob<E, W>
where
    E: EntitySync + 'static,
    W: RefreshStore + 'static,
{
    pub fn new(entity: Arc<E>, store: Arc<W>, orchestrator: BatchOrchestrator) -> Self {
        Self {
            entity,
            store,
            orchestrator,
            write_lock: Mutex::new(()),
        }
    }

    /// Build the job and register it with the orchestrator's retry queue.
    pub fn registered(entity: Arc<E>, store: Arc<W>, orchestrator: BatchOrchestrator) -> Arc<Self> {
        let job = Arc::new(Self::new(entity, store, orchestrator));
        let queue = job.orchestrator.retry_queue().clone();
        queue.register_handler(job.entity.job_name(), job.clone());
        job
    }

    pub fn entity(&self) -> &Arc<E> {
        &self.entity
    }
}

#[async_trait]
impl<E, W> SyncJob for KeyedRefreshJob<E, W>
where
    E: EntitySync + 'static,
    W: RefreshStore + 'static,
{
    type Key = E::Key;

    fn name(&self) -> &str {
        self.entity.job_name()
    }

    async fn driving_keys(&self) -> Result<Vec<E::Key>, JobError> {
        self.entity.driving_keys().await.map_err(JobError::Keys)
    }

    async fn sync(&self, keys: Vec<E::Key>) -> Result<SyncSummary, JobError> {
        let key_count = keys.len();
        let _writing = self.write_lock.lock().await;

        let fetcher = self.entity.clone();
        let mut outcome = self
            .orchestrator
            .run_batched(self.entity.job_name(), keys, self.entity.partitioning(), move |unit| {
                let entity = fetcher.clone();
                async move { entity.fetch(unit).await }
            })
            .await;
        let entity = self.entity.as_ref();

        if let Some(err) = outcome.fatal.take() {
            return Err(JobError::Fetch(err));
        }
        if outcome.units_total > 0 && outcome.units_failed == outcome.units_total {
            return Err(JobError::AllUnitsFailed {
                units: outcome.units_total,
            });
        }
        if outcome.units_failed > 0 {
            warn!(
                job = entity.job_name(),
                failed_units = outcome.units_failed,
                failed_keys = outcome.failed.len(),
                "refreshing with partial data; failed units pending retry"
            );
        }

        let (units_total, units_failed) = (outcome.units_total, outcome.units_failed);
        let records = outcome.records();
        let record_count = records.len();
        let report = self.store.refresh(entity.table(), records).await?;

        Ok(SyncSummary {
            keys: key_count,
            units_total,
            units_failed,
            records: record_count,
            refresh: Some(report),
        })
    }
}

#[async_trait]
impl<E, W> RetryHandler for KeyedRefreshJob<E, W>
where
    E: EntitySync + 'static,
    W: RefreshStore + 'static,
{
    async fn retry(&self, unit: &WorkUnit) -> Result<usize, RetryError> {
        let keys: Vec<E::Key> = unit
            .keys()
            .map_err(|e| RetryError::Payload(e.to_string()))?;
        let _writing = self.write_lock.lock().await;
        let records = self.entity.fetch(keys).await.map_err(|e| {
            if e.is_deferrable() {
                RetryError::Fetch(e.to_string())
            } else {
                RetryError::Fatal(e.to_string())
            }
        })?;
        let written = self
            .store
            .upsert(self.entity.table(), records)
            .await
            .map_err(|e| RetryError::Write(e.to_string()))?;

        info!(
            job = self.entity.job_name(),
            batch = unit.batch_number,
            rows = written,
            "retried unit written"
        );
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobOutcome, JobRunner, JobRunnerConfig, ManualScheduler};
    use crate::orchestrator::BatchConfig;
    use crate::refresh::{InMemoryRefreshStore, RefreshConfig, RefreshReport, StoreError};
    use crate::retry_queue::{FailedBatchQueue, RetryQueueConfig};
    use crate::source::SourceError;
    use chainsync_core::{Row, SqlValue};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Delegators {
        table: TableSpec,
        pools: Vec<String>,
        down: Mutex<HashSet<String>>,
    }

    impl Delegators {
        fn new(pools: &[&str], down: &[&str]) -> Self {
            Self {
                table: TableSpec::new("pool_delegators", ["pool_id", "stake"], ["pool_id"]).unwrap(),
                pools: pools.iter().map(|p| p.to_string()).collect(),
                down: Mutex::new(down.iter().map(|p| p.to_string()).collect()),
            }
        }

        fn recover(&self) {
            self.down.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl EntitySync for Delegators {
        type Key = String;
        type Record = Row;

        fn job_name(&self) -> &str {
            "pool_delegators"
        }

        fn table(&self) -> &TableSpec {
            &self.table
        }

        async fn driving_keys(&self) -> Result<Vec<String>, ExecutorError> {
            Ok(self.pools.clone())
        }

        async fn fetch(&self, keys: Vec<String>) -> Result<Vec<Row>, ExecutorError> {
            if let Some(k) = keys.iter().find(|k| k.starts_with("bad")) {
                return Err(ExecutorError::Fatal {
                    source_name: "Primary".into(),
                    error: SourceError::fatal(format!("column \"{k}\" does not exist")),
                });
            }
            let down = self.down.lock().unwrap().clone();
            if let Some(k) = keys.iter().find(|k| down.contains(*k)) {
                return Err(ExecutorError::AllSourcesUnavailable {
                    attempted: vec!["Primary".into()],
                    last: SourceError::retriable(format!("timeout fetching {k}")),
                });
            }
            Ok(keys
                .into_iter()
                .map(|k| Row::new(vec![SqlValue::text(k), SqlValue::bigint(100)]))
                .collect())
        }
    }

    fn fixture(pools: &[&str], down: &[&str]) -> (Arc<Delegators>, Arc<InMemoryRefreshStore>, Arc<FailedBatchQueue>) {
        (
            Arc::new(Delegators::new(pools, down)),
            Arc::new(InMemoryRefreshStore::new(RefreshConfig::default())),
            FailedBatchQueue::arc(RetryQueueConfig::default()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn failed_units_are_refreshed_later_through_the_queue() {
        let (entity, store, queue) = fixture(&["p1", "p2", "p3"], &["p2"]);
        let job = KeyedRefreshJob::registered(
            entity.clone(),
            store.clone(),
            BatchOrchestrator::new(queue.clone(), BatchConfig::default()),
        );
        let runner = JobRunner::new(Arc::new(ManualScheduler::new()), queue.clone(), JobRunnerConfig::default());

        let outcome = runner.execute(job.as_ref()).await.unwrap();
        let JobOutcome::Completed { summary, .. } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(summary.units_failed, 1);
        assert_eq!(store.row_count("pool_delegators"), 2);
        assert_eq!(queue.depth(), 1);

        entity.recover();
        let report = queue.drain_once().await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(store.row_count("pool_delegators"), 3);
        assert!(queue.is_empty());
    }

    /// Delegates to the in-memory store after holding every refresh for `delay`.
    struct SlowRefresh {
        inner: InMemoryRefreshStore,
        delay: Duration,
    }

    #[async_trait]
    impl RefreshStore for SlowRefresh {
        async fn refresh<R>(&self, table: &TableSpec, records: Vec<R>) -> Result<RefreshReport, StoreError>
        where
            R: SyncRecord + 'static,
        {
            tokio::time::sleep(self.delay).await;
            self.inner.refresh(table, records).await
        }

        async fn upsert<R>(&self, table: &TableSpec, records: Vec<R>) -> Result<usize, StoreError>
        where
            R: SyncRecord + 'static,
        {
            self.inner.upsert(table, records).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unit_retried_during_a_slow_refresh_survives_it() {
        let entity = Arc::new(Delegators::new(&["p1", "p2"], &["p2"]));
        let store = Arc::new(SlowRefresh {
            inner: InMemoryRefreshStore::new(RefreshConfig::default()),
            delay: Duration::from_secs(5),
        });
        let queue = FailedBatchQueue::arc(RetryQueueConfig::default());
        let job = KeyedRefreshJob::registered(
            entity.clone(),
            store.clone(),
            BatchOrchestrator::new(queue.clone(), BatchConfig::default()),
        );

        let run = tokio::spawn({
            let job = job.clone();
            async move { job.sync(vec!["p1".to_string(), "p2".to_string()]).await }
        });

        // Orchestration is over; the refresh is still sleeping.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.depth(), 1);
        entity.recover();

        let report = queue.drain_once().await;
        assert_eq!(report.succeeded, 1);
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.units_failed, 1);
        assert_eq!(store.inner.row_count("pool_delegators"), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn non_retriable_fetch_error_fails_the_run_without_queueing() {
        let (entity, store, queue) = fixture(&["p1", "bad-p2"], &[]);
        store.seed(entity.table(), vec![vec![SqlValue::text("old"), SqlValue::bigint(1)]]);
        let job = KeyedRefreshJob::new(
            entity,
            store.clone(),
            BatchOrchestrator::new(queue.clone(), BatchConfig::default()),
        );

        let err = job
            .sync(vec!["p1".to_string(), "bad-p2".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Fetch(ExecutorError::Fatal { .. })));
        assert!(queue.is_empty());
        let rows = store.rows("pool_delegators");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], SqlValue::text("old"));
    }

    #[tokio::test]
    async fn retried_unit_with_non_retriable_error_is_permanent() {
        let (entity, store, queue) = fixture(&[], &[]);
        let job = KeyedRefreshJob::new(entity, store, BatchOrchestrator::new(queue, BatchConfig::default()));
        let unit = WorkUnit::from_keys("pool_delegators", &["bad-p9".to_string()], 1, 1, "x").unwrap();

        let err = job.retry(&unit).await.unwrap_err();
        assert!(matches!(err, RetryError::Fatal(_)));
        assert!(err.is_permanent());
    }

    #[tokio::test(start_paused = true)]
    async fn all_units_failing_skips_refresh() {
        let (entity, store, queue) = fixture(&["p1"], &["p1"]);
        store.seed(entity.table(), vec![vec![SqlValue::text("old"), SqlValue::bigint(1)]]);
        let job = KeyedRefreshJob::new(entity, store.clone(), BatchOrchestrator::new(queue, BatchConfig::default()));

        let err = job.sync(vec!["p1".to_string()]).await.unwrap_err();
        assert!(matches!(err, JobError::AllUnitsFailed { units: 1 }));
        assert_eq!(store.row_count("pool_delegators"), 1);
    }

    #[tokio::test]
    async fn bad_payload_is_a_payload_error() {
        let (entity, store, queue) = fixture(&[], &[]);
        let job = KeyedRefreshJob::new(entity, store, BatchOrchestrator::new(queue, BatchConfig::default()));
        let unit = WorkUnit::new("pool_delegators", serde_json::json!({"not": "keys"}), 1, 1, "x");

        assert!(matches!(job.retry(&unit).await, Err(RetryError::Payload(_))));
    }
}
