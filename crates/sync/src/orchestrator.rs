//! Batch orchestrator: fan a key set out into units, isolate failures.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::executor::ExecutorError;
use crate::retry_queue::{FailedBatchQueue, WorkUnit};

/// Splits unit failures into ones the retry queue may fix and ones it cannot.
pub trait Deferrable {
    fn is_deferrable(&self) -> bool;
}

impl Deferrable for ExecutorError {
    fn is_deferrable(&self) -> bool {
        self.is_unavailable()
    }
}

/// How a key set is split into work units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partitioning {
    /// One unit per key.
    Singleton,
    /// Fixed-size chunks; the last one may be shorter.
    Chunks(usize),
}

impl Partitioning {
    fn chunk_size(&self) -> usize {
        match self {
            Partitioning::Singleton => 1,
            Partitioning::Chunks(n) => (*n).max(1),
        }
    }
}

/// Split `items` into units, preserving order.
pub fn partition<K>(items: Vec<K>, partitioning: Partitioning) -> Vec<Vec<K>> {
    let size = partitioning.chunk_size();
    let mut units = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size);
    for item in items {
        current.push(item);
        if current.len() == size {
            units.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        units.push(current);
    }
    units
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Units of one call in flight at once; kept below the global gate.
    pub per_job_concurrency: usize,
    /// Spread across the cap: each unit waits `stagger / per_job_concurrency`.
    pub stagger: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            per_job_concurrency: 5,
            stagger: Duration::from_millis(500),
        }
    }
}

impl BatchConfig {
    pub fn unit_delay(&self) -> Duration {
        self.stagger / self.per_job_concurrency.max(1) as u32
    }
}

/// Result of one orchestrated run.
#[derive(Debug)]
pub struct BatchOutcome<K, T, E> {
    /// Unit results keyed by the unit's first key.
    pub successes: HashMap<K, Vec<T>>,
    /// Keys of deferred units, now pending in the retry queue.
    pub failed: Vec<K>,
    pub units_total: usize,
    /// Deferred and fatal units together.
    pub units_failed: usize,
    /// First non-deferrable unit error; those units are not queued.
    pub fatal: Option<E>,
}

impl<K, T, E> BatchOutcome<K, T, E> {
    pub fn is_complete(&self) -> bool {
        self.units_failed == 0
    }

    pub fn record_count(&self) -> usize {
        self.successes.values().map(Vec::len).sum()
    }

    /// Flatten every successful unit's records.
    pub fn records(self) -> Vec<T> {
        self.successes.into_values().flatten().collect()
    }
}

/// Runs a unit-of-work over every partition of a key set.
///
/// Never fails as a whole. A unit whose error is [`Deferrable`] goes to the
/// retry queue under `job_name` and its keys land in [`BatchOutcome::failed`];
/// any other error is kept in [`BatchOutcome::fatal`] for the caller to raise.
/// Each unit runs as its own task.
#[derive(Debug, Clone)]
pub struct BatchOrchestrator {
    retry_queue: Arc<FailedBatchQueue>,
    config: BatchConfig,
}

impl BatchOrchestrator {
    pub fn new(retry_queue: Arc<FailedBatchQueue>, config: BatchConfig) -> Self {
        Self {
            retry_queue,
            config,
        }
    }

    pub fn retry_queue(&self) -> &Arc<FailedBatchQueue> {
        &self.retry_queue
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub async fn run_batched<K, T, E, F, Fut>(
        &self,
        job_name: &str,
        items: Vec<K>,
        partitioning: Partitioning,
        unit_of_work: F,
    ) -> BatchOutcome<K, T, E>
    where
        K: Clone + Eq + Hash + Serialize + Send + 'static,
        T: Send + 'static,
        E: Deferrable + Display + Send + 'static,
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<T>, E>> + Send + 'static,
    {
        let units = partition(items, partitioning);
        let total = units.len();
        let limiter = Arc::new(Semaphore::new(self.config.per_job_concurrency.max(1)));
        let delay = self.config.unit_delay();
        let unit_of_work = Arc::new(unit_of_work);

        debug!(
            job = job_name,
            units = total,
            cap = self.config.per_job_concurrency,
            "orchestrating batch"
        );

        let mut tasks = JoinSet::new();
        for (idx, keys) in units.into_iter().enumerate() {
            let limiter = limiter.clone();
            let unit_of_work = unit_of_work.clone();
            tasks.spawn(
                async move {
                    // Never closed, so acquisition cannot fail.
                    let _permit = limiter.acquire_owned().await.ok();
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let result = unit_of_work(keys.clone()).await;
                    (idx, keys, result)
                }
                .instrument(Span::current()),
            );
        }

        let mut outcome = BatchOutcome {
            successes: HashMap::with_capacity(total),
            failed: Vec::new(),
            units_total: total,
            units_failed: 0,
            fatal: None,
        };
        while let Some(joined) = tasks.join_next().await {
            let (idx, keys, result) = match joined {
                Ok(done) => done,
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(err) => {
                    error!(job = job_name, error = %err, "unit task cancelled");
                    outcome.units_failed += 1;
                    continue;
                }
            };

            match result {
                Ok(rows) => {
                    if let Some(first) = keys.first().cloned() {
                        outcome.successes.entry(first).or_default().extend(rows);
                    }
                }
                Err(err) if err.is_deferrable() => {
                    self.defer(job_name, &keys, idx + 1, total, &err.to_string());
                    outcome.units_failed += 1;
                    outcome.failed.extend(keys);
                }
                Err(err) => {
                    error!(
                        job = job_name,
                        batch = idx + 1,
                        total_batches = total,
                        keys = keys.len(),
                        error = %err,
                        "unit failed with a non-retriable error; not queued"
                    );
                    outcome.units_failed += 1;
                    outcome.fatal.get_or_insert(err);
                }
            }
        }

        info!(
            job = job_name,
            units = total,
            succeeded = total - outcome.units_failed,
            failed = outcome.units_failed,
            fatal = outcome.fatal.is_some(),
            records = outcome.record_count(),
            "batch finished"
        );
        outcome
    }

    fn defer<K: Serialize>(
        &self,
        job_name: &str,
        keys: &[K],
        batch_number: usize,
        total_batches: usize,
        reason: &str,
    ) {
        match WorkUnit::from_keys(job_name, keys, batch_number, total_batches, reason) {
            Ok(unit) => {
                warn!(
                    job = job_name,
                    batch = batch_number,
                    total_batches,
                    keys = keys.len(),
                    error = reason,
                    "unit failed; routed to retry queue"
                );
                self.retry_queue.add(unit);
            }
            Err(err) => error!(
                job = job_name,
                batch = batch_number,
                error = %err,
                "failed unit could not be serialized; not retried"
            ),
        }
    }
}
