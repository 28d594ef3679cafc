//! In-process failed-batch retry queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::retry::RetryPolicy;

use super::unit::{DeadLetterEntry, WorkUnit};

/// Failure of a single retry attempt.
#[derive(Debug, Clone, Error)]
pub enum RetryError {
    #[error("no retry handler registered for `{0}`")]
    NoHandler(String),
    #[error("invalid work unit payload: {0}")]
    Payload(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("write failed: {0}")]
    Write(String),
    /// The source rejected the query itself; trying again cannot help.
    #[error("fatal fetch error: {0}")]
    Fatal(String),
}

impl RetryError {
    /// Errors that dead-letter the unit at once instead of requeueing it.
    pub fn is_permanent(&self) -> bool {
        matches!(self, RetryError::Payload(_) | RetryError::Fatal(_))
    }
}

/// Re-runs a failed unit: fetch its keys again, then upsert the rows.
#[async_trait]
pub trait RetryHandler: Send + Sync {
    /// Returns the number of rows written.
    async fn retry(&self, unit: &WorkUnit) -> Result<usize, RetryError>;
}

/// Retry queue configuration.
#[derive(Debug, Clone)]
pub struct RetryQueueConfig {
    /// `max_attempts` caps retries per unit; delays grow 1s -> 64s by default.
    pub policy: RetryPolicy,
    /// Drain timer period.
    pub interval: Duration,
    /// Dropped units kept for inspection (oldest evicted first).
    pub dead_letter_capacity: usize,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::exponential(7, Duration::from_secs(1), Duration::from_secs(64)),
            interval: Duration::from_secs(5 * 60),
            dead_letter_capacity: 1000,
        }
    }
}

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Another cycle was already running; nothing was done.
    pub skipped: bool,
    pub attempted: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub dropped: usize,
    pub rows_written: usize,
}

impl DrainReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// Cumulative queue statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryQueueStats {
    pub enqueued: u64,
    pub succeeded: u64,
    pub requeued: u64,
    pub dropped: u64,
    pub cycles: u64,
    pub depth: usize,
}

/// Durable-while-the-process-lives FIFO of failed work units.
///
/// Drained by a periodic timer; only one drain cycle runs at a time. Units
/// are routed by `service_name` to the handler registered for the job that
/// produced them.
pub struct FailedBatchQueue {
    config: RetryQueueConfig,
    units: Mutex<VecDeque<WorkUnit>>,
    in_process: AtomicUsize,
    handlers: RwLock<HashMap<String, Arc<dyn RetryHandler>>>,
    dead_letters: Mutex<VecDeque<DeadLetterEntry>>,
    stats: Mutex<RetryQueueStats>,
    drain_lock: tokio::sync::Mutex<()>,
    drained: Notify,
}

impl core::fmt::Debug for FailedBatchQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FailedBatchQueue")
            .field("config", &self.config)
            .field("depth", &self.depth())
            .finish()
    }
}

impl FailedBatchQueue {
    pub fn new(config: RetryQueueConfig) -> Self {
        Self {
            config,
            units: Mutex::new(VecDeque::new()),
            in_process: AtomicUsize::new(0),
            handlers: RwLock::new(HashMap::new()),
            dead_letters: Mutex::new(VecDeque::new()),
            stats: Mutex::new(RetryQueueStats::default()),
            drain_lock: tokio::sync::Mutex::new(()),
            drained: Notify::new(),
        }
    }

    pub fn arc(config: RetryQueueConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn config(&self) -> &RetryQueueConfig {
        &self.config
    }

    /// Register the handler for units tagged `service_name`.
    pub fn register_handler(&self, service_name: impl Into<String>, handler: Arc<dyn RetryHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(service_name.into(), handler);
    }

    /// Enqueue a failed unit at the tail.
    pub fn add(&self, unit: WorkUnit) {
        debug!(
            unit_id = %unit.id,
            service = %unit.service_name,
            batch = unit.batch_number,
            "work unit queued for retry"
        );
        self.lock_units().push_back(unit);
        self.lock_stats().enqueued += 1;
    }

    /// Units waiting plus the unit currently being retried, if any.
    pub fn depth(&self) -> usize {
        let units = self.lock_units();
        units.len() + self.in_process.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Snapshot of queued units (oldest first).
    pub fn pending(&self) -> Vec<WorkUnit> {
        self.lock_units().iter().cloned().collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> RetryQueueStats {
        let mut stats = self.lock_stats().clone();
        stats.depth = self.depth();
        stats
    }

    /// Run one drain cycle over the units queued when the cycle starts.
    ///
    /// Units requeued during the cycle wait for the next one. Returns a
    /// skipped report when another cycle holds the drain lock.
    pub async fn drain_once(&self) -> DrainReport {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("retry drain already running; skipping cycle");
            return DrainReport::skipped();
        };

        let policy = &self.config.policy;
        let cycle_len = self.lock_units().len();
        let mut report = DrainReport::default();

        for _ in 0..cycle_len {
            let Some(mut unit) = self.take_front() else {
                break;
            };
            report.attempted += 1;

            if unit.retry_count >= policy.max_attempts {
                error!(
                    unit_id = %unit.id,
                    service = %unit.service_name,
                    batch = unit.batch_number,
                    total_batches = unit.total_batches,
                    retries = unit.retry_count,
                    first_failure_at = %unit.first_failure_at,
                    reason = %unit.failure_reason,
                    "work unit permanently failed; dropping"
                );
                self.dead_letter(unit);
                report.dropped += 1;
                self.finish_unit();
                continue;
            }

            let delay = policy.delay_for_attempt(unit.retry_count + 1);
            tokio::time::sleep(delay).await;
            unit.mark_retry();

            let handler = self.handler(&unit.service_name);
            let result = match handler {
                Some(h) => h.retry(&unit).await,
                None => Err(RetryError::NoHandler(unit.service_name.clone())),
            };

            match result {
                Ok(rows) => {
                    info!(
                        unit_id = %unit.id,
                        service = %unit.service_name,
                        retry = unit.retry_count,
                        rows,
                        "work unit recovered"
                    );
                    report.succeeded += 1;
                    report.rows_written += rows;
                }
                Err(err) if err.is_permanent() => {
                    error!(
                        unit_id = %unit.id,
                        service = %unit.service_name,
                        retry = unit.retry_count,
                        error = %err,
                        "work unit cannot succeed; dropping"
                    );
                    unit.mark_failed(err.to_string());
                    self.dead_letter(unit);
                    report.dropped += 1;
                }
                Err(err) => {
                    warn!(
                        unit_id = %unit.id,
                        service = %unit.service_name,
                        retry = unit.retry_count,
                        max_retries = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "work unit retry failed; requeued"
                    );
                    unit.mark_failed(err.to_string());
                    self.lock_units().push_back(unit);
                    report.requeued += 1;
                }
            }
            self.finish_unit();
        }

        {
            let mut stats = self.lock_stats();
            stats.cycles += 1;
            stats.succeeded += report.succeeded as u64;
            stats.requeued += report.requeued as u64;
            stats.dropped += report.dropped as u64;
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                requeued = report.requeued,
                dropped = report.dropped,
                remaining = self.depth(),
                "retry drain cycle finished"
            );
        }
        report
    }

    /// Wait until no unit is queued or in flight, at most `max_wait`.
    ///
    /// Returns `false` (and warns) when the wait timed out.
    pub async fn await_drain(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    depth = self.depth(),
                    waited_secs = max_wait.as_secs(),
                    "retry queue still has outstanding units; giving up the wait"
                );
                return false;
            }
        }
    }

    /// Start the periodic drain timer.
    pub fn spawn(self: &Arc<Self>) -> RetryQueueHandle {
        let queue = self.clone();
        let shutdown = Arc::new(Notify::new());
        let stop = shutdown.clone();
        let period = self.config.interval;

        let join = tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "retry queue worker started");
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = ticker.tick() => {
                        queue.drain_once().await;
                    }
                }
            }
            info!("retry queue worker stopped");
        });

        RetryQueueHandle { shutdown, join }
    }

    fn handler(&self, service_name: &str) -> Option<Arc<dyn RetryHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(service_name)
            .cloned()
    }

    fn take_front(&self) -> Option<WorkUnit> {
        let mut units = self.lock_units();
        let unit = units.pop_front()?;
        self.in_process.fetch_add(1, Ordering::AcqRel);
        Some(unit)
    }

    fn finish_unit(&self) {
        let units = self.lock_units();
        let remaining = self.in_process.fetch_sub(1, Ordering::AcqRel) - 1;
        if units.is_empty() && remaining == 0 {
            self.drained.notify_waiters();
        }
    }

    fn dead_letter(&self, unit: WorkUnit) {
        let mut dls = self.dead_letters.lock().unwrap_or_else(|e| e.into_inner());
        if self.config.dead_letter_capacity == 0 {
            return;
        }
        while dls.len() >= self.config.dead_letter_capacity {
            dls.pop_front();
        }
        dls.push_back(DeadLetterEntry::new(unit));
    }

    // The guarded collections stay consistent even if a holder panicked.
    fn lock_units(&self) -> MutexGuard<'_, VecDeque<WorkUnit>> {
        self.units.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_stats(&self) -> MutexGuard<'_, RetryQueueStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for FailedBatchQueue {
    fn default() -> Self {
        Self::new(RetryQueueConfig::default())
    }
}

/// Handle to the drain timer task.
#[derive(Debug)]
pub struct RetryQueueHandle {
    shutdown: Arc<Notify>,
    join: tokio::task::JoinHandle<()>,
}

impl RetryQueueHandle {
    /// Stop the timer and wait for an in-progress cycle to finish.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        let _ = self.join.await;
    }
}
