//! Job scheduling contract.
//!
//! A job is identified by its name. [`JobRunner`] guarantees at most one run
//! per name at a time, reschedules runs that find nothing to do, and hands
//! unrecoverable errors back to whoever triggered the run.

mod keyed;
mod runner;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::executor::ExecutorError;
use crate::refresh::{RefreshReport, StoreError};

pub use keyed::{EntitySync, KeyedRefreshJob};
pub use runner::{JobRunner, JobRunnerConfig};

/// Per-name run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Failed,
}

/// What one successful `sync` did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncSummary {
    pub keys: usize,
    pub units_total: usize,
    pub units_failed: usize,
    pub records: usize,
    pub refresh: Option<RefreshReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed {
        summary: SyncSummary,
        /// `Some(false)` when the bounded wait for the retry queue gave up.
        drained: Option<bool>,
    },
    /// No driving keys; one future run was scheduled.
    Rescheduled { delay: Duration },
    /// Another run with the same name was in progress; nothing was done.
    AlreadyRunning,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("loading driving keys failed: {0}")]
    Keys(#[source] ExecutorError),

    #[error("fetch failed: {0}")]
    Fetch(#[from] ExecutorError),

    #[error("refresh failed: {0}")]
    Refresh(#[from] StoreError),

    #[error("every one of {units} units failed; refresh skipped")]
    AllUnitsFailed { units: usize },

    #[error("scheduling failed: {0}")]
    Schedule(String),

    #[error("unknown job `{0}`")]
    UnknownJob(String),
}

/// A schedulable sync job.
#[async_trait]
pub trait SyncJob: Send + Sync {
    type Key: Send + Sync;

    fn name(&self) -> &str;

    /// The key set driving this run (e.g. distinct ids of a parent table).
    async fn driving_keys(&self) -> Result<Vec<Self::Key>, JobError>;

    /// Fetch and write everything for `keys`. Only called with a non-empty set.
    async fn sync(&self, keys: Vec<Self::Key>) -> Result<SyncSummary, JobError>;
}

/// External trigger source, addressed by job name.
pub trait Scheduler: Send + Sync {
    /// Run `job_name` once after `delay`.
    fn schedule_once(&self, job_name: &str, delay: Duration) -> Result<(), JobError>;
}

/// Type-erased job, so schedulers can hold jobs with different key types.
#[async_trait]
pub trait RunnableJob: Send + Sync {
    fn job_name(&self) -> &str;

    async fn run_with(&self, runner: &JobRunner) -> Result<JobOutcome, JobError>;
}

#[async_trait]
impl<J: SyncJob> RunnableJob for J {
    fn job_name(&self) -> &str {
        self.name()
    }

    async fn run_with(&self, runner: &JobRunner) -> Result<JobOutcome, JobError> {
        runner.execute(self).await
    }
}

/// Scheduler that only records requests (tests/dev).
#[derive(Debug, Default)]
pub struct ManualScheduler {
    requests: Mutex<Vec<(String, Duration)>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled(&self) -> Vec<(String, Duration)> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&self, job_name: &str, delay: Duration) -> Result<(), JobError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((job_name.to_string(), delay));
        Ok(())
    }
}
