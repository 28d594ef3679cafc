//! Job runner: per-name exclusivity, empty-key reschedule, bounded drain wait.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use chainsync_core::RunId;

use crate::retry_queue::FailedBatchQueue;

use super::{JobError, JobOutcome, JobState, Scheduler, SyncJob};

#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Delay of the one-shot rerun scheduled when a job has no driving keys.
    pub empty_reschedule_delay: Duration,
    /// Wait for the retry queue to empty before reporting completion.
    pub await_drain: bool,
    pub drain_wait: Duration,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            empty_reschedule_delay: Duration::from_secs(4 * 60 * 60),
            await_drain: false,
            drain_wait: Duration::from_secs(30 * 60),
        }
    }
}

/// Runs jobs under the scheduling contract.
pub struct JobRunner {
    states: DashMap<String, JobState>,
    scheduler: Arc<dyn Scheduler>,
    retry_queue: Arc<FailedBatchQueue>,
    config: JobRunnerConfig,
}

impl core::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobRunner")
            .field("states", &self.states)
            .field("config", &self.config)
            .finish()
    }
}

/// Resets a claimed name if the run is dropped before it records an outcome.
struct RunClaim<'a> {
    states: &'a DashMap<String, JobState>,
    name: &'a str,
    settled: bool,
}

impl RunClaim<'_> {
    fn settle(mut self, state: JobState) {
        self.states.insert(self.name.to_string(), state);
        self.settled = true;
    }
}

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.states.insert(self.name.to_string(), JobState::Failed);
        }
    }
}

impl JobRunner {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        retry_queue: Arc<FailedBatchQueue>,
        config: JobRunnerConfig,
    ) -> Self {
        Self {
            states: DashMap::new(),
            scheduler,
            retry_queue,
            config,
        }
    }

    pub fn config(&self) -> &JobRunnerConfig {
        &self.config
    }

    pub fn state(&self, job_name: &str) -> JobState {
        self.states
            .get(job_name)
            .map(|s| *s)
            .unwrap_or(JobState::Idle)
    }

    /// Run `job` once. A second concurrent call for the same name returns
    /// [`JobOutcome::AlreadyRunning`] without doing any work.
    #[instrument(skip_all, fields(job = %job.name(), run_id = %RunId::new()))]
    pub async fn execute<J: SyncJob>(&self, job: &J) -> Result<JobOutcome, JobError> {
        let name = job.name();
        let Some(claim) = self.claim(name) else {
            warn!("previous run still in progress; skipping");
            return Ok(JobOutcome::AlreadyRunning);
        };

        let started = Instant::now();
        info!("job started");

        match self.run(job).await {
            Ok(outcome) => {
                claim.settle(JobState::Idle);
                info!(
                    duration_ms = started.elapsed().as_millis() as u64,
                    outcome = ?outcome,
                    "job finished"
                );
                Ok(outcome)
            }
            Err(err) => {
                claim.settle(JobState::Failed);
                error!(
                    duration_ms = started.elapsed().as_millis() as u64,
                    error = %err,
                    "job failed"
                );
                Err(err)
            }
        }
    }

    fn claim<'a>(&'a self, name: &'a str) -> Option<RunClaim<'a>> {
        let mut state = self.states.entry(name.to_string()).or_insert(JobState::Idle);
        if *state == JobState::Running {
            return None;
        }
        *state = JobState::Running;
        Some(RunClaim {
            states: &self.states,
            name,
            settled: false,
        })
    }

    async fn run<J: SyncJob>(&self, job: &J) -> Result<JobOutcome, JobError> {
        let keys = job.driving_keys().await?;
        if keys.is_empty() {
            let delay = self.config.empty_reschedule_delay;
            self.scheduler.schedule_once(job.name(), delay)?;
            info!(
                delay_secs = delay.as_secs(),
                "no driving keys yet; rescheduled one run"
            );
            return Ok(JobOutcome::Rescheduled { delay });
        }

        let summary = job.sync(keys).await?;

        let drained = if self.config.await_drain && !self.retry_queue.is_empty() {
            Some(self.retry_queue.await_drain(self.config.drain_wait).await)
        } else {
            None
        };

        Ok(JobOutcome::Completed { summary, drained })
    }
}
