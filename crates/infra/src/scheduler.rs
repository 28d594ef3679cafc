//! Tokio-based trigger source for sync jobs.
//!
//! Each registered job runs on its own period through the shared
//! [`JobRunner`]. One-shot runs requested through [`ScheduleSender`] (the
//! runner's [`Scheduler`]) are delayed tasks. A failed run gets a bounded
//! number of catch-up runs with backoff before the next regular tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use chainsync_sync::{JobError, JobOutcome, JobRunner, RetryPolicy, RunnableJob, Scheduler};

#[derive(Debug)]
struct ScheduleRequest {
    job_name: String,
    delay: Duration,
}

/// [`Scheduler`] handed to the [`JobRunner`]; forwards requests to the
/// running [`TokioScheduler`].
#[derive(Debug, Clone)]
pub struct ScheduleSender {
    tx: mpsc::UnboundedSender<ScheduleRequest>,
}

impl Scheduler for ScheduleSender {
    fn schedule_once(&self, job_name: &str, delay: Duration) -> Result<(), JobError> {
        self.tx
            .send(ScheduleRequest {
                job_name: job_name.to_string(),
                delay,
            })
            .map_err(|_| JobError::Schedule("scheduler is not running".into()))
    }
}

/// Last observed result of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub last_started_at: DateTime<Utc>,
    pub last_finished_at: DateTime<Utc>,
    pub last_outcome: String,
    pub consecutive_failures: u32,
    pub runs: u64,
}

struct Registration {
    job: Arc<dyn RunnableJob>,
    period: Duration,
}

#[derive(Clone)]
struct Shared {
    runner: Arc<JobRunner>,
    jobs: Arc<DashMap<String, Arc<dyn RunnableJob>>>,
    records: Arc<DashMap<String, JobRecord>>,
    failure_policy: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

pub struct TokioScheduler {
    registrations: Vec<Registration>,
    requests: mpsc::UnboundedReceiver<ScheduleRequest>,
    records: Arc<DashMap<String, JobRecord>>,
    failure_policy: RetryPolicy,
}

impl TokioScheduler {
    /// Build the scheduler and the sender to give the [`JobRunner`].
    pub fn new(failure_policy: RetryPolicy) -> (Self, ScheduleSender) {
        let (tx, requests) = mpsc::unbounded_channel();
        let scheduler = Self {
            registrations: Vec::new(),
            requests,
            records: Arc::new(DashMap::new()),
            failure_policy,
        };
        (scheduler, ScheduleSender { tx })
    }

    /// Run `job` every `period`; the first run happens one period after start.
    pub fn register(&mut self, job: Arc<dyn RunnableJob>, period: Duration) {
        self.registrations.push(Registration { job, period });
    }

    /// Spawn every periodic loop plus the one-shot request listener.
    pub fn start(self, runner: Arc<JobRunner>) -> SchedulerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Shared {
            runner,
            jobs: Arc::new(DashMap::new()),
            records: self.records.clone(),
            failure_policy: self.failure_policy,
            shutdown: stop_rx,
        };

        let mut tasks = Vec::with_capacity(self.registrations.len() + 1);
        for reg in self.registrations {
            shared
                .jobs
                .insert(reg.job.job_name().to_string(), reg.job.clone());
            tasks.push(tokio::spawn(periodic(shared.clone(), reg.job, reg.period)));
        }
        tasks.push(tokio::spawn(listen(shared.clone(), self.requests)));
        info!(jobs = shared.jobs.len(), "scheduler started");

        SchedulerHandle {
            stop: stop_tx,
            tasks,
            records: self.records,
        }
    }
}

/// Running scheduler.
pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    records: Arc<DashMap<String, JobRecord>>,
}

impl SchedulerHandle {
    pub fn record(&self, job_name: &str) -> Option<JobRecord> {
        self.records.get(job_name).map(|r| r.clone())
    }

    /// Stop every loop; in-progress runs finish first.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("scheduler stopped");
    }
}

async fn periodic(shared: Shared, job: Arc<dyn RunnableJob>, period: Duration) {
    let mut shutdown = shared.shutdown.clone();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => run_with_catch_up(&shared, job.as_ref()).await,
        }
    }
}

async fn listen(shared: Shared, mut requests: mpsc::UnboundedReceiver<ScheduleRequest>) {
    let mut shutdown = shared.shutdown.clone();
    loop {
        let request = tokio::select! {
            _ = shutdown.changed() => break,
            req = requests.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };

        let Some(job) = shared.jobs.get(&request.job_name).map(|j| j.clone()) else {
            warn!(job = %request.job_name, "one-shot run requested for unknown job");
            continue;
        };
        info!(
            job = %request.job_name,
            delay_secs = request.delay.as_secs(),
            "one-shot run scheduled"
        );

        let shared = shared.clone();
        tokio::spawn(async move {
            let mut shutdown = shared.shutdown.clone();
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(request.delay) => {
                    run_with_catch_up(&shared, job.as_ref()).await;
                }
            }
        });
    }
}

async fn run_with_catch_up(shared: &Shared, job: &dyn RunnableJob) {
    let policy = &shared.failure_policy;
    let mut failures = 0;
    loop {
        let started_at = Utc::now();
        let result = job.run_with(&shared.runner).await;
        record(shared, job.job_name(), started_at, &result);

        let Err(err) = result else {
            return;
        };
        if !policy.should_retry(failures) {
            error!(
                job = job.job_name(),
                error = %err,
                "job failed; waiting for next scheduled run"
            );
            return;
        }
        failures += 1;
        let delay = policy.delay_for_attempt(failures);
        warn!(
            job = job.job_name(),
            attempt = failures,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "job failed; catch-up run scheduled"
        );

        let mut shutdown = shared.shutdown.clone();
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn record(shared: &Shared, name: &str, started_at: DateTime<Utc>, result: &Result<JobOutcome, JobError>) {
    let outcome = match result {
        Ok(JobOutcome::Completed { .. }) => "completed".to_string(),
        Ok(JobOutcome::Rescheduled { .. }) => "rescheduled".to_string(),
        Ok(JobOutcome::AlreadyRunning) => "already_running".to_string(),
        Err(err) => format!("failed: {err}"),
    };
    let failed = result.is_err();

    let mut entry = shared.records.entry(name.to_string()).or_insert_with(|| JobRecord {
        last_started_at: started_at,
        last_finished_at: started_at,
        last_outcome: String::new(),
        consecutive_failures: 0,
        runs: 0,
    });
    entry.last_started_at = started_at;
    entry.last_finished_at = Utc::now();
    entry.last_outcome = outcome;
    entry.runs += 1;
    entry.consecutive_failures = if failed { entry.consecutive_failures + 1 } else { 0 };
}
