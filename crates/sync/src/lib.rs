//! Storage-agnostic sync engine.
//!
//! Leaf first: the [`gate`] bounds outbound calls process-wide, the
//! [`executor`] runs one query against failover sources, the
//! [`orchestrator`] fans key sets out into units and parks failures in the
//! [`retry_queue`], [`refresh`] is the write path, and [`job`] ties a run
//! together under the scheduling contract.

pub mod circuit;
pub mod executor;
pub mod gate;
pub mod job;
pub mod orchestrator;
pub mod refresh;
pub mod retry;
pub mod retry_queue;
pub mod source;

pub use circuit::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState};
pub use executor::{ExecutorConfig, ExecutorError, ResilientExecutor};
pub use gate::{ConcurrencyGate, DEFAULT_GATE_CAPACITY, GatePermit};
pub use job::{
    EntitySync, JobError, JobOutcome, JobRunner, JobRunnerConfig, JobState, KeyedRefreshJob,
    ManualScheduler, RunnableJob, Scheduler, SyncJob, SyncSummary,
};
pub use orchestrator::{BatchConfig, BatchOrchestrator, BatchOutcome, Deferrable, Partitioning, partition};
pub use refresh::{
    InMemoryRefreshStore, PreparedRows, RefreshConfig, RefreshMode, RefreshReport, RefreshStore,
    StoreError, prepare_rows,
};
pub use retry::RetryPolicy;
pub use retry_queue::{
    DeadLetterEntry, DrainReport, FailedBatchQueue, RetryError, RetryHandler, RetryQueueConfig,
    RetryQueueHandle, RetryQueueStats, WorkUnit,
};
pub use source::{FailureKind, InMemorySource, Query, QueryParam, QuerySource, ScriptedResponse, SourceError};
