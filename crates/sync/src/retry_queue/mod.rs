//! Deferred retry of failed work units.
//!
//! Units that fail inside a job run are parked here and retried on a timer,
//! independently of the job that produced them.

mod queue;
mod unit;

pub use queue::{
    DrainReport, FailedBatchQueue, RetryError, RetryHandler, RetryQueueConfig, RetryQueueHandle,
    RetryQueueStats,
};
pub use unit::{DeadLetterEntry, WorkUnit};
