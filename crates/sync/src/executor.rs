//! Resilient multi-source query executor.
//!
//! Runs one logical query against an ordered list of interchangeable
//! sources:
//!
//! 1. candidates = failover order minus sources whose circuit is open (when
//!    every circuit is open the primary is attempted anyway)
//! 2. per candidate, up to `max_attempts` attempts, each under the
//!    concurrency gate and a command timeout, with exponential backoff
//!    between attempts
//! 3. retriable errors continue the loop; a fatal error aborts the whole call
//! 4. success closes the candidate's circuit and returns every mapped row
//! 5. an exhausted candidate records one circuit failure; move on
//! 6. nothing left: [`ExecutorError::AllSourcesUnavailable`]
//!
//! A call returns either the complete result set or an error, never a
//! truncated result. No data is written.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, instrument, warn};

use chainsync_core::CoreError;

use crate::circuit::CircuitBreakerRegistry;
use crate::gate::ConcurrencyGate;
use crate::retry::RetryPolicy;
use crate::source::{Query, QuerySource, SourceError};

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Attempts per candidate and backoff between them.
    pub retry: RetryPolicy,
    /// Upper bound for a single attempt.
    pub command_timeout: Duration,
    /// When false only the primary source is ever used.
    pub enable_failover: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(60)),
            command_timeout: Duration::from_secs(300),
            enable_failover: true,
        }
    }
}

/// Executor error.
#[derive(Debug, Clone, Error)]
pub enum ExecutorError {
    /// Every candidate was retried out.
    #[error("all sources unavailable (attempted {attempted:?}): {last}")]
    AllSourcesUnavailable {
        attempted: Vec<String>,
        last: SourceError,
    },

    /// A non-retriable error; never retried nor failed over.
    #[error("fatal error from source {source_name}: {error}")]
    Fatal {
        source_name: String,
        error: SourceError,
    },

    /// A fetched row could not be mapped.
    #[error(transparent)]
    Mapping(#[from] CoreError),

    #[error("no data sources configured")]
    NoSources,
}

impl ExecutorError {
    /// True for source exhaustion, the one failure worth deferring to the
    /// retry queue.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ExecutorError::AllSourcesUnavailable { .. })
    }
}

/// Executes queries with retry, failover and circuit breaking.
pub struct ResilientExecutor<S: QuerySource> {
    sources: Vec<Arc<S>>,
    gate: ConcurrencyGate,
    circuits: Arc<CircuitBreakerRegistry>,
    config: ExecutorConfig,
}

impl<S: QuerySource> core::fmt::Debug for ResilientExecutor<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResilientExecutor")
            .field(
                "sources",
                &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("config", &self.config)
            .finish()
    }
}

impl<S: QuerySource> ResilientExecutor<S> {
    /// `sources` must already be in failover order; the first is the primary.
    pub fn new(
        sources: Vec<Arc<S>>,
        gate: ConcurrencyGate,
        circuits: Arc<CircuitBreakerRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            sources,
            gate,
            circuits,
            config,
        }
    }

    pub fn circuits(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuits
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Sources to try for the next call, in order.
    pub fn candidates(&self) -> Vec<Arc<S>> {
        let Some(primary) = self.sources.first() else {
            return Vec::new();
        };
        if !self.config.enable_failover {
            return vec![primary.clone()];
        }

        let eligible: Vec<_> = self
            .sources
            .iter()
            .filter(|s| self.circuits.is_eligible(s.name()))
            .cloned()
            .collect();

        if eligible.is_empty() {
            warn!(
                primary = primary.name(),
                "every source circuit is open; attempting primary anyway"
            );
            return vec![primary.clone()];
        }
        eligible
    }

    /// Execute `query` and map every row with `mapper`.
    #[instrument(skip(self, query, mapper), fields(sql = %short_sql(&query.sql)), err)]
    pub async fn execute<T, F>(&self, query: &Query, mapper: F) -> Result<Vec<T>, ExecutorError>
    where
        F: Fn(&S::Row) -> Result<T, CoreError>,
    {
        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(ExecutorError::NoSources);
        }

        let mut attempted = Vec::with_capacity(candidates.len());
        let mut last_error = None;

        for source in candidates {
            attempted.push(source.name().to_string());

            match self.try_source(source.as_ref(), query).await {
                Ok(rows) => {
                    self.circuits.record_success(source.name());
                    return rows
                        .iter()
                        .map(&mapper)
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(ExecutorError::from);
                }
                Err(err) if err.is_retriable() => {
                    self.circuits.record_failure(source.name());
                    warn!(
                        source = source.name(),
                        error = %err,
                        "source exhausted its retries; failing over"
                    );
                    last_error = Some(err);
                }
                Err(err) => {
                    error!(source = source.name(), error = %err, "fatal query error");
                    return Err(ExecutorError::Fatal {
                        source_name: source.name().to_string(),
                        error: err,
                    });
                }
            }
        }

        let last = last_error.unwrap_or_else(|| SourceError::retriable("no attempt was made"));
        error!(attempted = ?attempted, error = %last, "all sources unavailable");
        Err(ExecutorError::AllSourcesUnavailable { attempted, last })
    }

    /// Run the retry loop against one source. Returns the last error when
    /// retries are exhausted, or the first fatal error.
    async fn try_source(&self, source: &S, query: &Query) -> Result<Vec<S::Row>, SourceError> {
        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let timeout = self.config.command_timeout;

        let mut attempt = 1;
        loop {
            let outcome = self
                .gate
                .with_gate(tokio::time::timeout(timeout, source.query(query)))
                .await
                .unwrap_or_else(|_| Err(SourceError::timeout(timeout)));

            match outcome {
                Ok(rows) => {
                    debug!(source = source.name(), attempt, rows = rows.len(), "query succeeded");
                    return Ok(rows);
                }
                Err(err) if err.is_retriable() && attempt < max_attempts => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        source = source.name(),
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retriable query error; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn short_sql(sql: &str) -> String {
    let flat: String = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(80) {
        Some((idx, _)) => format!("{}...", &flat[..idx]),
        None => flat,
    }
}
