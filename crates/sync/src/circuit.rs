//! Per-source circuit breaker registry.
//!
//! # States
//! - Closed: fewer than `threshold` consecutive failures, source is eligible
//! - Open: threshold reached and cool-down not elapsed, source is skipped
//! - HalfOpen: cool-down elapsed, source is eligible again; a success closes
//!   the circuit, a failure re-stamps it and it is Open again
//!
//! State is derived lazily from the failure count and the last failure time
//! whenever a caller asks, so no background timer exists.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub threshold: u32,
    /// How long an open circuit keeps its source excluded.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            cooldown: Duration::from_secs(5 * 60),
        }
    }
}

/// Derived circuit state of one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn is_eligible(&self) -> bool {
        !matches!(self, CircuitState::Open)
    }
}

#[derive(Debug, Clone, Default)]
struct SourceHealth {
    failures: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of one source's health.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub source: String,
    pub state: CircuitState,
    pub failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Shared view of source health, owned by the executor and injected where
/// needed. Safe under concurrent access.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    sources: DashMap<String, SourceHealth>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            sources: DashMap::new(),
        }
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Record one exhausted candidate (all retries failed) for `source`.
    pub fn record_failure(&self, source: &str) -> CircuitState {
        let mut health = self.sources.entry(source.to_string()).or_default();
        health.failures = health.failures.saturating_add(1);
        health.last_failure = Some(Instant::now());
        health.last_failure_at = Some(Utc::now());

        let state = self.derive(&health);
        if state == CircuitState::Open {
            warn!(
                source,
                failures = health.failures,
                cooldown_secs = self.config.cooldown.as_secs(),
                "circuit open; source excluded until cool-down elapses"
            );
        }
        state
    }

    /// Record a successful call; closes the circuit.
    pub fn record_success(&self, source: &str) {
        if let Some(mut health) = self.sources.get_mut(source) {
            if health.failures >= self.config.threshold {
                info!(source, "circuit closed after successful call");
            }
            health.failures = 0;
        }
    }

    pub fn state(&self, source: &str) -> CircuitState {
        self.sources
            .get(source)
            .map(|h| self.derive(&h))
            .unwrap_or(CircuitState::Closed)
    }

    pub fn is_eligible(&self, source: &str) -> bool {
        self.state(source).is_eligible()
    }

    pub fn failures(&self, source: &str) -> u32 {
        self.sources.get(source).map(|h| h.failures).unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut out: Vec<_> = self
            .sources
            .iter()
            .map(|entry| CircuitSnapshot {
                source: entry.key().clone(),
                state: self.derive(entry.value()),
                failures: entry.value().failures,
                last_failure_at: entry.value().last_failure_at,
            })
            .collect();
        out.sort_by(|a, b| a.source.cmp(&b.source));
        out
    }

    fn derive(&self, health: &SourceHealth) -> CircuitState {
        if health.failures < self.config.threshold {
            return CircuitState::Closed;
        }
        match health.last_failure {
            Some(at) if at.elapsed() < self.config.cooldown => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }
}
