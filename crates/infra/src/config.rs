//! Sync engine configuration.
//!
//! Loaded from a TOML file, then overridden by `CHAINSYNC_*` environment
//! variables. The engine never reads this struct directly; the `*_config`
//! helpers turn it into the typed configs each component takes.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

use chainsync_observability::LogFormat;
use chainsync_sync::{
    BatchConfig, CircuitBreakerConfig, ConcurrencyGate, ExecutorConfig, JobRunnerConfig,
    RefreshConfig, RefreshMode, RetryPolicy, RetryQueueConfig,
};

const ENV_PREFIX: &str = "CHAINSYNC_";
const ENV_SOURCE_PREFIX: &str = "CHAINSYNC_SOURCE_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("environment variable {var} has invalid value `{value}`")]
    Env { var: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Attempts per source before failing over.
    pub max_retries: u32,
    /// Base of the exponential backoff between attempts.
    pub retry_delay_ms: u64,
    pub connection_timeout_seconds: u64,
    pub command_timeout_seconds: u64,
    pub enable_failover: bool,
    /// Source names, primary first.
    pub failover_order: Vec<String>,
    /// Source name -> connection string.
    pub sources: BTreeMap<String, String>,
    /// Global gate capacity shared by every job.
    pub max_concurrent_operations: usize,
    pub circuit_breaker: CircuitBreakerSection,
    pub retry_queue: RetryQueueSection,
    pub batch: BatchSection,
    pub refresh: RefreshSection,
    pub jobs: JobsSection,
    pub logging: LoggingSection,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1_000,
            connection_timeout_seconds: 15,
            command_timeout_seconds: 300,
            enable_failover: true,
            failover_order: vec!["Primary".to_string()],
            sources: BTreeMap::new(),
            max_concurrent_operations: 8,
            circuit_breaker: CircuitBreakerSection::default(),
            retry_queue: RetryQueueSection::default(),
            batch: BatchSection::default(),
            refresh: RefreshSection::default(),
            jobs: JobsSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub threshold: u32,
    pub cooldown_minutes: u64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            threshold: 3,
            cooldown_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryQueueSection {
    pub max_retries: u32,
    pub interval_minutes: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound for a job waiting on the queue to empty.
    pub drain_wait_minutes: u64,
    /// Whether jobs wait for the queue to empty before finishing.
    pub await_drain: bool,
    pub dead_letter_capacity: usize,
}

impl Default for RetryQueueSection {
    fn default() -> Self {
        Self {
            max_retries: 7,
            interval_minutes: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 64_000,
            drain_wait_minutes: 30,
            await_drain: false,
            dead_letter_capacity: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BatchSection {
    pub per_job_concurrency: usize,
    pub stagger_ms: u64,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            per_job_concurrency: 5,
            stagger_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RefreshSection {
    pub batch_size: usize,
    pub mode: RefreshMode,
}

impl Default for RefreshSection {
    fn default() -> Self {
        Self {
            batch_size: 500,
            mode: RefreshMode::Atomic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct JobsSection {
    pub empty_reschedule_hours: u64,
    /// Catch-up attempts the scheduler makes after a failed run.
    pub failure_retries: u32,
    pub failure_retry_delay_seconds: u64,
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            empty_reschedule_hours: 4,
            failure_retries: 2,
            failure_retry_delay_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub format: LogFormat,
}

impl SyncConfig {
    /// Read `path`, apply environment overrides, validate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read sync config from {}", path.display()))?;
        let mut config = Self::from_toml_str(&contents)
            .with_context(|| format!("invalid sync config {}", path.display()))?;
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for deployments without a file.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).map_err(|err| anyhow::anyhow!("{err}"))
    }

    /// Apply `CHAINSYNC_<FIELD>` overrides for top-level scalars and
    /// `CHAINSYNC_SOURCE_<NAME>` for connection strings.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (var, value) in vars {
            if let Some(name) = var.strip_prefix(ENV_SOURCE_PREFIX) {
                let key = self
                    .sources
                    .keys()
                    .chain(self.failover_order.iter())
                    .find(|k| k.eq_ignore_ascii_case(name))
                    .cloned()
                    .unwrap_or_else(|| name.to_string());
                self.sources.insert(key, value);
                continue;
            }
            let Some(field) = var.strip_prefix(ENV_PREFIX) else {
                continue;
            };

            let bad = || ConfigError::Env {
                var: var.clone(),
                value: value.clone(),
            };
            match field {
                "MAX_RETRIES" => self.max_retries = value.parse().map_err(|_| bad())?,
                "RETRY_DELAY_MS" => self.retry_delay_ms = value.parse().map_err(|_| bad())?,
                "CONNECTION_TIMEOUT_SECONDS" => {
                    self.connection_timeout_seconds = value.parse().map_err(|_| bad())?
                }
                "COMMAND_TIMEOUT_SECONDS" => {
                    self.command_timeout_seconds = value.parse().map_err(|_| bad())?
                }
                "ENABLE_FAILOVER" => self.enable_failover = value.parse().map_err(|_| bad())?,
                "MAX_CONCURRENT_OPERATIONS" => {
                    self.max_concurrent_operations = value.parse().map_err(|_| bad())?
                }
                "FAILOVER_ORDER" => {
                    self.failover_order = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_operations == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_operations must be at least 1".into(),
            ));
        }
        if self.batch.per_job_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "batch.per_job_concurrency must be at least 1".into(),
            ));
        }
        if self.refresh.batch_size == 0 {
            return Err(ConfigError::Invalid("refresh.batch_size must be at least 1".into()));
        }
        if self.failover_order.is_empty() {
            return Err(ConfigError::Invalid("failover_order is empty".into()));
        }
        if let Some(missing) = self
            .failover_order
            .iter()
            .find(|name| !self.sources.contains_key(*name))
        {
            return Err(ConfigError::Invalid(format!(
                "failover_order names `{missing}` but no such source is configured"
            )));
        }
        Ok(())
    }

    /// `(name, connection string)` pairs in failover order.
    pub fn endpoints(&self) -> Vec<(String, String)> {
        self.failover_order
            .iter()
            .filter_map(|name| self.sources.get(name).map(|url| (name.clone(), url.clone())))
            .collect()
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_seconds)
    }

    pub fn gate(&self) -> ConcurrencyGate {
        ConcurrencyGate::new(self.max_concurrent_operations)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            retry: RetryPolicy::exponential(
                self.max_retries,
                Duration::from_millis(self.retry_delay_ms),
                Duration::from_secs(60),
            ),
            command_timeout: Duration::from_secs(self.command_timeout_seconds),
            enable_failover: self.enable_failover,
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            threshold: self.circuit_breaker.threshold,
            cooldown: Duration::from_secs(self.circuit_breaker.cooldown_minutes * 60),
        }
    }

    pub fn retry_queue_config(&self) -> RetryQueueConfig {
        let q = &self.retry_queue;
        RetryQueueConfig {
            policy: RetryPolicy::exponential(
                q.max_retries,
                Duration::from_millis(q.base_delay_ms),
                Duration::from_millis(q.max_delay_ms),
            ),
            interval: Duration::from_secs(q.interval_minutes * 60),
            dead_letter_capacity: q.dead_letter_capacity,
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            per_job_concurrency: self.batch.per_job_concurrency,
            stagger: Duration::from_millis(self.batch.stagger_ms),
        }
    }

    pub fn refresh_config(&self) -> RefreshConfig {
        RefreshConfig {
            batch_size: self.refresh.batch_size,
            mode: self.refresh.mode,
        }
    }

    pub fn job_runner_config(&self) -> JobRunnerConfig {
        JobRunnerConfig {
            empty_reschedule_delay: Duration::from_secs(self.jobs.empty_reschedule_hours * 3600),
            await_drain: self.retry_queue.await_drain,
            drain_wait: Duration::from_secs(self.retry_queue.drain_wait_minutes * 60),
        }
    }

    /// Backoff for the scheduler's catch-up runs after a failed run.
    pub fn job_failure_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.jobs.failure_retries,
            Duration::from_secs(self.jobs.failure_retry_delay_seconds),
            Duration::from_secs(self.jobs.failure_retry_delay_seconds * 16),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
max_retries = 4
failover_order = ["Primary", "Backup1"]

[sources]
Primary = "postgres://primary/db"
Backup1 = "postgres://backup1/db"

[circuit_breaker]
threshold = 5

[refresh]
mode = "delete_then_insert"

[logging]
format = "pretty"
"#;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.command_timeout_seconds, 300);
        assert_eq!(cfg.retry_queue.max_retries, 7);
        assert_eq!(cfg.refresh.batch_size, 500);
        assert_eq!(cfg.refresh.mode, RefreshMode::Atomic);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(
            cfg.job_runner_config().empty_reschedule_delay,
            Duration::from_secs(4 * 3600)
        );
    }

    #[test]
    fn toml_overrides_and_keeps_defaults() {
        let cfg = SyncConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.max_retries, 4);
        assert_eq!(cfg.circuit_breaker.threshold, 5);
        assert_eq!(cfg.circuit_breaker.cooldown_minutes, 5);
        assert_eq!(cfg.refresh.mode, RefreshMode::DeleteThenInsert);
        assert_eq!(cfg.logging.format, LogFormat::Pretty);
        cfg.validate().unwrap();

        let names: Vec<_> = cfg.endpoints().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Primary", "Backup1"]);
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = SyncConfig::from_toml_str(SAMPLE).unwrap();
        cfg.apply_env([
            ("CHAINSYNC_MAX_RETRIES".to_string(), "6".to_string()),
            ("CHAINSYNC_ENABLE_FAILOVER".to_string(), "false".to_string()),
            ("CHAINSYNC_FAILOVER_ORDER".to_string(), "Backup1, Primary".to_string()),
            ("CHAINSYNC_SOURCE_PRIMARY".to_string(), "postgres://secret/db".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ])
        .unwrap();

        assert_eq!(cfg.max_retries, 6);
        assert!(!cfg.enable_failover);
        assert_eq!(cfg.failover_order, vec!["Backup1", "Primary"]);
        assert_eq!(cfg.sources["Primary"], "postgres://secret/db");
    }

    #[test]
    fn env_only_source_matches_failover_name() {
        let mut cfg = SyncConfig::default();
        cfg.apply_env([("CHAINSYNC_SOURCE_PRIMARY".to_string(), "postgres://p/db".to_string())])
            .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.endpoints(), vec![("Primary".to_string(), "postgres://p/db".to_string())]);
    }

    #[test]
    fn bad_env_value_is_rejected() {
        let mut cfg = SyncConfig::default();
        let err = cfg
            .apply_env([("CHAINSYNC_MAX_RETRIES".to_string(), "many".to_string())])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn unknown_failover_source_is_invalid() {
        let cfg = SyncConfig::default();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("`Primary`"));
    }

    #[test]
    fn converts_to_engine_configs() {
        let cfg = SyncConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.executor_config().retry.max_attempts, 4);
        assert_eq!(cfg.circuit_breaker_config().cooldown, Duration::from_secs(300));
        assert_eq!(cfg.retry_queue_config().policy.max_delay, Duration::from_secs(64));
        assert_eq!(cfg.batch_config().unit_delay(), Duration::from_millis(100));
        assert_eq!(cfg.gate().capacity(), 8);
    }
}
