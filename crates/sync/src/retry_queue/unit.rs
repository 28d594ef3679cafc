//! Failed work units and dead-letter entries.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use chainsync_core::WorkUnitId;

/// The smallest retryable piece of work: one key or one chunk of keys.
///
/// `retry_count` only ever grows; once it reaches the queue's cap the unit is
/// dropped (and dead-lettered for inspection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: WorkUnitId,
    /// Routes the unit to the fetch+write handler of the job that produced it.
    pub service_name: String,
    /// Keys of the unit, serialized as a JSON array.
    pub payload: serde_json::Value,
    /// 1-based number of the unit within its original run.
    pub batch_number: usize,
    pub total_batches: usize,
    pub retry_count: u32,
    pub first_failure_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub failure_reason: String,
}

impl WorkUnit {
    pub fn new(
        service_name: impl Into<String>,
        payload: serde_json::Value,
        batch_number: usize,
        total_batches: usize,
        failure_reason: impl Into<String>,
    ) -> Self {
        Self {
            id: WorkUnitId::new(),
            service_name: service_name.into(),
            payload,
            batch_number,
            total_batches,
            retry_count: 0,
            first_failure_at: Utc::now(),
            last_retry_at: None,
            failure_reason: failure_reason.into(),
        }
    }

    /// Build a unit from typed keys.
    pub fn from_keys<K: Serialize>(
        service_name: impl Into<String>,
        keys: &[K],
        batch_number: usize,
        total_batches: usize,
        failure_reason: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            service_name,
            serde_json::to_value(keys)?,
            batch_number,
            total_batches,
            failure_reason,
        ))
    }

    /// Decode the unit's keys.
    pub fn keys<K: DeserializeOwned>(&self) -> Result<Vec<K>, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Bump the retry counter before an attempt.
    pub fn mark_retry(&mut self) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_retry_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.failure_reason = reason.into();
    }
}

/// A unit dropped after exhausting its retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub unit: WorkUnit,
    pub dropped_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(unit: WorkUnit) -> Self {
        let reason = unit.failure_reason.clone();
        Self {
            unit,
            dropped_at: Utc::now(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip_through_payload() {
        let unit = WorkUnit::from_keys("pool_delegators", &["pool1", "pool2"], 3, 10, "timeout")
            .unwrap();
        assert_eq!(unit.keys::<String>().unwrap(), vec!["pool1", "pool2"]);
        assert_eq!(unit.retry_count, 0);
        assert_eq!(unit.batch_number, 3);
    }

    #[test]
    fn mark_retry_is_monotonic() {
        let mut unit = WorkUnit::new("x", serde_json::json!([1]), 1, 1, "boom");
        unit.mark_retry();
        unit.mark_retry();
        assert_eq!(unit.retry_count, 2);
        assert!(unit.last_retry_at.is_some());
    }

    #[test]
    fn mismatched_key_type_is_an_error() {
        let unit = WorkUnit::new("x", serde_json::json!(["a"]), 1, 1, "boom");
        assert!(unit.keys::<i64>().is_err());
    }
}
