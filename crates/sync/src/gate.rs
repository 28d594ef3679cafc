//! Process-wide concurrency gate for outbound data-source operations.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default number of simultaneous outbound operations.
pub const DEFAULT_GATE_CAPACITY: usize = 8;

/// Counting permit pool shared by every job in the process.
///
/// Cloning is cheap; clones share the same permits. The protected resource
/// (connection pools, upstream rate limits) is process-wide, so there should
/// be exactly one gate per process.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    capacity: usize,
}

/// A held gate permit. Dropping it releases the permit.
#[derive(Debug)]
pub struct GatePermit {
    // `None` only if the semaphore were closed, which this type never does.
    _permit: Option<OwnedSemaphorePermit>,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ConcurrencyGate {
    /// Create a gate with `capacity` permits (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of operations currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait (cooperatively) for a permit.
    pub async fn acquire(&self) -> GatePermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .ok();
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        GatePermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        }
    }

    /// Return a permit early. Equivalent to dropping it.
    pub fn release(&self, permit: GatePermit) {
        drop(permit);
    }

    /// Run `operation` while holding a permit.
    ///
    /// The permit is released when the operation finishes, whatever its
    /// outcome, including when the future is dropped mid-flight.
    pub async fn with_gate<F, T>(&self, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await;
        operation.await
    }
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new(DEFAULT_GATE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn permits_are_released_on_drop() {
        let gate = ConcurrencyGate::new(2);
        let a = gate.acquire().await;
        let b = gate.acquire().await;
        assert_eq!(gate.in_flight(), 2);
        assert_eq!(gate.available(), 0);

        drop(a);
        gate.release(b);
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.available(), 2);
    }

    #[tokio::test]
    async fn with_gate_releases_on_error() {
        let gate = ConcurrencyGate::new(1);
        let result: Result<(), &str> = gate.with_gate(async { Err("boom") }).await;
        assert!(result.is_err());
        assert_eq!(gate.available(), 1);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn bounds_concurrent_operations() {
        let gate = ConcurrencyGate::new(3);
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..12)
            .map(|_| {
                let gate = gate.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    gate.with_gate(async {
                        peak.fetch_max(gate.in_flight(), Ordering::AcqRel);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    })
                    .await
                })
            })
            .collect();

        for t in tasks {
            t.await.unwrap();
        }

        assert!(peak.load(Ordering::Acquire) <= 3);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn zero_capacity_is_clamped() {
        let gate = ConcurrencyGate::new(0);
        assert_eq!(gate.capacity(), 1);
        let _p = gate.acquire().await;
    }
}
