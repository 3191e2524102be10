//! Composite admission control for dispatch.
//!
//! Folds three independent throttles into one decision: in-process
//! concurrency counters, the per-host circuit breaker, and the shared
//! token-bucket rate limiter. Checked in that order so the cheapest
//! gate runs first and a denial names the binding constraint.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;
use tracing::trace;

use carrier_core::Clock;

use crate::{
    circuit::CircuitBreaker,
    error::Result,
    limiter::RateLimiter,
};

/// Poll interval while waiting on a concurrency denial.
const CONCURRENCY_POLL: Duration = Duration::from_millis(50);

/// Why admission was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    /// Total or per-host concurrency limit reached.
    Concurrency,
    /// The host's circuit breaker is open.
    CircuitOpen,
    /// A token bucket is empty.
    RateLimit,
}

/// Outcome of a composite admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Dispatch may proceed.
    Allowed,
    /// Dispatch must wait.
    Denied {
        /// The binding constraint.
        reason: DenialReason,
        /// Suggested wait before rechecking, when the denying gate
        /// knows one.
        retry_after: Option<Duration>,
    },
}

impl AdmissionDecision {
    /// Whether dispatch may proceed.
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Snapshot of the in-process concurrency counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackpressureState {
    /// Requests currently executing in this process.
    pub total_active: usize,
    /// Configured concurrency ceiling.
    pub max_concurrency: usize,
    /// Active request count per host.
    pub active_by_host: HashMap<String, usize>,
}

#[derive(Debug, Default)]
struct Counters {
    total_active: usize,
    active_by_host: HashMap<String, usize>,
}

/// Composes concurrency counters, circuit breaker, and rate limiter
/// into a single admission gate.
///
/// The counters are per-process; cross-process pressure is bounded by
/// the shared rate limiter and approximated as
/// `max_concurrency × worker processes`.
pub struct BackpressureController {
    max_concurrency: usize,
    per_host_concurrency: Option<usize>,
    counters: Mutex<Counters>,
    circuit: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
}

impl BackpressureController {
    /// Creates a controller over the given throttles.
    pub fn new(
        max_concurrency: usize,
        per_host_concurrency: Option<usize>,
        circuit: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            max_concurrency,
            per_host_concurrency,
            counters: Mutex::new(Counters::default()),
            circuit,
            limiter,
            clock,
        }
    }

    /// Runs the composite admission check for `host` without consuming
    /// a slot. A passing check still requires [`acquire`](Self::acquire)
    /// before dispatch.
    ///
    /// # Errors
    ///
    /// Returns an index error when a shared throttle is unreachable.
    pub async fn can_proceed(&self, host: &str) -> Result<AdmissionDecision> {
        {
            let counters = self.counters.lock().await;

            if counters.total_active >= self.max_concurrency {
                return Ok(AdmissionDecision::Denied {
                    reason: DenialReason::Concurrency,
                    retry_after: None,
                });
            }

            if let Some(limit) = self.per_host_concurrency {
                if counters.active_by_host.get(host).copied().unwrap_or(0) >= limit {
                    return Ok(AdmissionDecision::Denied {
                        reason: DenialReason::Concurrency,
                        retry_after: None,
                    });
                }
            }
        }

        let (allowed, _state) = self.circuit.is_allowed(host).await?;
        if !allowed {
            let status = self.circuit.state(host).await?;
            return Ok(AdmissionDecision::Denied {
                reason: DenialReason::CircuitOpen,
                retry_after: status.time_until_reset,
            });
        }

        let token = self.limiter.acquire(Some(host)).await?;
        if !token.allowed {
            return Ok(AdmissionDecision::Denied {
                reason: DenialReason::RateLimit,
                retry_after: Some(token.retry_after),
            });
        }

        Ok(AdmissionDecision::Allowed)
    }

    /// Waits for an admission slot, bounded by `max_wait`.
    ///
    /// Concurrency denials poll every 50 ms; circuit and rate denials
    /// sleep the denial's suggested delay. Returns false on timeout.
    ///
    /// # Errors
    ///
    /// Returns an index error when a shared throttle is unreachable.
    pub async fn wait_for_slot(&self, host: &str, max_wait: Duration) -> Result<bool> {
        let deadline = Instant::now() + max_wait;

        loop {
            match self.can_proceed(host).await? {
                AdmissionDecision::Allowed => return Ok(true),
                AdmissionDecision::Denied { reason, retry_after } => {
                    let now = Instant::now();
                    if now >= deadline {
                        trace!(host, ?reason, "wait_for_slot timed out");
                        return Ok(false);
                    }

                    let wait = match reason {
                        DenialReason::Concurrency => CONCURRENCY_POLL,
                        DenialReason::CircuitOpen | DenialReason::RateLimit => {
                            retry_after.unwrap_or(CONCURRENCY_POLL)
                        },
                    };
                    self.clock.sleep(wait.min(deadline - now).max(Duration::from_millis(1))).await;
                },
            }
        }
    }

    /// Claims a concurrency slot for `host`.
    pub async fn acquire(&self, host: &str) {
        let mut counters = self.counters.lock().await;
        counters.total_active += 1;
        *counters.active_by_host.entry(host.to_string()).or_insert(0) += 1;
    }

    /// Releases a concurrency slot for `host`, saturating at zero and
    /// dropping empty host entries.
    pub async fn release(&self, host: &str) {
        let mut counters = self.counters.lock().await;
        counters.total_active = counters.total_active.saturating_sub(1);

        let drained = match counters.active_by_host.get_mut(host) {
            Some(active) => {
                *active = active.saturating_sub(1);
                *active == 0
            },
            None => false,
        };
        if drained {
            counters.active_by_host.remove(host);
        }
    }

    /// Forwards a success to the circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns an index error when the breaker store is unreachable.
    pub async fn record_success(&self, host: &str) -> Result<()> {
        self.circuit.record_success(host).await
    }

    /// Forwards a failure to the circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns an index error when the breaker store is unreachable.
    pub async fn record_failure(&self, host: &str) -> Result<()> {
        self.circuit.record_failure(host).await
    }

    /// Snapshot of the in-process counters.
    pub async fn state(&self) -> BackpressureState {
        let counters = self.counters.lock().await;
        BackpressureState {
            total_active: counters.total_active,
            max_concurrency: self.max_concurrency,
            active_by_host: counters.active_by_host.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use carrier_core::RealClock;

    use crate::{
        circuit::CircuitConfig,
        index::MemoryIndexStore,
        limiter::RateLimiterConfig,
    };

    use super::*;

    fn controller(max_concurrency: usize, per_host: Option<usize>) -> BackpressureController {
        let index: Arc<MemoryIndexStore> = Arc::new(MemoryIndexStore::new());
        let circuit = Arc::new(CircuitBreaker::new(index.clone(), CircuitConfig::default()));
        let limiter = Arc::new(RateLimiter::new(
            index,
            RateLimiterConfig {
                requests_per_second: 1000,
                burst_size: Some(1000),
                ..Default::default()
            },
        ));
        BackpressureController::new(max_concurrency, per_host, circuit, limiter, Arc::new(RealClock))
    }

    #[tokio::test]
    async fn admits_when_all_gates_pass() {
        let controller = controller(4, None);
        assert!(controller.can_proceed("api.example.com").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn denies_on_total_concurrency() {
        let controller = controller(2, None);
        controller.acquire("a.example.com").await;
        controller.acquire("b.example.com").await;

        match controller.can_proceed("c.example.com").await.unwrap() {
            AdmissionDecision::Denied { reason, .. } => {
                assert_eq!(reason, DenialReason::Concurrency);
            },
            AdmissionDecision::Allowed => panic!("should deny at max concurrency"),
        }
    }

    #[tokio::test]
    async fn denies_on_per_host_concurrency() {
        let controller = controller(10, Some(1));
        controller.acquire("api.example.com").await;

        assert!(!controller.can_proceed("api.example.com").await.unwrap().is_allowed());
        assert!(controller.can_proceed("other.example.com").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn denies_with_circuit_reason_when_open() {
        let controller = controller(4, None);

        for _ in 0..CircuitConfig::default().failure_threshold {
            controller.record_failure("down.example.com").await.unwrap();
        }

        match controller.can_proceed("down.example.com").await.unwrap() {
            AdmissionDecision::Denied { reason, retry_after } => {
                assert_eq!(reason, DenialReason::CircuitOpen);
                assert!(retry_after.is_some());
            },
            AdmissionDecision::Allowed => panic!("open circuit should deny"),
        }
    }

    #[tokio::test]
    async fn release_saturates_and_drops_empty_hosts() {
        let controller = controller(4, None);
        controller.acquire("api.example.com").await;
        controller.release("api.example.com").await;
        controller.release("api.example.com").await;

        let state = controller.state().await;
        assert_eq!(state.total_active, 0);
        assert!(state.active_by_host.is_empty());
    }

    #[tokio::test]
    async fn wait_for_slot_times_out_on_concurrency() {
        let controller = controller(1, None);
        controller.acquire("a.example.com").await;

        let got =
            controller.wait_for_slot("b.example.com", Duration::from_millis(120)).await.unwrap();
        assert!(!got);
    }

    #[tokio::test]
    async fn wait_for_slot_proceeds_once_released() {
        let controller = Arc::new(controller(1, None));
        controller.acquire("a.example.com").await;

        let waiter = controller.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for_slot("b.example.com", Duration::from_secs(2)).await.unwrap()
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        controller.release("a.example.com").await;

        assert!(handle.await.unwrap(), "slot should open after release");
    }

    #[tokio::test]
    async fn state_reports_active_hosts() {
        let controller = controller(8, None);
        controller.acquire("api.example.com").await;
        controller.acquire("api.example.com").await;

        let state = controller.state().await;
        assert_eq!(state.total_active, 2);
        assert_eq!(state.max_concurrency, 8);
        assert_eq!(state.active_by_host.get("api.example.com"), Some(&2));
    }
}
