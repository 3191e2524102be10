//! Per-host circuit breaker backed by the shared index store.
//!
//! Three-state machine (closed / open / half-open) whose counters live
//! in the index under `cb:{host}` with a five-minute TTL, so every
//! worker process observes the same breaker. A stale host entry simply
//! expires back to closed.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{error::Result, index::IndexStore};

/// Circuit breaker configuration shared by all hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that trip a closed circuit open.
    pub failure_threshold: u32,

    /// How long an open circuit blocks before probing (open → half-open).
    pub reset_timeout: Duration,

    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,

    /// Requests admitted while half-open.
    pub half_open_max_requests: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
            half_open_max_requests: 3,
        }
    }
}

/// Current state of a host's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests admitted.
    Closed,
    /// Host unhealthy, requests rejected until the reset timeout.
    Open,
    /// Probing recovery with a bounded number of requests.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

impl FromStr for CircuitState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half_open" | "half-open" => Ok(Self::HalfOpen),
            _ => Err(format!("invalid circuit state: {s}")),
        }
    }
}

/// Persisted per-host breaker record (`cb:{host}` hash).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Failure counter within the current state.
    pub failures: u32,
    /// Success counter within the current state.
    pub successes: u32,
    /// When the state last changed.
    pub state_changed_at: DateTime<Utc>,
}

impl CircuitSnapshot {
    /// A fresh closed circuit.
    pub fn closed(now: DateTime<Utc>) -> Self {
        Self { state: CircuitState::Closed, failures: 0, successes: 0, state_changed_at: now }
    }

    fn transition(&mut self, state: CircuitState, now: DateTime<Utc>) {
        self.state = state;
        self.failures = 0;
        self.successes = 0;
        self.state_changed_at = now;
    }
}

/// Observed breaker state returned to callers, with the remaining block
/// time while open.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitStatus {
    /// Current state.
    pub state: CircuitState,
    /// Failure counter within the current state.
    pub failures: u32,
    /// Success counter within the current state.
    pub successes: u32,
    /// Time until an open circuit starts probing; `None` unless open.
    pub time_until_reset: Option<Duration>,
}

/// Per-host circuit breaker over the shared index store.
pub struct CircuitBreaker {
    index: Arc<dyn IndexStore>,
    config: CircuitConfig,
}

impl CircuitBreaker {
    /// Creates a breaker over the given index store.
    pub fn new(index: Arc<dyn IndexStore>, config: CircuitConfig) -> Self {
        Self { index, config }
    }

    async fn load(&self, host: &str) -> Result<CircuitSnapshot> {
        Ok(self
            .index
            .circuit_get(host)
            .await?
            .unwrap_or_else(|| CircuitSnapshot::closed(Utc::now())))
    }

    /// Whether a request to `host` is admitted, and the state observed.
    ///
    /// Performs the open → half-open transition as a side effect once
    /// the reset timeout has elapsed.
    ///
    /// # Errors
    ///
    /// Returns an index error when the store is unreachable.
    pub async fn is_allowed(&self, host: &str) -> Result<(bool, CircuitState)> {
        let mut snapshot = self.load(host).await?;

        match snapshot.state {
            CircuitState::Closed => Ok((true, CircuitState::Closed)),
            CircuitState::Open => {
                let elapsed = Utc::now().signed_duration_since(snapshot.state_changed_at);
                if elapsed.to_std().unwrap_or(Duration::ZERO) >= self.config.reset_timeout {
                    info!(host, "circuit breaker probing recovery (open -> half-open)");
                    snapshot.transition(CircuitState::HalfOpen, Utc::now());
                    self.index.circuit_put(host, &snapshot).await?;
                    Ok((true, CircuitState::HalfOpen))
                } else {
                    Ok((false, CircuitState::Open))
                }
            },
            CircuitState::HalfOpen => {
                let probes = snapshot.successes + snapshot.failures;
                Ok((probes < self.config.half_open_max_requests, CircuitState::HalfOpen))
            },
        }
    }

    /// Records a successful outcome for `host`.
    ///
    /// # Errors
    ///
    /// Returns an index error when the store is unreachable.
    pub async fn record_success(&self, host: &str) -> Result<()> {
        let mut snapshot = self.load(host).await?;

        match snapshot.state {
            CircuitState::Closed => {
                snapshot.failures = 0;
            },
            CircuitState::Open => {
                debug!(host, "success recorded while circuit open");
                return Ok(());
            },
            CircuitState::HalfOpen => {
                snapshot.successes += 1;
                if snapshot.successes >= self.config.success_threshold {
                    info!(host, "circuit breaker closed, host recovered");
                    snapshot.transition(CircuitState::Closed, Utc::now());
                }
            },
        }

        self.index.circuit_put(host, &snapshot).await
    }

    /// Records a failed outcome for `host`.
    ///
    /// # Errors
    ///
    /// Returns an index error when the store is unreachable.
    pub async fn record_failure(&self, host: &str) -> Result<()> {
        let mut snapshot = self.load(host).await?;

        match snapshot.state {
            CircuitState::Closed => {
                snapshot.failures += 1;
                if snapshot.failures >= self.config.failure_threshold {
                    warn!(host, failures = snapshot.failures, "circuit breaker opened");
                    snapshot.transition(CircuitState::Open, Utc::now());
                }
            },
            CircuitState::Open => return Ok(()),
            CircuitState::HalfOpen => {
                warn!(host, "half-open probe failed, circuit breaker reopened");
                snapshot.transition(CircuitState::Open, Utc::now());
            },
        }

        self.index.circuit_put(host, &snapshot).await
    }

    /// Forces a host's circuit closed.
    ///
    /// # Errors
    ///
    /// Returns an index error when the store is unreachable.
    pub async fn reset(&self, host: &str) -> Result<()> {
        self.index.circuit_put(host, &CircuitSnapshot::closed(Utc::now())).await
    }

    /// Observed state plus the remaining block time while open.
    ///
    /// # Errors
    ///
    /// Returns an index error when the store is unreachable.
    pub async fn state(&self, host: &str) -> Result<CircuitStatus> {
        let snapshot = self.load(host).await?;

        let time_until_reset = match snapshot.state {
            CircuitState::Open => {
                let elapsed = Utc::now()
                    .signed_duration_since(snapshot.state_changed_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                Some(self.config.reset_timeout.saturating_sub(elapsed))
            },
            _ => None,
        };

        Ok(CircuitStatus {
            state: snapshot.state,
            failures: snapshot.failures,
            successes: snapshot.successes,
            time_until_reset,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::index::MemoryIndexStore;

    use super::*;

    fn test_config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(100),
            success_threshold: 2,
            half_open_max_requests: 2,
        }
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(Arc::new(MemoryIndexStore::new()), test_config())
    }

    #[tokio::test]
    async fn circuit_starts_closed() {
        let breaker = breaker();
        let (allowed, state) = breaker.is_allowed("api.example.com").await.unwrap();
        assert!(allowed);
        assert_eq!(state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn consecutive_failures_open_circuit() {
        let breaker = breaker();
        let host = "api.example.com";

        for _ in 0..2 {
            breaker.record_failure(host).await.unwrap();
            assert!(breaker.is_allowed(host).await.unwrap().0);
        }

        breaker.record_failure(host).await.unwrap();
        let (allowed, state) = breaker.is_allowed(host).await.unwrap();
        assert!(!allowed);
        assert_eq!(state, CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_failure_counter() {
        let breaker = breaker();
        let host = "api.example.com";

        breaker.record_failure(host).await.unwrap();
        breaker.record_failure(host).await.unwrap();
        breaker.record_success(host).await.unwrap();

        let status = breaker.state(host).await.unwrap();
        assert_eq!(status.failures, 0);
        assert_eq!(status.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn open_circuit_reports_time_until_reset() {
        let breaker = breaker();
        let host = "api.example.com";

        for _ in 0..3 {
            breaker.record_failure(host).await.unwrap();
        }

        let status = breaker.state(host).await.unwrap();
        assert_eq!(status.state, CircuitState::Open);
        assert!(status.time_until_reset.is_some());
        assert!(status.time_until_reset.unwrap() <= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn open_transitions_to_half_open_after_timeout() {
        let breaker = breaker();
        let host = "api.example.com";

        for _ in 0..3 {
            breaker.record_failure(host).await.unwrap();
        }
        assert!(!breaker.is_allowed(host).await.unwrap().0);

        tokio::time::sleep(Duration::from_millis(120)).await;

        let (allowed, state) = breaker.is_allowed(host).await.unwrap();
        assert!(allowed);
        assert_eq!(state, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_successes_close_circuit() {
        let breaker = breaker();
        let host = "api.example.com";

        for _ in 0..3 {
            breaker.record_failure(host).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(breaker.is_allowed(host).await.unwrap().0);

        breaker.record_success(host).await.unwrap();
        breaker.record_success(host).await.unwrap();

        let status = breaker.state(host).await.unwrap();
        assert_eq!(status.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_circuit() {
        let breaker = breaker();
        let host = "api.example.com";

        for _ in 0..3 {
            breaker.record_failure(host).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(breaker.is_allowed(host).await.unwrap().0);

        breaker.record_failure(host).await.unwrap();

        let (allowed, state) = breaker.is_allowed(host).await.unwrap();
        assert!(!allowed);
        assert_eq!(state, CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_limits_probe_count() {
        let breaker = breaker();
        let host = "api.example.com";

        for _ in 0..3 {
            breaker.record_failure(host).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(breaker.is_allowed(host).await.unwrap().0);
        breaker.record_success(host).await.unwrap();

        // One success recorded, cap is 2: one more probe admitted.
        assert!(breaker.is_allowed(host).await.unwrap().0);
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let breaker = breaker();
        let host = "api.example.com";

        for _ in 0..3 {
            breaker.record_failure(host).await.unwrap();
        }
        assert!(!breaker.is_allowed(host).await.unwrap().0);

        breaker.reset(host).await.unwrap();

        let (allowed, state) = breaker.is_allowed(host).await.unwrap();
        assert!(allowed);
        assert_eq!(state, CircuitState::Closed);
    }

    #[test]
    fn state_parse_round_trip() {
        for state in [CircuitState::Closed, CircuitState::Open, CircuitState::HalfOpen] {
            let parsed: CircuitState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert_eq!("half-open".parse::<CircuitState>().unwrap(), CircuitState::HalfOpen);
    }
}
