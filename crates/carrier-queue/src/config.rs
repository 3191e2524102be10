//! Engine configuration.

use std::time::Duration;

use crate::{
    circuit::CircuitConfig, client::ClientConfig, error::{QueueError, Result},
    limiter::RateLimiterConfig, retry::RetryConfig,
};

/// Configuration for the queue engine and its workers.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of concurrent dispatch workers.
    pub worker_count: usize,

    /// Maximum concurrently executing requests per worker process.
    pub max_concurrency: usize,

    /// Optional per-host concurrency ceiling.
    pub per_host_concurrency: Option<usize>,

    /// Default retry policy; per-request `max_retries` overrides the
    /// budget.
    pub retry: RetryConfig,

    /// Token-bucket rate limiter settings.
    pub rate_limiter: RateLimiterConfig,

    /// Circuit breaker settings.
    pub circuit: CircuitConfig,

    /// HTTP client settings.
    pub client: ClientConfig,

    /// How long a worker waits for an admission slot before requeueing
    /// the request.
    pub slot_wait: Duration,

    /// Requeue delay when no slot opened within `slot_wait`.
    pub busy_requeue_delay: Duration,

    /// Requeue delay after an engine-side store failure.
    pub fault_requeue_delay: Duration,

    /// Processing-set entries older than this are reclaimed as orphans
    /// on engine start. Keep above the largest request timeout.
    pub orphan_threshold: Duration,

    /// Cadence of the scheduled-promotion tick.
    pub promotion_interval: Duration,

    /// Maximum time to wait for workers during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            max_concurrency: crate::DEFAULT_MAX_CONCURRENCY,
            per_host_concurrency: None,
            retry: RetryConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            circuit: CircuitConfig::default(),
            client: ClientConfig::default(),
            slot_wait: Duration::from_secs(30),
            busy_requeue_delay: Duration::from_secs(5),
            fault_requeue_delay: Duration::from_secs(2),
            orphan_threshold: Duration::from_secs(300),
            promotion_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for zero worker or concurrency
    /// budgets, a zero rate, or a custom backoff without its function.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(QueueError::config("worker_count must be greater than 0"));
        }
        if self.max_concurrency == 0 {
            return Err(QueueError::config("max_concurrency must be greater than 0"));
        }
        if self.per_host_concurrency == Some(0) {
            return Err(QueueError::config("per_host_concurrency must be greater than 0"));
        }
        if self.rate_limiter.requests_per_second == 0 {
            return Err(QueueError::config("requests_per_second must be greater than 0"));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(QueueError::config("failure_threshold must be greater than 0"));
        }
        if matches!(self.retry.strategy, crate::retry::BackoffStrategy::Custom)
            && self.retry.custom_delay.is_none()
        {
            return Err(QueueError::config("custom backoff strategy requires a delay function"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(QueueConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_budgets_rejected() {
        let config = QueueConfig { worker_count: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let config = QueueConfig { max_concurrency: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let config = QueueConfig { per_host_concurrency: Some(0), ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn custom_strategy_requires_function() {
        let config = QueueConfig {
            retry: crate::retry::RetryConfig {
                strategy: crate::retry::BackoffStrategy::Custom,
                custom_delay: None,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
