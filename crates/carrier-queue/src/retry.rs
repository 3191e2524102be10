//! Retry timing and retry/give-up decisions.
//!
//! Two pure computations: [`delay_for`] turns a completed attempt number
//! into the next backoff delay, and [`should_retry`] decides whether an
//! outcome deserves another attempt. Jitter is parameterised over the
//! random source so tests stay deterministic.

use std::{fmt, sync::Arc, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

/// HTTP statuses retried by default: request timeout, rate limiting, and
/// transient server errors.
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Strategy for calculating backoff delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Delay doubles each attempt.
    #[default]
    Exponential,
    /// Delay grows by the base amount each attempt.
    Linear,
    /// Caller-supplied delay function.
    Custom,
}

/// Which outcomes qualify for a retry.
#[derive(Clone, Default)]
pub enum RetryOn {
    /// Use [`DEFAULT_RETRYABLE_STATUSES`].
    #[default]
    Default,
    /// Retry exactly these status codes.
    StatusCodes(Vec<u16>),
    /// Defer the decision to a caller-supplied predicate over
    /// `(status_code, error)`.
    Predicate(Arc<dyn Fn(Option<u16>, Option<&str>) -> bool + Send + Sync>),
}

impl fmt::Debug for RetryOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "RetryOn::Default"),
            Self::StatusCodes(codes) => write!(f, "RetryOn::StatusCodes({codes:?})"),
            Self::Predicate(_) => write!(f, "RetryOn::Predicate(..)"),
        }
    }
}

/// Retry policy configuration.
#[derive(Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,

    /// Strategy for calculating backoff delays.
    pub strategy: BackoffStrategy,

    /// Base delay for backoff calculation.
    pub base_delay: Duration,

    /// Ceiling applied to every computed delay.
    pub max_delay: Duration,

    /// Whether to randomize delays by a uniform factor in [0.75, 1.25].
    pub jitter: bool,

    /// Which outcomes qualify for retry.
    pub retry_on: RetryOn,

    /// Delay function for [`BackoffStrategy::Custom`]. Attempt is
    /// 1-based.
    pub custom_delay: Option<Arc<dyn Fn(u32) -> Duration + Send + Sync>>,
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("strategy", &self.strategy)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("retry_on", &self.retry_on)
            .field("custom_delay", &self.custom_delay.as_ref().map(|_| "Fn(..)"))
            .finish()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
            retry_on: RetryOn::Default,
            custom_delay: None,
        }
    }
}

impl RetryConfig {
    /// Returns a copy with a different retry budget, used when a request
    /// carries its own `max_retries`.
    pub fn with_max_retries(&self, max_retries: u32) -> Self {
        Self { max_retries, ..self.clone() }
    }
}

/// Delay before the retry following `attempt` (1-based, the attempt that
/// just completed).
///
/// # Errors
///
/// Fails with a configuration error when the strategy is `Custom` but no
/// delay function was supplied.
pub fn delay_for(attempt: u32, cfg: &RetryConfig) -> Result<Duration> {
    delay_with_rng(attempt, cfg, &mut rand::rng())
}

/// [`delay_for`] with an injected random source, for deterministic tests.
///
/// # Errors
///
/// Fails with a configuration error when the strategy is `Custom` but no
/// delay function was supplied.
pub fn delay_with_rng<R: Rng + ?Sized>(
    attempt: u32,
    cfg: &RetryConfig,
    rng: &mut R,
) -> Result<Duration> {
    let attempt = attempt.max(1);

    let base = match cfg.strategy {
        BackoffStrategy::Fixed => cfg.base_delay,
        BackoffStrategy::Exponential => {
            // Exponent clamp keeps the multiplication far from overflow.
            let exponent = (attempt - 1).min(20);
            cfg.base_delay * 2_u32.saturating_pow(exponent)
        },
        BackoffStrategy::Linear => cfg.base_delay * attempt,
        BackoffStrategy::Custom => {
            let delay_fn = cfg.custom_delay.as_ref().ok_or_else(|| {
                QueueError::config("custom backoff strategy requires a delay function")
            })?;
            delay_fn(attempt)
        },
    };

    let capped = base.min(cfg.max_delay);

    if !cfg.jitter {
        return Ok(capped);
    }

    let factor: f64 = rng.random_range(0.75..=1.25);
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let jittered_ms = (capped.as_millis() as f64 * factor).round().max(0.0) as u64;

    Ok(Duration::from_millis(jittered_ms).min(cfg.max_delay))
}

/// Whether an outcome deserves another attempt.
///
/// `attempt` is 1-based and counts the attempt that just completed; once
/// it reaches the retry budget the answer is always no. Transport
/// failures (no status code) retry when they match the known transient
/// set. For responses, `retry_on` governs: a predicate fully defers, a
/// status list is membership, and the default is
/// [`DEFAULT_RETRYABLE_STATUSES`].
pub fn should_retry(
    status_code: Option<u16>,
    error: Option<&str>,
    attempt: u32,
    cfg: &RetryConfig,
) -> bool {
    if attempt >= cfg.max_retries {
        return false;
    }

    if status_code.is_none() {
        if let Some(error) = error {
            if is_transport_retryable(error) {
                return true;
            }
        }
    }

    match &cfg.retry_on {
        RetryOn::Predicate(predicate) => predicate(status_code, error),
        RetryOn::StatusCodes(codes) => {
            status_code.is_some_and(|status| codes.contains(&status))
        },
        RetryOn::Default => {
            status_code.is_some_and(|status| DEFAULT_RETRYABLE_STATUSES.contains(&status))
        },
    }
}

/// Classifies an error description as a transient transport failure.
///
/// Covers connection reset/refused, timeouts, DNS failures, broken
/// pipes, and unreachable hosts or networks.
pub fn is_transport_retryable(error: &str) -> bool {
    let error = error.to_lowercase();

    error.contains("connection reset")
        || error.contains("connection refused")
        || error.contains("connection closed")
        || error.contains("timed out")
        || error.contains("timeout")
        || error.contains("dns")
        || error.contains("broken pipe")
        || error.contains("host unreachable")
        || error.contains("network unreachable")
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn no_jitter(strategy: BackoffStrategy, base_ms: u64) -> RetryConfig {
        RetryConfig {
            strategy,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(60),
            jitter: false,
            ..Default::default()
        }
    }

    #[test]
    fn exponential_backoff_doubles_each_attempt() {
        let cfg = no_jitter(BackoffStrategy::Exponential, 100);

        let delays: Vec<u64> = (1..=5)
            .map(|attempt| delay_for(attempt, &cfg).unwrap().as_millis() as u64)
            .collect();

        assert_eq!(delays, vec![100, 200, 400, 800, 1600]);
    }

    #[test]
    fn linear_backoff_grows_by_base() {
        let cfg = no_jitter(BackoffStrategy::Linear, 250);

        let delays: Vec<u64> = (1..=4)
            .map(|attempt| delay_for(attempt, &cfg).unwrap().as_millis() as u64)
            .collect();

        assert_eq!(delays, vec![250, 500, 750, 1000]);
    }

    #[test]
    fn fixed_backoff_never_changes() {
        let cfg = no_jitter(BackoffStrategy::Fixed, 500);

        for attempt in 1..=6 {
            assert_eq!(delay_for(attempt, &cfg).unwrap(), Duration::from_millis(500));
        }
    }

    #[test]
    fn max_delay_caps_growth() {
        let cfg = RetryConfig {
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            jitter: false,
            ..Default::default()
        };

        assert_eq!(delay_for(10, &cfg).unwrap(), Duration::from_secs(8));
        assert_eq!(delay_for(30, &cfg).unwrap(), Duration::from_secs(8));
    }

    #[test]
    fn delay_is_monotone_before_the_cap() {
        for strategy in [BackoffStrategy::Exponential, BackoffStrategy::Linear] {
            let cfg = no_jitter(strategy, 100);
            let mut previous = Duration::ZERO;
            for attempt in 1..=8 {
                let delay = delay_for(attempt, &cfg).unwrap();
                assert!(delay >= previous, "{strategy:?} not monotone at attempt {attempt}");
                previous = delay;
            }
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let cfg = RetryConfig {
            strategy: BackoffStrategy::Fixed,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            jitter: true,
            ..Default::default()
        };

        let mut rng = StdRng::seed_from_u64(42);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let delay = delay_with_rng(1, &cfg, &mut rng).unwrap().as_millis() as u64;
            assert!((750..=1250).contains(&delay), "jittered delay {delay}ms out of range");
            seen.insert(delay);
        }
        assert!(seen.len() > 1, "jitter should vary the delay");
    }

    #[test]
    fn jitter_respects_max_delay() {
        let cfg = RetryConfig {
            strategy: BackoffStrategy::Fixed,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(1000),
            jitter: true,
            ..Default::default()
        };

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            assert!(delay_with_rng(1, &cfg, &mut rng).unwrap() <= cfg.max_delay);
        }
    }

    #[test]
    fn custom_strategy_uses_supplied_function() {
        let cfg = RetryConfig {
            strategy: BackoffStrategy::Custom,
            custom_delay: Some(Arc::new(|attempt| Duration::from_millis(u64::from(attempt) * 7))),
            jitter: false,
            ..Default::default()
        };

        assert_eq!(delay_for(3, &cfg).unwrap(), Duration::from_millis(21));
    }

    #[test]
    fn custom_strategy_without_function_is_config_error() {
        let cfg = RetryConfig {
            strategy: BackoffStrategy::Custom,
            custom_delay: None,
            ..Default::default()
        };

        assert!(matches!(delay_for(1, &cfg), Err(QueueError::Config { .. })));
    }

    #[test]
    fn retry_stops_at_budget() {
        let cfg = RetryConfig { max_retries: 3, ..Default::default() };

        assert!(should_retry(Some(503), None, 1, &cfg));
        assert!(should_retry(Some(503), None, 2, &cfg));
        assert!(!should_retry(Some(503), None, 3, &cfg));
        assert!(!should_retry(Some(503), None, 4, &cfg));
    }

    #[test]
    fn default_status_set_applies() {
        let cfg = RetryConfig::default();

        for status in DEFAULT_RETRYABLE_STATUSES {
            assert!(should_retry(Some(status), None, 1, &cfg), "{status} should retry");
        }
        assert!(!should_retry(Some(404), None, 1, &cfg));
        assert!(!should_retry(Some(200), None, 1, &cfg));
    }

    #[test]
    fn transport_failures_retry_without_status() {
        let cfg = RetryConfig::default();

        assert!(should_retry(None, Some("connection refused"), 1, &cfg));
        assert!(should_retry(None, Some("DNS resolution failed"), 1, &cfg));
        assert!(should_retry(None, Some("broken pipe"), 1, &cfg));
        assert!(should_retry(None, Some("request timed out"), 1, &cfg));
        assert!(!should_retry(None, Some("invalid certificate"), 1, &cfg));
    }

    #[test]
    fn status_list_is_membership() {
        let cfg = RetryConfig {
            retry_on: RetryOn::StatusCodes(vec![500, 418]),
            ..Default::default()
        };

        assert!(should_retry(Some(418), None, 1, &cfg));
        assert!(should_retry(Some(500), None, 1, &cfg));
        assert!(!should_retry(Some(503), None, 1, &cfg));
    }

    #[test]
    fn predicate_fully_defers() {
        let cfg = RetryConfig {
            retry_on: RetryOn::Predicate(Arc::new(|status, _error| status == Some(599))),
            ..Default::default()
        };

        assert!(should_retry(Some(599), None, 1, &cfg));
        assert!(!should_retry(Some(503), None, 1, &cfg));
    }
}
