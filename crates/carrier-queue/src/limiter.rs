//! Token-bucket rate limiting over the shared index store.
//!
//! Two scopes are checked in order: one global bucket, then a per-host
//! bucket sized at a tenth of the global rate. The refill-and-consume
//! step runs server-side in the index store so every worker process
//! draws from the same buckets.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{error::Result, index::IndexStore};

/// Scope key for the global bucket.
const GLOBAL_SCOPE: &str = "global";

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Sustained global request rate.
    pub requests_per_second: u32,

    /// Advisory per-minute budget; not enforced by the bucket, kept for
    /// operator dashboards.
    pub requests_per_minute: Option<u32>,

    /// Global burst capacity; defaults to ⌈1.5 × rps⌉.
    pub burst_size: Option<u32>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self { requests_per_second: 50, requests_per_minute: None, burst_size: None }
    }
}

impl RateLimiterConfig {
    /// Effective global burst capacity.
    pub fn burst(&self) -> f64 {
        self.burst_size
            .map_or_else(|| (1.5 * f64::from(self.requests_per_second)).ceil(), f64::from)
    }

    /// Per-host sustained rate: ⌈rps / 10⌉.
    pub fn host_rate(&self) -> f64 {
        (f64::from(self.requests_per_second) / 10.0).ceil().max(1.0)
    }

    /// Per-host burst capacity: ⌈burst / 5⌉.
    pub fn host_burst(&self) -> f64 {
        (self.burst() / 5.0).ceil().max(1.0)
    }
}

/// Outcome of a token acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenDecision {
    /// Whether a token was consumed.
    pub allowed: bool,
    /// How long to wait before the next token becomes available.
    pub retry_after: Duration,
}

impl TokenDecision {
    /// A granted token.
    pub fn allowed() -> Self {
        Self { allowed: true, retry_after: Duration::ZERO }
    }

    /// A denial with the bucket's suggested wait.
    pub fn denied(retry_after: Duration) -> Self {
        Self { allowed: false, retry_after }
    }
}

/// Token-bucket gate, global and per-host, over the index store.
pub struct RateLimiter {
    index: Arc<dyn IndexStore>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    /// Creates a limiter over the given index store.
    pub fn new(index: Arc<dyn IndexStore>, config: RateLimiterConfig) -> Self {
        Self { index, config }
    }

    /// Consumes one global token, then one host token when a host is
    /// given. A denial at either scope returns that scope's retry delay.
    ///
    /// # Errors
    ///
    /// Returns an index error when the store is unreachable.
    pub async fn acquire(&self, host: Option<&str>) -> Result<TokenDecision> {
        let global = self
            .index
            .take_token(GLOBAL_SCOPE, f64::from(self.config.requests_per_second), self.config.burst())
            .await?;

        if !global.allowed {
            debug!(retry_after_ms = global.retry_after.as_millis(), "global rate limit hit");
            return Ok(global);
        }

        let Some(host) = host else {
            return Ok(global);
        };

        let scoped = self
            .index
            .take_token(
                &format!("host:{host}"),
                self.config.host_rate(),
                self.config.host_burst(),
            )
            .await?;

        if !scoped.allowed {
            debug!(host, retry_after_ms = scoped.retry_after.as_millis(), "host rate limit hit");
        }

        Ok(scoped)
    }

    /// Polls [`acquire`](Self::acquire) until a token is granted,
    /// sleeping each denial's retry delay, bounded by `max_wait`.
    /// Returns whether a token was obtained.
    ///
    /// # Errors
    ///
    /// Returns an index error when the store is unreachable.
    pub async fn wait_for_token(&self, host: Option<&str>, max_wait: Duration) -> Result<bool> {
        let deadline = Instant::now() + max_wait;

        loop {
            let decision = self.acquire(host).await?;
            if decision.allowed {
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }

            let wait = decision.retry_after.max(Duration::from_millis(10)).min(deadline - now);
            tokio::time::sleep(wait).await;
        }
    }
}
