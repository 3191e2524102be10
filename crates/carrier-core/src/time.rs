//! Time abstractions for testable timing operations.
//!
//! Worker polling, backpressure waits, and retry scheduling all go
//! through [`Clock`] so tests can substitute controllable time sources.

use std::{
    future::Future,
    pin::Pin,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

/// Clock abstraction for time operations.
///
/// Production code uses [`RealClock`]; tests can inject controllable
/// implementations.
pub trait Clock: Send + Sync {
    /// Current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Current wall-clock time for timestamps.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Sleeps for the given duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Real clock implementation using system time and tokio sleeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}
