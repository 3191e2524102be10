//! Core domain models, events, and durable storage for the carrier queue.
//!
//! Provides strongly-typed request primitives, the event subscription
//! system, the clock abstraction, and the PostgreSQL-backed durable store.
//! The dispatch engine crate builds on these foundations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{EventHandler, EventKind, NoOpEventHandler, QueueEvent, SubscriberSet};
pub use models::{
    AttemptOutcome, AttemptRecord, HttpMethod, NewRequest, RequestId, RequestState, RequestStatus,
    ResponseSummary, StatusPatch, StoreStats, StoredRequest,
};
pub use time::{Clock, RealClock};

/// Default dispatch priority for requests that do not specify one.
pub const DEFAULT_PRIORITY: i32 = 50;

/// Default maximum retry count per request.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Default per-request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: i64 = 30_000;
