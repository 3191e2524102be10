//! Fast shared queue index backing all scheduling decisions.
//!
//! Abstracts a store with score-ordered sets, atomic scripting, pub/sub,
//! and per-key TTL. Production deployments use [`RedisIndexStore`] so
//! every worker process shares one index; [`MemoryIndexStore`] offers the
//! same semantics in-process for tests and single-node setups.
//!
//! # Key layout (under the configurable prefix, default `hqm:`)
//!
//! | Key | Type | Purpose |
//! |---|---|---|
//! | `queue:pending` | ordered set | score packs inverted priority + admission time |
//! | `queue:processing` | ordered set | score = claim epoch ms |
//! | `queue:scheduled` | ordered set | score = due epoch ms |
//! | `queue:dead` | ordered set | score = death epoch ms |
//! | `request:{id}` | blob | JSON snapshot of the request |
//! | `ratelimit:{scope}` | hash | token bucket, TTL 60 s |
//! | `cb:{host}` | hash | circuit breaker, TTL 300 s |
//! | `lock:{resource}` | string | unique token, TTL per caller |
//! | `channel:new-request` | pub/sub | `{id}`, `batch:{n}`, or `promoted:{n}` |
//! | `channel:retry` | pub/sub | JSON `{requestId, retryAt}` |

mod memory;
mod redis_store;

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use carrier_core::{RequestId, StoredRequest};

use crate::{circuit::CircuitSnapshot, error::Result, limiter::TokenDecision};

pub use memory::MemoryIndexStore;
pub use redis_store::RedisIndexStore;

/// Neutral priority assigned when a scheduled request is promoted back
/// into the pending queue.
pub const PROMOTED_PRIORITY: i32 = 50;

/// Pending-queue scores pack the inverted priority into the high digits
/// and the admission time (epoch ms) into the low digits, so lower score
/// still means higher priority while equal priorities pop FIFO.
pub(crate) const PRIORITY_SCORE_BASE: i64 = 10_000_000_000_000;

pub(crate) fn pending_score(priority: i32, now_ms: i64) -> i64 {
    i64::from(100 - priority.clamp(0, 100)) * PRIORITY_SCORE_BASE + now_ms
}

/// Wake-up signals published by the index store.
///
/// Workers treat any `NewRequest` as a drain trigger and any `Retry` as
/// a promotion trigger; the payloads exist for observability.
#[derive(Debug, Clone)]
pub enum QueueSignal {
    /// One or more requests entered the pending queue. The payload is
    /// the published message: an id, `batch:{n}`, or `promoted:{n}`.
    NewRequest(String),

    /// A retry was scheduled.
    Retry {
        /// The request awaiting retry.
        request_id: RequestId,
        /// When it becomes due.
        retry_at: DateTime<Utc>,
    },
}

/// Cardinality of each queue membership set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    /// Ids in the priority queue.
    pub pending: u64,
    /// Ids awaiting their due time.
    pub scheduled: u64,
    /// Ids claimed by workers.
    pub processing: u64,
    /// Ids in the dead-letter set.
    pub dead: u64,
}

/// Operations the engine requires from the shared index.
///
/// Every multi-step operation is atomic with respect to concurrent
/// workers: the redis implementation uses server-side Lua scripts, the
/// memory implementation a single mutex-guarded critical section.
#[async_trait::async_trait]
pub trait IndexStore: Send + Sync {
    /// Stores the request snapshot, adds the id to the priority queue,
    /// and publishes `new-request`. Returns the queue position (0-based).
    async fn enqueue(&self, request: &StoredRequest) -> Result<u64>;

    /// Enqueues a batch with a single `batch:{n}` notification.
    async fn enqueue_batch(&self, requests: &[StoredRequest]) -> Result<()>;

    /// Stores the snapshot and adds the id to the scheduled set with the
    /// given due time.
    async fn enqueue_scheduled(&self, request: &StoredRequest, at: DateTime<Utc>) -> Result<()>;

    /// Atomically pops the best-priority id into the processing set and
    /// returns its deserialized snapshot. `None` when the queue is empty.
    async fn dequeue(&self) -> Result<Option<StoredRequest>>;

    /// Moves an id from processing to the scheduled set at `at` and
    /// publishes `retry`.
    async fn schedule_retry(&self, request_id: &RequestId, at: DateTime<Utc>) -> Result<()>;

    /// Moves every due id from scheduled back to pending at neutral
    /// priority, publishing one `promoted:{n}` notification. Idempotent;
    /// returns the moved ids.
    async fn promote_scheduled(&self) -> Result<Vec<RequestId>>;

    /// Removes a finished id from the processing set and drops its
    /// snapshot.
    async fn mark_complete(&self, request_id: &RequestId) -> Result<()>;

    /// Moves an id from processing to the dead-letter set.
    async fn move_to_dead(&self, request_id: &RequestId) -> Result<()>;

    /// Removes an id from the pending and scheduled sets. Returns
    /// whether any set was affected; ids already processing are not
    /// cancelled.
    async fn cancel(&self, request_id: &RequestId) -> Result<bool>;

    /// Moves processing entries claimed more than `older_than` ago back
    /// to the pending queue. Used for orphan recovery after worker
    /// crashes; returns the reclaimed ids.
    async fn reclaim_processing(&self, older_than: Duration) -> Result<Vec<RequestId>>;

    /// Atomic token-bucket refill and consume for one scope key.
    async fn take_token(&self, scope: &str, rate_per_sec: f64, burst: f64)
        -> Result<TokenDecision>;

    /// Reads the circuit breaker hash for a host.
    async fn circuit_get(&self, host: &str) -> Result<Option<CircuitSnapshot>>;

    /// Writes the circuit breaker hash for a host (TTL 300 s).
    async fn circuit_put(&self, host: &str, snapshot: &CircuitSnapshot) -> Result<()>;

    /// Acquires a short-lived exclusive lock, returning the unique token
    /// on success.
    async fn acquire_lock(&self, resource: &str, ttl: Duration) -> Result<Option<String>>;

    /// Releases a lock if the token still matches (compare-and-delete).
    async fn release_lock(&self, resource: &str, token: &str) -> Result<bool>;

    /// Cardinality of each queue set.
    async fn counts(&self) -> Result<QueueCounts>;

    /// Subscribes to queue wake-up signals.
    fn subscribe(&self) -> broadcast::Receiver<QueueSignal>;
}

pub(crate) fn now_ms(now: DateTime<Utc>) -> i64 {
    now.timestamp_millis()
}

pub(crate) fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}
