//! Scheduling and dispatch engine for durable outbound HTTP requests.
//!
//! Couples a fast shared queue index (redis) with a durable relational
//! store (PostgreSQL): the index makes queueing decisions, the database
//! is the system of record. Async workers claim work atomically, execute
//! it under backpressure gating, classify the outcome, and drive
//! retry/dead-letter transitions.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐    enqueue     ┌──────────────────────────────┐
//! │ QueueEngine │───────────────▶│ PostgreSQL (system of record)│
//! └─────────────┘                └──────────────────────────────┘
//!        │                                      ▲
//!        │ index insert + publish               │ transitions,
//!        ▼                                      │ attempt log
//! ┌──────────────────────────────┐       ┌────────────┐
//! │ Index Store (redis)          │◀─────▶│  Workers   │
//! │  pending / scheduled /       │ claim │            │
//! │  processing / dead sets      │       │ ┌────────┐ │
//! │  rate buckets · breaker ·    │       │ │backpr. │ │
//! │  pub/sub notifications       │       │ │gating  │ │
//! └──────────────────────────────┘       │ └────────┘ │
//!                                        └────────────┘
//!                                               │
//!                                               ▼
//!                                     destination endpoints
//! ```
//!
//! Dispatch is gated three ways before a request leaves a worker:
//! in-process concurrency counters, a per-host circuit breaker, and a
//! shared token-bucket rate limiter (global and per-host scopes).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backpressure;
pub mod circuit;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod limiter;
pub mod pool;
pub mod retry;
pub mod storage;
pub mod worker;

pub use backpressure::{AdmissionDecision, BackpressureController, BackpressureState, DenialReason};
pub use carrier_core::{
    EventHandler, EventKind, NewRequest, NoOpEventHandler, QueueEvent, RequestId, RequestState,
    RequestStatus, StoredRequest,
};
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitState};
pub use client::{ClientConfig, DispatchClient, DispatchResponse};
pub use config::QueueConfig;
pub use engine::{EnqueueReceipt, QueueEngine};
pub use error::{QueueError, Result};
pub use index::{IndexStore, MemoryIndexStore, QueueCounts, QueueSignal, RedisIndexStore};
pub use limiter::{RateLimiter, RateLimiterConfig, TokenDecision};
pub use pool::WorkerPool;
pub use retry::{BackoffStrategy, RetryConfig, RetryOn};
pub use storage::{PostgresQueueStorage, QueueStorage};
pub use worker::Worker;

/// Default number of concurrent dispatch workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default maximum concurrently executing requests per worker process.
pub const DEFAULT_MAX_CONCURRENCY: usize = 64;

/// Default key prefix for every index store key.
pub const DEFAULT_KEY_PREFIX: &str = "hqm:";
