//! Event system for observing request outcomes.
//!
//! Workers emit tagged events as requests complete, fail, retry, or die.
//! Subscribers register per event kind in a typed subscription table and
//! are invoked sequentially; a failing subscriber is isolated so it can
//! never break the dispatch pipeline.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::error;

use crate::models::RequestId;

/// Events emitted by the dispatch pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueEvent {
    /// A request received a 2xx response.
    Completed(RequestCompleted),

    /// An attempt failed; `will_retry` says whether another follows.
    Failed(RequestFailed),

    /// A retry was scheduled for a failed attempt.
    Retrying(RequestRetrying),

    /// A request exhausted its retries and entered the dead-letter set.
    Dead(RequestDead),
}

impl QueueEvent {
    /// The subscription kind this event is dispatched under.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Completed(_) => EventKind::Complete,
            Self::Failed(_) => EventKind::Error,
            Self::Retrying(_) => EventKind::Retry,
            Self::Dead(_) => EventKind::Dead,
        }
    }

    /// The request this event concerns.
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::Completed(e) => &e.request_id,
            Self::Failed(e) => &e.request_id,
            Self::Retrying(e) => &e.request_id,
            Self::Dead(e) => &e.request_id,
        }
    }
}

/// Subscription kinds available to event consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Successful completions.
    Complete,
    /// Attempt failures (retryable or terminal).
    Error,
    /// Scheduled retries.
    Retry,
    /// Dead-letter transitions.
    Dead,
}

/// Event payload for a successful completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCompleted {
    /// The completed request.
    pub request_id: RequestId,
    /// HTTP status of the winning response.
    pub status_code: u16,
    /// 1-based attempt number that succeeded.
    pub attempt_number: u32,
    /// Wall-clock duration of the winning attempt in milliseconds.
    pub duration_ms: i64,
    /// When the completion was recorded.
    pub completed_at: DateTime<Utc>,
}

/// Event payload for a failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFailed {
    /// The failed request.
    pub request_id: RequestId,
    /// HTTP status when the endpoint responded.
    pub status_code: Option<u16>,
    /// 1-based attempt number that failed.
    pub attempt_number: u32,
    /// Error description.
    pub error: String,
    /// Whether a retry has been scheduled.
    pub will_retry: bool,
    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
}

/// Event payload for a scheduled retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRetrying {
    /// The retrying request.
    pub request_id: RequestId,
    /// 1-based attempt number that just failed.
    pub attempt_number: u32,
    /// When the retry becomes due.
    pub next_retry_at: DateTime<Utc>,
    /// Error that triggered the retry.
    pub error: String,
}

/// Event payload for a dead-letter transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDead {
    /// The dead request.
    pub request_id: RequestId,
    /// Total attempts made.
    pub attempts: u32,
    /// Final error description.
    pub error: String,
    /// When the request died.
    pub died_at: DateTime<Utc>,
}

/// Trait for handling queue events.
///
/// Handlers should not block dispatch for long; slow or panicking
/// handlers are isolated by the subscriber table but still serialize the
/// event pipeline for their kind.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles one event.
    async fn handle_event(&self, event: QueueEvent);
}

/// No-op handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: QueueEvent) {}
}

/// Typed subscription table mapping event kinds to handler lists.
///
/// Dispatch walks the handlers registered for the event's kind in
/// registration order, awaiting each. Every handler runs inside its own
/// spawned task so a panic is absorbed here instead of unwinding into
/// the worker.
#[derive(Debug, Default)]
pub struct SubscriberSet {
    handlers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
}

impl SubscriberSet {
    /// Creates an empty subscription table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for one event kind.
    pub async fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.entry(kind).or_default().push(handler);
    }

    /// Number of handlers registered for a kind.
    pub async fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers.read().await.get(&kind).map_or(0, Vec::len)
    }

    /// Dispatches an event to every handler of its kind, sequentially.
    pub async fn dispatch(&self, event: QueueEvent) {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let table = self.handlers.read().await;
            table.get(&event.kind()).cloned().unwrap_or_default()
        };

        for handler in handlers {
            let payload = event.clone();
            let task = tokio::spawn(async move { handler.handle_event(payload).await });
            if let Err(join_error) = task.await {
                error!(
                    request_id = %event.request_id(),
                    kind = ?event.kind(),
                    error = %join_error,
                    "event subscriber failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug)]
    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    impl CountingHandler {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let count = Arc::new(AtomicUsize::new(0));
            (Self { count: count.clone() }, count)
        }
    }

    #[async_trait::async_trait]
    impl EventHandler for CountingHandler {
        async fn handle_event(&self, _event: QueueEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Debug)]
    struct PanickingHandler;

    #[async_trait::async_trait]
    impl EventHandler for PanickingHandler {
        #[allow(clippy::panic)]
        async fn handle_event(&self, _event: QueueEvent) {
            panic!("simulated subscriber failure");
        }
    }

    fn completed_event() -> QueueEvent {
        QueueEvent::Completed(RequestCompleted {
            request_id: RequestId::generate(),
            status_code: 200,
            attempt_number: 1,
            duration_ms: 12,
            completed_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn dispatch_reaches_handlers_of_matching_kind() {
        let subscribers = SubscriberSet::new();
        let (handler, count) = CountingHandler::new();
        subscribers.subscribe(EventKind::Complete, Arc::new(handler)).await;

        subscribers.dispatch(completed_event()).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_skips_handlers_of_other_kinds() {
        let subscribers = SubscriberSet::new();
        let (handler, count) = CountingHandler::new();
        subscribers.subscribe(EventKind::Dead, Arc::new(handler)).await;

        subscribers.dispatch(completed_event()).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_break_pipeline() {
        let subscribers = SubscriberSet::new();
        let (handler, count) = CountingHandler::new();
        subscribers.subscribe(EventKind::Complete, Arc::new(PanickingHandler)).await;
        subscribers.subscribe(EventKind::Complete, Arc::new(handler)).await;

        subscribers.dispatch(completed_event()).await;

        assert_eq!(count.load(Ordering::SeqCst), 1, "later handler still runs");
    }

    #[tokio::test]
    async fn subscriber_counts_tracked_per_kind() {
        let subscribers = SubscriberSet::new();
        subscribers.subscribe(EventKind::Retry, Arc::new(NoOpEventHandler)).await;
        subscribers.subscribe(EventKind::Retry, Arc::new(NoOpEventHandler)).await;

        assert_eq!(subscribers.subscriber_count(EventKind::Retry).await, 2);
        assert_eq!(subscribers.subscriber_count(EventKind::Complete).await, 0);
    }
}
