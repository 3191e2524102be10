//! Engine-level integration tests over the in-memory index store and
//! mock durable storage.

use std::{sync::Arc, time::Duration};

use chrono::Utc;

use carrier_core::RealClock;
use carrier_queue::{
    retry::{BackoffStrategy, RetryConfig},
    storage::mock::MockQueueStorage,
    IndexStore, MemoryIndexStore, NewRequest, QueueConfig, QueueEngine, QueueError,
    RateLimiterConfig, RequestId, RequestStatus,
};

struct TestEnv {
    engine: QueueEngine,
    index: Arc<MemoryIndexStore>,
    storage: Arc<MockQueueStorage>,
}

fn test_config() -> QueueConfig {
    QueueConfig {
        worker_count: 2,
        retry: RetryConfig {
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_millis(100),
            jitter: false,
            ..Default::default()
        },
        rate_limiter: RateLimiterConfig {
            requests_per_second: 1000,
            burst_size: Some(1000),
            ..Default::default()
        },
        promotion_interval: Duration::from_millis(50),
        slot_wait: Duration::from_millis(500),
        busy_requeue_delay: Duration::from_millis(200),
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn build_env() -> TestEnv {
    let index = Arc::new(MemoryIndexStore::new());
    let storage = Arc::new(MockQueueStorage::new());
    let engine = QueueEngine::new(
        index.clone(),
        storage.clone(),
        test_config(),
        Arc::new(RealClock),
    )
    .expect("engine construction should succeed");

    TestEnv { engine, index, storage }
}

fn request_to(url: &str) -> NewRequest {
    NewRequest::to_url(url)
}

#[tokio::test]
async fn enqueue_rejects_invalid_input() {
    let env = build_env();

    let result = env.engine.enqueue(request_to("not a url")).await;
    assert!(matches!(result, Err(QueueError::Validation { .. })));

    let result = env
        .engine
        .enqueue(NewRequest { priority: Some(250), ..request_to("https://example.com/x") })
        .await;
    assert!(matches!(result, Err(QueueError::Validation { .. })));
}

#[tokio::test]
async fn enqueue_conflicts_on_duplicate_id() {
    let env = build_env();

    let input = NewRequest { id: Some("dup".to_string()), ..request_to("https://example.com/x") };
    env.engine.enqueue(input.clone()).await.expect("first enqueue succeeds");

    let result = env.engine.enqueue(input).await;
    assert!(matches!(result, Err(QueueError::Conflict { .. })));
}

#[tokio::test]
async fn enqueue_writes_durable_row_then_index() {
    let env = build_env();

    let receipt =
        env.engine.enqueue(request_to("https://example.com/hook")).await.expect("enqueue");

    assert!(env.storage.has_status(&receipt.id, RequestStatus::Pending).await);
    assert!(env.index.is_tracked(&receipt.id).await);
    assert_eq!(receipt.position, Some(0));
}

#[tokio::test]
async fn higher_priority_dispatches_first() {
    let env = build_env();

    for (id, priority) in [("low", 10), ("mid", 50), ("high", 90)] {
        env.engine
            .enqueue(NewRequest {
                id: Some(id.to_string()),
                priority: Some(priority),
                ..request_to("https://example.com/hook")
            })
            .await
            .expect("enqueue");
    }

    let mut order = Vec::new();
    while let Some(request) = env.index.dequeue().await.expect("dequeue") {
        order.push(request.id.0);
    }

    assert_eq!(order, vec!["high", "mid", "low"]);
}

#[tokio::test]
async fn future_schedule_lands_in_scheduled_set() {
    let env = build_env();

    let receipt = env
        .engine
        .enqueue(NewRequest {
            scheduled_for: Some(Utc::now() + chrono::Duration::seconds(30)),
            ..request_to("https://example.com/later")
        })
        .await
        .expect("enqueue");

    assert!(env.storage.has_status(&receipt.id, RequestStatus::Scheduled).await);
    assert!(receipt.position.is_none());

    let counts = env.index.counts().await.expect("counts");
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.scheduled, 1);
}

#[tokio::test]
async fn cancel_while_scheduled_removes_everywhere() {
    let env = build_env();

    let receipt = env
        .engine
        .enqueue(NewRequest {
            scheduled_for: Some(Utc::now() + chrono::Duration::seconds(10)),
            ..request_to("https://example.com/later")
        })
        .await
        .expect("enqueue");

    assert!(env.engine.cancel(&receipt.id).await.expect("cancel"));

    let state = env.engine.get_status(&receipt.id).await.expect("status").expect("known id");
    assert_eq!(state.status, RequestStatus::Cancelled);
    assert!(!env.index.is_tracked(&receipt.id).await);
    assert!(env.storage.attempts_for(&receipt.id).await.is_empty());

    // Second cancel finds nothing to remove.
    assert!(!env.engine.cancel(&receipt.id).await.expect("cancel"));
}

#[tokio::test]
async fn cancel_of_unknown_id_returns_false() {
    let env = build_env();
    assert!(!env.engine.cancel(&RequestId::from("ghost")).await.expect("cancel"));
}

#[tokio::test]
async fn enqueue_many_is_atomic_over_duplicates() {
    let env = build_env();

    env.engine
        .enqueue(NewRequest { id: Some("taken".to_string()), ..request_to("https://example.com") })
        .await
        .expect("seed enqueue");

    let batch = vec![
        NewRequest { id: Some("fresh".to_string()), ..request_to("https://example.com") },
        NewRequest { id: Some("taken".to_string()), ..request_to("https://example.com") },
    ];

    let result = env.engine.enqueue_many(batch).await;
    assert!(matches!(result, Err(QueueError::Conflict { .. })));

    // The batch rolled back: "fresh" never landed.
    assert!(env.engine.get_status(&RequestId::from("fresh")).await.expect("status").is_none());
}

#[tokio::test]
async fn enqueue_many_admits_whole_batch() {
    let env = build_env();

    let receipts = env
        .engine
        .enqueue_many(vec![
            request_to("https://a.example.com/1"),
            request_to("https://b.example.com/2"),
            request_to("https://c.example.com/3"),
        ])
        .await
        .expect("batch enqueue");

    assert_eq!(receipts.len(), 3);
    let counts = env.index.counts().await.expect("counts");
    assert_eq!(counts.pending, 3);
}

#[tokio::test]
async fn stats_merge_pending_and_scheduled() {
    let env = build_env();

    env.engine.enqueue(request_to("https://example.com/now")).await.expect("enqueue");
    env.engine
        .enqueue(NewRequest {
            scheduled_for: Some(Utc::now() + chrono::Duration::seconds(60)),
            ..request_to("https://example.com/later")
        })
        .await
        .expect("enqueue");

    let stats = env.engine.get_stats().await.expect("stats");
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.processing, 0);
}

#[tokio::test]
async fn retry_dead_request_requeues_with_reset_state() {
    let env = build_env();

    let receipt =
        env.engine.enqueue(request_to("https://example.com/doomed")).await.expect("enqueue");

    // Drive the request to dead by hand: claim it, then fail it.
    let claimed = env.index.dequeue().await.expect("dequeue").expect("claimed");
    env.storage
        .insert({
            let mut row = env.storage.request(&receipt.id).await.expect("row");
            row.status = RequestStatus::Dead;
            row.attempts = 4;
            row.error = Some("HTTP 503".to_string());
            row
        })
        .await;
    env.index.move_to_dead(&claimed.id).await.expect("move to dead");

    env.engine.retry_dead_request(&receipt.id).await.expect("retry dead");

    let state = env.engine.get_status(&receipt.id).await.expect("status").expect("known id");
    assert_eq!(state.status, RequestStatus::Pending);
    assert_eq!(state.attempts, 0);
    assert!(state.error.is_none());
    assert!(state.next_retry_at.is_none());

    // Out of the dead set, back in the priority queue for a fresh
    // first attempt.
    let counts = env.index.counts().await.expect("counts");
    assert_eq!(counts.dead, 0);
    assert_eq!(counts.pending, 1);

    let requeued = env.index.dequeue().await.expect("dequeue").expect("requeued");
    assert_eq!(requeued.id, receipt.id);
    assert_eq!(requeued.attempts, 0);
}

#[tokio::test]
async fn retry_dead_request_requires_dead_status() {
    let env = build_env();

    let receipt = env.engine.enqueue(request_to("https://example.com/x")).await.expect("enqueue");

    let result = env.engine.retry_dead_request(&receipt.id).await;
    assert!(matches!(result, Err(QueueError::NotFound { .. })));
}

#[tokio::test]
async fn shutdown_rejects_further_enqueues() {
    let env = build_env();

    env.engine.shutdown().await.expect("shutdown");

    let result = env.engine.enqueue(request_to("https://example.com/x")).await;
    assert!(matches!(result, Err(QueueError::ShuttingDown)));

    // Idempotent.
    env.engine.shutdown().await.expect("second shutdown");

    let result = env.engine.resume().await;
    assert!(matches!(result, Err(QueueError::ShuttingDown)));
}

#[tokio::test]
async fn pause_and_resume_are_idempotent() {
    let env = build_env();

    env.engine.start().await.expect("start");
    env.engine.pause().await.expect("pause");
    env.engine.pause().await.expect("second pause");
    env.engine.resume().await.expect("resume");
    env.engine.resume().await.expect("second resume");
    env.engine.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn backpressure_state_starts_idle() {
    let env = build_env();

    let state = env.engine.backpressure_state().await;
    assert_eq!(state.total_active, 0);
    assert!(state.active_by_host.is_empty());
}
