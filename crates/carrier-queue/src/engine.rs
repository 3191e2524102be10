//! Queue engine: admission, lifecycle, and observation facade.
//!
//! Owns the index store, the durable store seam, the backpressure
//! stack, and the worker pool. Embedding applications (CLI, HTTP, RPC
//! surfaces) wrap this API; the engine itself exposes no transport.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use carrier_core::{
    Clock, EventHandler, EventKind, NewRequest, RequestId, RequestState, RequestStatus,
    StoreStats, StoredRequest, SubscriberSet,
};

use crate::{
    backpressure::{BackpressureController, BackpressureState},
    circuit::CircuitBreaker,
    client::DispatchClient,
    config::QueueConfig,
    error::{QueueError, Result},
    index::IndexStore,
    limiter::RateLimiter,
    pool::WorkerPool,
    storage::QueueStorage,
    worker::Worker,
};

/// Result of admitting a request.
#[derive(Debug, Clone)]
pub struct EnqueueReceipt {
    /// The admitted request's id.
    pub id: RequestId,
    /// Position in the priority queue at admission time, when known.
    pub position: Option<u64>,
}

/// Durable, distributed HTTP request queue engine.
pub struct QueueEngine {
    index: Arc<dyn IndexStore>,
    storage: Arc<dyn QueueStorage>,
    config: QueueConfig,
    client: Arc<DispatchClient>,
    backpressure: Arc<BackpressureController>,
    subscribers: Arc<SubscriberSet>,
    pool: Mutex<Option<WorkerPool>>,
    shutting_down: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl QueueEngine {
    /// Creates an engine over the given stores.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid settings or an
    /// unbuildable HTTP client.
    pub fn new(
        index: Arc<dyn IndexStore>,
        storage: Arc<dyn QueueStorage>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let client = Arc::new(DispatchClient::new(config.client.clone())?);
        let circuit = Arc::new(CircuitBreaker::new(index.clone(), config.circuit.clone()));
        let limiter = Arc::new(RateLimiter::new(index.clone(), config.rate_limiter.clone()));
        let backpressure = Arc::new(BackpressureController::new(
            config.max_concurrency,
            config.per_host_concurrency,
            circuit,
            limiter,
            clock.clone(),
        ));

        Ok(Self {
            index,
            storage,
            config,
            client,
            backpressure,
            subscribers: Arc::new(SubscriberSet::new()),
            pool: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            clock,
        })
    }

    /// Starts the worker pool, reclaiming orphaned processing entries
    /// first. Idempotent; a no-op while workers are already running.
    ///
    /// # Errors
    ///
    /// Fails with `ShuttingDown` after [`shutdown`](Self::shutdown), or
    /// with an index error when orphan recovery cannot reach the store.
    pub async fn start(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }

        let reclaimed = self.index.reclaim_processing(self.config.orphan_threshold).await?;
        if !reclaimed.is_empty() {
            warn!(count = reclaimed.len(), "requeued orphaned processing entries on startup");
        }

        self.spawn_workers().await;
        info!(worker_count = self.config.worker_count, "queue engine started");
        Ok(())
    }

    async fn spawn_workers(&self) {
        let mut pool_slot = self.pool.lock().await;
        if pool_slot.is_some() {
            return;
        }

        let cancellation_token = CancellationToken::new();
        let workers = (0..self.config.worker_count)
            .map(|worker_id| {
                Worker::new(
                    worker_id,
                    self.index.clone(),
                    self.storage.clone(),
                    self.client.clone(),
                    self.backpressure.clone(),
                    self.subscribers.clone(),
                    self.config.clone(),
                    cancellation_token.clone(),
                    self.clock.clone(),
                )
            })
            .collect();

        let mut pool = WorkerPool::new(workers, cancellation_token);
        pool.spawn_workers();
        *pool_slot = Some(pool);
    }

    /// Validates and admits a request: durable row first, then the
    /// index (pending queue, or scheduled set for future dispatch).
    ///
    /// # Errors
    ///
    /// `ShuttingDown` after shutdown, `Validation` for bad input,
    /// `Conflict` on a duplicate id, `Storage`/`Index` on store
    /// failures.
    pub async fn enqueue(&self, input: NewRequest) -> Result<EnqueueReceipt> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }

        validate_input(&input)?;

        let request = StoredRequest::from_new(input, self.clock.now_utc());
        self.storage.save_request(request.clone()).await?;

        let position = match request.status {
            RequestStatus::Scheduled => {
                let at = request.scheduled_for.unwrap_or_else(|| self.clock.now_utc());
                self.index.enqueue_scheduled(&request, at).await?;
                None
            },
            _ => Some(self.index.enqueue(&request).await?),
        };

        Ok(EnqueueReceipt { id: request.id, position })
    }

    /// Admits a batch in one durable transaction with a single batch
    /// notification.
    ///
    /// # Errors
    ///
    /// Same as [`enqueue`](Self::enqueue); a conflict anywhere rolls
    /// back the whole batch.
    pub async fn enqueue_many(&self, inputs: Vec<NewRequest>) -> Result<Vec<EnqueueReceipt>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }

        for input in &inputs {
            validate_input(input)?;
        }

        let now = self.clock.now_utc();
        let requests: Vec<StoredRequest> =
            inputs.into_iter().map(|input| StoredRequest::from_new(input, now)).collect();

        self.storage.save_request_batch(requests.clone()).await?;

        let (scheduled, pending): (Vec<_>, Vec<_>) =
            requests.iter().partition(|r| r.status == RequestStatus::Scheduled);

        if !pending.is_empty() {
            let pending: Vec<StoredRequest> = pending.into_iter().cloned().collect();
            self.index.enqueue_batch(&pending).await?;
        }
        for request in scheduled {
            let at = request.scheduled_for.unwrap_or(now);
            self.index.enqueue_scheduled(request, at).await?;
        }

        Ok(requests
            .into_iter()
            .map(|request| EnqueueReceipt { id: request.id, position: None })
            .collect())
    }

    /// Cancels a queued request. Observable only while the id is still
    /// pending or scheduled; an in-flight attempt is not preempted.
    ///
    /// # Errors
    ///
    /// Returns store errors; an unknown or already-running id yields
    /// `Ok(false)`.
    pub async fn cancel(&self, request_id: &RequestId) -> Result<bool> {
        let removed = self.index.cancel(request_id).await?;
        if !removed {
            return Ok(false);
        }

        self.storage.mark_cancelled(request_id.clone()).await?;
        info!(request_id = %request_id, "request cancelled");
        Ok(true)
    }

    /// Current state of a request, or `None` when unknown.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn get_status(&self, request_id: &RequestId) -> Result<Option<RequestState>> {
        Ok(self.storage.get_request(request_id.clone()).await?.map(|row| row.state()))
    }

    /// Aggregate queue statistics. `pending` merges the pending and
    /// scheduled statuses.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn get_stats(&self) -> Result<StoreStats> {
        Ok(self.storage.stats().await?)
    }

    /// Snapshot of the in-process backpressure counters.
    pub async fn backpressure_state(&self) -> BackpressureState {
        self.backpressure.state().await
    }

    /// Dead-letter requests for operator inspection, newest first.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn dead_letter_requests(&self, limit: i64) -> Result<Vec<StoredRequest>> {
        Ok(self.storage.find_dead(limit).await?)
    }

    /// Revives a dead request: attempts reset to zero, error cleared,
    /// and the request re-enters the priority queue.
    ///
    /// # Errors
    ///
    /// `NotFound` when the id does not exist or is not dead.
    pub async fn retry_dead_request(&self, request_id: &RequestId) -> Result<()> {
        let revived = self.storage.retry_dead(request_id.clone()).await?;
        self.index.enqueue(&revived).await?;
        info!(request_id = %request_id, "dead request requeued");
        Ok(())
    }

    /// Stops the worker pool without touching the index store.
    /// Notifications keep flowing; nothing is buffered. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a shutdown timeout error when workers do not stop in
    /// time.
    pub async fn pause(&self) -> Result<()> {
        let pool = self.pool.lock().await.take();
        if let Some(pool) = pool {
            pool.shutdown_graceful(self.config.shutdown_timeout).await?;
            info!("queue engine paused");
        }
        Ok(())
    }

    /// Restarts the worker pool after a pause. Workers self-heal missed
    /// notifications through the initial drain and the promotion tick.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Fails with `ShuttingDown` after [`shutdown`](Self::shutdown).
    pub async fn resume(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }

        self.spawn_workers().await;
        info!("queue engine resumed");
        Ok(())
    }

    /// Shuts the engine down: further enqueues fail with
    /// `ShuttingDown`, workers finish their in-flight requests.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a shutdown timeout error when workers do not stop in
    /// time.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("queue engine shutting down");
        self.pause().await
    }

    /// Registers a handler for successful completions.
    pub async fn on_complete(&self, handler: Arc<dyn EventHandler>) {
        self.subscribers.subscribe(EventKind::Complete, handler).await;
    }

    /// Registers a handler for attempt failures.
    pub async fn on_error(&self, handler: Arc<dyn EventHandler>) {
        self.subscribers.subscribe(EventKind::Error, handler).await;
    }

    /// Registers a handler for scheduled retries.
    pub async fn on_retry(&self, handler: Arc<dyn EventHandler>) {
        self.subscribers.subscribe(EventKind::Retry, handler).await;
    }

    /// Registers a handler for dead-letter transitions.
    pub async fn on_dead(&self, handler: Arc<dyn EventHandler>) {
        self.subscribers.subscribe(EventKind::Dead, handler).await;
    }
}

/// Validates enqueue input before admission.
fn validate_input(input: &NewRequest) -> Result<()> {
    if let Some(id) = &input.id {
        if id.is_empty() {
            return Err(QueueError::validation("request id must not be empty"));
        }
    }

    let url = url::Url::parse(&input.url)
        .map_err(|e| QueueError::validation(format!("invalid URL: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(QueueError::validation(format!(
            "unsupported URL scheme: {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(QueueError::validation("URL must have a host"));
    }

    if let Some(priority) = input.priority {
        if !(0..=100).contains(&priority) {
            return Err(QueueError::validation(format!(
                "priority must be in [0, 100], got {priority}"
            )));
        }
    }

    if let Some(max_retries) = input.max_retries {
        if max_retries < 0 {
            return Err(QueueError::validation("max_retries must be non-negative"));
        }
    }

    if let Some(timeout_ms) = input.timeout_ms {
        if timeout_ms < 0 {
            return Err(QueueError::validation("timeout_ms must be non-negative"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(url: &str) -> NewRequest {
        NewRequest::to_url(url)
    }

    #[test]
    fn valid_input_accepted() {
        assert!(validate_input(&input("https://api.example.com/v1/items")).is_ok());
        assert!(validate_input(&input("http://localhost:8080/hook")).is_ok());
    }

    #[test]
    fn malformed_urls_rejected() {
        assert!(validate_input(&input("not a url")).is_err());
        assert!(validate_input(&input("ftp://example.com/file")).is_err());
        assert!(validate_input(&input("unix:/var/run/socket")).is_err());
    }

    #[test]
    fn out_of_range_fields_rejected() {
        let bad_priority = NewRequest { priority: Some(101), ..input("https://example.com") };
        assert!(validate_input(&bad_priority).is_err());

        let negative_priority = NewRequest { priority: Some(-1), ..input("https://example.com") };
        assert!(validate_input(&negative_priority).is_err());

        let negative_retries =
            NewRequest { max_retries: Some(-1), ..input("https://example.com") };
        assert!(validate_input(&negative_retries).is_err());

        let negative_timeout =
            NewRequest { timeout_ms: Some(-1), ..input("https://example.com") };
        assert!(validate_input(&negative_timeout).is_err());
    }

    #[test]
    fn empty_id_rejected() {
        let empty = NewRequest { id: Some(String::new()), ..input("https://example.com") };
        assert!(validate_input(&empty).is_err());
    }
}
