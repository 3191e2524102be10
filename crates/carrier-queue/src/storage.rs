//! Durable-store abstraction used by the engine and workers.
//!
//! Trait-based seam over the system of record so dispatch logic is
//! testable without a database. Production uses
//! [`PostgresQueueStorage`] over `carrier_core::storage::Storage`;
//! tests use [`mock::MockQueueStorage`].

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};

use carrier_core::{
    error::{CoreError, Result},
    models::{AttemptOutcome, AttemptRecord, RequestId, ResponseSummary, StoreStats, StoredRequest},
};

/// Durable-store operations required by the dispatch engine.
pub trait QueueStorage: Send + Sync + 'static {
    /// Inserts a new request row; conflicts on duplicate id.
    fn save_request(
        &self,
        request: StoredRequest,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Inserts a batch of rows as one transaction.
    fn save_request_batch(
        &self,
        requests: Vec<StoredRequest>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Loads a request row by id.
    fn get_request(
        &self,
        request_id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<StoredRequest>>> + Send + '_>>;

    /// Transitions a request to `processing` as an attempt starts.
    fn mark_processing(
        &self,
        request_id: RequestId,
        attempts: i32,
        last_attempt_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Returns a failed request to `pending` with its retry schedule.
    fn mark_retrying(
        &self,
        request_id: RequestId,
        next_retry_at: DateTime<Utc>,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Marks a request `completed`. Returns false when the transition
    /// was refused because the row is no longer `processing` (for
    /// example, cancelled mid-flight).
    fn mark_completed(
        &self,
        request_id: RequestId,
        response: ResponseSummary,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Marks a request `dead` with its final error.
    fn mark_dead(
        &self,
        request_id: RequestId,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Marks a queued request `cancelled`; returns whether a row moved.
    fn mark_cancelled(
        &self,
        request_id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Appends one attempt record.
    fn log_attempt(
        &self,
        request_id: RequestId,
        attempt_number: i32,
        outcome: AttemptOutcome,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// All attempts for a request, ordered by attempt number.
    fn find_attempts(
        &self,
        request_id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<AttemptRecord>>> + Send + '_>>;

    /// Revives a dead request and returns the refreshed row.
    fn retry_dead(
        &self,
        request_id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<StoredRequest>> + Send + '_>>;

    /// Dead-letter rows, most recently dead first.
    fn find_dead(
        &self,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredRequest>>> + Send + '_>>;

    /// Aggregate store statistics.
    fn stats(&self) -> Pin<Box<dyn Future<Output = Result<StoreStats>> + Send + '_>>;
}

/// Production storage implementation over PostgreSQL repositories.
pub struct PostgresQueueStorage {
    storage: Arc<carrier_core::storage::Storage>,
}

impl PostgresQueueStorage {
    /// Creates a PostgreSQL storage adapter.
    pub fn new(storage: Arc<carrier_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl QueueStorage for PostgresQueueStorage {
    fn save_request(
        &self,
        request: StoredRequest,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.requests.create(&request).await })
    }

    fn save_request_batch(
        &self,
        requests: Vec<StoredRequest>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.requests.create_batch(&requests).await })
    }

    fn get_request(
        &self,
        request_id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<StoredRequest>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.requests.find_by_id(&request_id).await })
    }

    fn mark_processing(
        &self,
        request_id: RequestId,
        attempts: i32,
        last_attempt_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.requests.mark_processing(&request_id, attempts, last_attempt_at).await
        })
    }

    fn mark_retrying(
        &self,
        request_id: RequestId,
        next_retry_at: DateTime<Utc>,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.requests.mark_retrying(&request_id, next_retry_at, &error).await
        })
    }

    fn mark_completed(
        &self,
        request_id: RequestId,
        response: ResponseSummary,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.requests.mark_completed(&request_id, &response).await })
    }

    fn mark_dead(
        &self,
        request_id: RequestId,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.requests.mark_dead(&request_id, &error).await })
    }

    fn mark_cancelled(
        &self,
        request_id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.requests.mark_cancelled(&request_id).await })
    }

    fn log_attempt(
        &self,
        request_id: RequestId,
        attempt_number: i32,
        outcome: AttemptOutcome,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.attempts.log(&request_id, attempt_number, &outcome).await.map(|_| ())
        })
    }

    fn find_attempts(
        &self,
        request_id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<AttemptRecord>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.attempts.find_by_request(&request_id).await })
    }

    fn retry_dead(
        &self,
        request_id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<StoredRequest>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.retry_dead(&request_id).await })
    }

    fn find_dead(
        &self,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredRequest>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.requests.find_dead(limit).await })
    }

    fn stats(&self) -> Pin<Box<dyn Future<Output = Result<StoreStats>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.stats().await })
    }
}

pub mod mock {
    //! In-memory storage double for engine and worker tests.

    use std::collections::HashMap;

    use chrono::Utc;
    use tokio::sync::RwLock;
    use uuid::Uuid;

    use carrier_core::models::RequestStatus;

    use super::{
        AttemptOutcome, AttemptRecord, CoreError, DateTime, Future, Pin, QueueStorage, RequestId,
        Result, ResponseSummary, StoreStats, StoredRequest,
    };

    /// Mock storage holding everything in memory.
    ///
    /// Supports injecting one-shot failures to exercise the worker's
    /// engine-fault handling: save failures hit the next insert, while
    /// transition failures hit the next status change.
    #[derive(Default)]
    pub struct MockQueueStorage {
        requests: RwLock<HashMap<RequestId, StoredRequest>>,
        attempts: RwLock<Vec<AttemptRecord>>,
        fail_next_save: RwLock<Option<String>>,
        fail_next_transition: RwLock<Option<String>>,
    }

    impl MockQueueStorage {
        /// Creates an empty mock.
        pub fn new() -> Self {
            Self::default()
        }

        /// Seeds a request row directly.
        pub async fn insert(&self, request: StoredRequest) {
            self.requests.write().await.insert(request.id.clone(), request);
        }

        /// Reads back a request row.
        pub async fn request(&self, request_id: &RequestId) -> Option<StoredRequest> {
            self.requests.read().await.get(request_id).cloned()
        }

        /// Attempt rows recorded for a request.
        pub async fn attempts_for(&self, request_id: &RequestId) -> Vec<AttemptRecord> {
            self.attempts
                .read()
                .await
                .iter()
                .filter(|a| &a.request_id == request_id)
                .cloned()
                .collect()
        }

        /// Injects one database failure for the next insert.
        pub async fn fail_next_save(&self, message: impl Into<String>) {
            *self.fail_next_save.write().await = Some(message.into());
        }

        /// Injects one database failure for the next status transition.
        pub async fn fail_next_transition(&self, message: impl Into<String>) {
            *self.fail_next_transition.write().await = Some(message.into());
        }

        /// Whether a request reached the expected status.
        pub async fn has_status(&self, request_id: &RequestId, expected: RequestStatus) -> bool {
            self.requests.read().await.get(request_id).is_some_and(|r| r.status == expected)
        }

        async fn take_save_failure(&self) -> Result<()> {
            if let Some(message) = self.fail_next_save.write().await.take() {
                return Err(CoreError::Database(message));
            }
            Ok(())
        }

        async fn take_transition_failure(&self) -> Result<()> {
            if let Some(message) = self.fail_next_transition.write().await.take() {
                return Err(CoreError::Database(message));
            }
            Ok(())
        }
    }

    impl QueueStorage for MockQueueStorage {
        fn save_request(
            &self,
            request: StoredRequest,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.take_save_failure().await?;
                let mut requests = self.requests.write().await;
                if requests.contains_key(&request.id) {
                    return Err(CoreError::Conflict(request.id.to_string()));
                }
                requests.insert(request.id.clone(), request);
                Ok(())
            })
        }

        fn save_request_batch(
            &self,
            batch: Vec<StoredRequest>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.take_save_failure().await?;
                let mut requests = self.requests.write().await;
                for request in &batch {
                    if requests.contains_key(&request.id) {
                        return Err(CoreError::Conflict(request.id.to_string()));
                    }
                }
                for request in batch {
                    requests.insert(request.id.clone(), request);
                }
                Ok(())
            })
        }

        fn get_request(
            &self,
            request_id: RequestId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<StoredRequest>>> + Send + '_>> {
            Box::pin(async move { Ok(self.requests.read().await.get(&request_id).cloned()) })
        }

        fn mark_processing(
            &self,
            request_id: RequestId,
            attempts: i32,
            last_attempt_at: DateTime<chrono::Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.take_transition_failure().await?;
                if let Some(request) = self.requests.write().await.get_mut(&request_id) {
                    request.status = RequestStatus::Processing;
                    request.attempts = request.attempts.max(attempts);
                    request.last_attempt_at = Some(last_attempt_at);
                    request.updated_at = Utc::now();
                }
                Ok(())
            })
        }

        fn mark_retrying(
            &self,
            request_id: RequestId,
            next_retry_at: DateTime<chrono::Utc>,
            error: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.take_transition_failure().await?;
                if let Some(request) = self.requests.write().await.get_mut(&request_id) {
                    request.status = RequestStatus::Pending;
                    request.next_retry_at = Some(next_retry_at);
                    request.error = Some(error);
                    request.updated_at = Utc::now();
                }
                Ok(())
            })
        }

        fn mark_completed(
            &self,
            request_id: RequestId,
            response: ResponseSummary,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            Box::pin(async move {
                self.take_transition_failure().await?;
                let mut requests = self.requests.write().await;
                let Some(request) = requests.get_mut(&request_id) else {
                    return Ok(false);
                };
                if request.status != RequestStatus::Processing {
                    return Ok(false);
                }
                request.status = RequestStatus::Completed;
                request.completed_at = Some(Utc::now());
                request.response = Some(sqlx_json(response));
                request.error = None;
                request.next_retry_at = None;
                request.updated_at = Utc::now();
                Ok(true)
            })
        }

        fn mark_dead(
            &self,
            request_id: RequestId,
            error: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.take_transition_failure().await?;
                if let Some(request) = self.requests.write().await.get_mut(&request_id) {
                    request.status = RequestStatus::Dead;
                    request.error = Some(error);
                    request.next_retry_at = None;
                    request.updated_at = Utc::now();
                }
                Ok(())
            })
        }

        fn mark_cancelled(
            &self,
            request_id: RequestId,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            Box::pin(async move {
                self.take_transition_failure().await?;
                let mut requests = self.requests.write().await;
                let Some(request) = requests.get_mut(&request_id) else {
                    return Ok(false);
                };
                if !matches!(request.status, RequestStatus::Pending | RequestStatus::Scheduled) {
                    return Ok(false);
                }
                request.status = RequestStatus::Cancelled;
                request.updated_at = Utc::now();
                Ok(true)
            })
        }

        fn log_attempt(
            &self,
            request_id: RequestId,
            attempt_number: i32,
            outcome: AttemptOutcome,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.attempts.write().await.push(AttemptRecord {
                    id: Uuid::new_v4(),
                    request_id,
                    attempt_number,
                    status_code: outcome.status_code.map(i32::from),
                    duration_ms: outcome.duration_ms,
                    error: outcome.error,
                    response_headers: outcome.response_headers.map(sqlx_json),
                    created_at: Utc::now(),
                });
                Ok(())
            })
        }

        fn find_attempts(
            &self,
            request_id: RequestId,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<AttemptRecord>>> + Send + '_>> {
            Box::pin(async move { Ok(self.attempts_for(&request_id).await) })
        }

        fn retry_dead(
            &self,
            request_id: RequestId,
        ) -> Pin<Box<dyn Future<Output = Result<StoredRequest>> + Send + '_>> {
            Box::pin(async move {
                self.take_transition_failure().await?;
                let mut requests = self.requests.write().await;
                let Some(request) = requests.get_mut(&request_id) else {
                    return Err(CoreError::NotFound(request_id.to_string()));
                };
                if request.status != RequestStatus::Dead {
                    return Err(CoreError::NotFound(format!("{request_id} is not dead")));
                }
                request.status = RequestStatus::Pending;
                request.attempts = 0;
                request.error = None;
                request.next_retry_at = None;
                request.updated_at = Utc::now();
                let revived = request.clone();
                drop(requests);

                self.attempts.write().await.retain(|a| a.request_id != request_id);
                Ok(revived)
            })
        }

        fn find_dead(
            &self,
            limit: i64,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredRequest>>> + Send + '_>> {
            Box::pin(async move {
                let mut dead: Vec<StoredRequest> = self
                    .requests
                    .read()
                    .await
                    .values()
                    .filter(|r| r.status == RequestStatus::Dead)
                    .cloned()
                    .collect();
                dead.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
                dead.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
                Ok(dead)
            })
        }

        fn stats(&self) -> Pin<Box<dyn Future<Output = Result<StoreStats>> + Send + '_>> {
            Box::pin(async move {
                let requests = self.requests.read().await;
                let mut stats = StoreStats::default();
                for request in requests.values() {
                    match request.status {
                        RequestStatus::Pending | RequestStatus::Scheduled => stats.pending += 1,
                        RequestStatus::Processing => stats.processing += 1,
                        RequestStatus::Completed => stats.completed += 1,
                        RequestStatus::Failed => stats.failed += 1,
                        RequestStatus::Dead => stats.dead += 1,
                        RequestStatus::Cancelled => stats.cancelled += 1,
                    }
                }
                drop(requests);

                let attempts = self.attempts.read().await;
                if !attempts.is_empty() {
                    #[allow(clippy::cast_precision_loss)]
                    let total: f64 = attempts.iter().map(|a| a.duration_ms as f64).sum();
                    stats.avg_processing_ms = total / attempts.len() as f64;
                }

                let outcomes = stats.completed + stats.failed + stats.dead;
                if outcomes > 0 {
                    #[allow(clippy::cast_precision_loss)]
                    {
                        stats.success_rate = stats.completed as f64 / outcomes as f64;
                    }
                }

                Ok(stats)
            })
        }
    }

    fn sqlx_json<T>(value: T) -> sqlx::types::Json<T> {
        sqlx::types::Json(value)
    }
}

#[cfg(test)]
mod tests {
    use carrier_core::models::NewRequest;
    use chrono::Utc;

    use super::{mock::MockQueueStorage, *};

    fn request(id: &str) -> StoredRequest {
        StoredRequest::from_new(
            NewRequest { id: Some(id.to_string()), ..NewRequest::to_url("https://example.com") },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn duplicate_save_conflicts() {
        let storage = MockQueueStorage::new();
        storage.save_request(request("dup")).await.unwrap();

        let err = storage.save_request(request("dup")).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn completed_transition_requires_processing() {
        let storage = MockQueueStorage::new();
        storage.save_request(request("req")).await.unwrap();

        let summary = ResponseSummary {
            status_code: 200,
            headers: Default::default(),
            body: None,
            duration_ms: 5,
        };

        // Still pending: transition refused.
        assert!(!storage.mark_completed(RequestId::from("req"), summary.clone()).await.unwrap());

        storage.mark_processing(RequestId::from("req"), 1, Utc::now()).await.unwrap();
        assert!(storage.mark_completed(RequestId::from("req"), summary).await.unwrap());
    }

    #[tokio::test]
    async fn retry_dead_resets_counters_and_attempts() {
        let storage = MockQueueStorage::new();
        storage.save_request(request("req")).await.unwrap();
        storage.mark_processing(RequestId::from("req"), 1, Utc::now()).await.unwrap();
        storage
            .log_attempt(RequestId::from("req"), 1, AttemptOutcome::default())
            .await
            .unwrap();
        storage.mark_dead(RequestId::from("req"), "HTTP 503".to_string()).await.unwrap();

        let revived = storage.retry_dead(RequestId::from("req")).await.unwrap();
        assert_eq!(revived.attempts, 0);
        assert!(revived.error.is_none());
        assert!(revived.next_retry_at.is_none());
        assert!(storage.find_attempts(RequestId::from("req")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_dead_requires_dead_status() {
        let storage = MockQueueStorage::new();
        storage.save_request(request("req")).await.unwrap();

        assert!(storage.retry_dead(RequestId::from("req")).await.is_err());
    }
}
