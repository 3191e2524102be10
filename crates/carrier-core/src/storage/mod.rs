//! Database access layer implementing the repository pattern for request
//! persistence.
//!
//! The repository layer acts as an anti-corruption layer, translating
//! between domain models and database schemas. All database operations go
//! through these repositories; direct SQL outside this module is
//! forbidden to maintain consistency.

use std::sync::Arc;

use sqlx::PgPool;

pub mod attempts;
pub mod requests;

use crate::{
    error::{CoreError, Result},
    models::{RequestId, StoreStats, StoredRequest},
};

/// Container for all repository instances providing unified database
/// access.
///
/// Entry point for durable-store operations. Shares one connection pool
/// across repositories.
#[derive(Clone)]
pub struct Storage {
    /// Repository for request rows and their state transitions.
    pub requests: Arc<requests::Repository>,

    /// Repository for the append-only attempt log.
    pub attempts: Arc<attempts::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            requests: Arc::new(requests::Repository::new(pool.clone())),
            attempts: Arc::new(attempts::Repository::new(pool)),
        }
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.requests.pool()).await?;

        Ok(())
    }

    /// Aggregate statistics: per-status counts, mean attempt duration,
    /// and success rate (`completed / (completed + failed + dead)`).
    ///
    /// # Errors
    ///
    /// Returns error if either aggregate query fails.
    pub async fn stats(&self) -> Result<StoreStats> {
        let counts = self.requests.status_counts().await?;
        let avg_processing_ms = self.attempts.mean_duration_ms().await?;

        let outcomes = counts.completed + counts.failed + counts.dead;
        #[allow(clippy::cast_precision_loss)]
        let success_rate =
            if outcomes == 0 { 0.0 } else { counts.completed as f64 / outcomes as f64 };

        Ok(StoreStats {
            pending: counts.pending + counts.scheduled,
            processing: counts.processing,
            completed: counts.completed,
            failed: counts.failed,
            dead: counts.dead,
            cancelled: counts.cancelled,
            avg_processing_ms,
            success_rate,
        })
    }

    /// Revives a dead request: resets it to `pending` with zeroed
    /// attempts and cleared error, and drops its prior attempt rows so
    /// the next execution logs attempt 1 again.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the id does not exist or is not dead.
    pub async fn retry_dead(&self, request_id: &RequestId) -> Result<StoredRequest> {
        let mut tx = self.requests.pool().begin().await?;

        let request = self
            .requests
            .retry_dead_in_tx(&mut tx, request_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("dead request {request_id} not found")))?;

        self.attempts.delete_for_request_in_tx(&mut tx, request_id).await?;

        tx.commit().await?;

        Ok(request)
    }
}
