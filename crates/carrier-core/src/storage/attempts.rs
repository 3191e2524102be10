//! Repository for the append-only attempt log.
//!
//! Attempt rows are immutable audit records; they are only removed when
//! their parent request is deleted (cascade) or revived from the dead
//! letter set.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{AttemptOutcome, AttemptRecord, RequestId},
};

/// Repository for attempt database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Appends one attempt record.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if this attempt number was already logged for
    /// the request.
    pub async fn log(
        &self,
        request_id: &RequestId,
        attempt_number: i32,
        outcome: &AttemptOutcome,
    ) -> Result<Uuid> {
        let response_headers =
            outcome.response_headers.as_ref().map(|h| sqlx::types::Json(h.clone()));

        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO request_attempts (
                id, request_id, attempt_number, status_code, duration_ms, error,
                response_headers, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request_id)
        .bind(attempt_number)
        .bind(outcome.status_code.map(i32::from))
        .bind(outcome.duration_ms)
        .bind(&outcome.error)
        .bind(&response_headers)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// All attempts for a request, ordered by attempt number.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_request(&self, request_id: &RequestId) -> Result<Vec<AttemptRecord>> {
        let attempts = sqlx::query_as::<_, AttemptRecord>(
            r#"
            SELECT id, request_id, attempt_number, status_code, duration_ms, error,
                   response_headers, created_at
            FROM request_attempts
            WHERE request_id = $1
            ORDER BY attempt_number ASC
            "#,
        )
        .bind(request_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }

    /// Count of attempts logged for a request.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_for_request(&self, request_id: &RequestId) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM request_attempts WHERE request_id = $1")
                .bind(request_id)
                .fetch_one(&*self.pool)
                .await?;

        Ok(count.0)
    }

    /// Mean attempt duration in milliseconds over all recorded attempts.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn mean_duration_ms(&self) -> Result<f64> {
        let avg: (Option<f64>,) =
            sqlx::query_as("SELECT AVG(duration_ms)::float8 FROM request_attempts")
                .fetch_one(&*self.pool)
                .await?;

        Ok(avg.0.unwrap_or(0.0))
    }

    /// Removes all attempt rows for a request within a transaction.
    ///
    /// Used by dead-letter revival so attempt numbering restarts at 1.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete_for_request_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        request_id: &RequestId,
    ) -> Result<u64> {
        let result = sqlx::query("DELETE FROM request_attempts WHERE request_id = $1")
            .bind(request_id)
            .execute(&mut **tx)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _repo = Repository::new(Arc::new(pool));
    }
}
