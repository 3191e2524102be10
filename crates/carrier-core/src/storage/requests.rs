//! Repository for request rows and their state transitions.
//!
//! Handles admission, atomic status transitions, dead-letter revival,
//! and the aggregate queries behind engine statistics. Transitions that
//! gate on the current status return whether a row was affected so
//! callers can detect lost races (for example a cancel landing while an
//! attempt is in flight).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{RequestId, RequestStatus, ResponseSummary, StatusPatch, StoredRequest},
};

const REQUEST_COLUMNS: &str = "id, url, method, headers, body, priority, max_retries, \
     timeout_ms, scheduled_for, metadata, status, attempts, last_attempt_at, next_retry_at, \
     completed_at, error, response, created_at, updated_at";

/// Per-status row counts used to build [`crate::models::StoreStats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusCounts {
    /// Rows in `pending`.
    pub pending: i64,
    /// Rows in `scheduled`.
    pub scheduled: i64,
    /// Rows in `processing`.
    pub processing: i64,
    /// Rows in `completed`.
    pub completed: i64,
    /// Rows in `failed`.
    pub failed: i64,
    /// Rows in `dead`.
    pub dead: i64,
    /// Rows in `cancelled`.
    pub cancelled: i64,
}

/// Repository for request database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a new request row.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if a row with the same id already exists.
    pub async fn create(&self, request: &StoredRequest) -> Result<()> {
        self.create_impl(&*self.pool, request).await
    }

    /// Inserts a new request row within a transaction.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if a row with the same id already exists.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        request: &StoredRequest,
    ) -> Result<()> {
        self.create_impl(&mut **tx, request).await
    }

    /// Inserts a batch of request rows as one serializable unit of work.
    ///
    /// Either every row lands or none does.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` on the first duplicate id; the whole batch is
    /// rolled back.
    pub async fn create_batch(&self, requests: &[StoredRequest]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for request in requests {
            self.create_impl(&mut *tx, request).await?;
        }

        tx.commit().await?;

        Ok(())
    }

    async fn create_impl<'e, E>(&self, executor: E, request: &StoredRequest) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO requests (
                id, url, method, headers, body, priority, max_retries, timeout_ms,
                scheduled_for, metadata, status, attempts, last_attempt_at, next_retry_at,
                completed_at, error, response, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19
            )
            "#,
        )
        .bind(&request.id)
        .bind(&request.url)
        .bind(request.method)
        .bind(&request.headers)
        .bind(&request.body)
        .bind(request.priority)
        .bind(request.max_retries)
        .bind(request.timeout_ms)
        .bind(request.scheduled_for)
        .bind(&request.metadata)
        .bind(request.status)
        .bind(request.attempts)
        .bind(request.last_attempt_at)
        .bind(request.next_retry_at)
        .bind(request.completed_at)
        .bind(&request.error)
        .bind(&request.response)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Finds a request by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, request_id: &RequestId) -> Result<Option<StoredRequest>> {
        let request = sqlx::query_as::<_, StoredRequest>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE id = $1"
        ))
        .bind(request_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(request)
    }

    /// Atomic partial update alongside a status transition.
    ///
    /// Unset patch fields keep their stored value; `attempts` is clamped
    /// with `GREATEST` so it can never regress. `updated_at` refreshes on
    /// every change.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update_status(
        &self,
        request_id: &RequestId,
        status: RequestStatus,
        patch: &StatusPatch,
    ) -> Result<bool> {
        let response = patch.response.as_ref().map(|r| sqlx::types::Json(r.clone()));

        let result = sqlx::query(
            r#"
            UPDATE requests
            SET status = $2,
                attempts = GREATEST(attempts, COALESCE($3, attempts)),
                last_attempt_at = COALESCE($4, last_attempt_at),
                next_retry_at = COALESCE($5, next_retry_at),
                completed_at = COALESCE($6, completed_at),
                error = COALESCE($7, error),
                response = COALESCE($8, response),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(request_id)
        .bind(status)
        .bind(patch.attempts)
        .bind(patch.last_attempt_at)
        .bind(patch.next_retry_at)
        .bind(patch.completed_at)
        .bind(&patch.error)
        .bind(&response)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Transitions a request to `processing` as an attempt starts.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_processing(
        &self,
        request_id: &RequestId,
        attempts: i32,
        last_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE requests
            SET status = 'processing',
                attempts = GREATEST(attempts, $2),
                last_attempt_at = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(request_id)
        .bind(attempts)
        .bind(last_attempt_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Returns a failed request to `pending` with its retry schedule.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_retrying(
        &self,
        request_id: &RequestId,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE requests
            SET status = 'pending',
                next_retry_at = $2,
                error = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(request_id)
        .bind(next_retry_at)
        .bind(error)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks a request `completed` with its response summary.
    ///
    /// Gated on the row still being in `processing`, so a success that
    /// lands after an operator cancel does not overwrite the terminal
    /// `cancelled` state. Returns whether the transition happened.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_completed(
        &self,
        request_id: &RequestId,
        response: &ResponseSummary,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE requests
            SET status = 'completed',
                completed_at = NOW(),
                response = $2,
                error = NULL,
                next_retry_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(request_id)
        .bind(sqlx::types::Json(response))
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Marks a request `dead` after retries are exhausted.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_dead(&self, request_id: &RequestId, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE requests
            SET status = 'dead',
                error = $2,
                next_retry_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(request_id)
        .bind(error)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks a request `cancelled` if it has not started executing.
    ///
    /// Returns whether a row was affected.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_cancelled(&self, request_id: &RequestId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE requests
            SET status = 'cancelled', updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'scheduled')
            "#,
        )
        .bind(request_id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Revives a dead request within a transaction: back to `pending`
    /// with `attempts = 0` and cleared error/retry fields.
    ///
    /// Returns the updated row, or `None` when the id is missing or not
    /// dead.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn retry_dead_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        request_id: &RequestId,
    ) -> Result<Option<StoredRequest>> {
        let request = sqlx::query_as::<_, StoredRequest>(&format!(
            r#"
            UPDATE requests
            SET status = 'pending',
                attempts = 0,
                error = NULL,
                next_retry_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'dead'
            RETURNING {REQUEST_COLUMNS}
            "#
        ))
        .bind(request_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(request)
    }

    /// Lists requests, newest first, optionally filtered by status and by
    /// a host substring of the URL.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_status(
        &self,
        status: Option<RequestStatus>,
        host_like: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StoredRequest>> {
        let requests = sqlx::query_as::<_, StoredRequest>(&format!(
            r#"
            SELECT {REQUEST_COLUMNS}
            FROM requests
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR url LIKE '%' || $2 || '%')
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(status.map(|s| s.to_string()))
        .bind(host_like)
        .bind(limit)
        .bind(offset)
        .fetch_all(&*self.pool)
        .await?;

        Ok(requests)
    }

    /// Lists dead-letter requests, most recently dead first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_dead(&self, limit: i64) -> Result<Vec<StoredRequest>> {
        let requests = sqlx::query_as::<_, StoredRequest>(&format!(
            r#"
            SELECT {REQUEST_COLUMNS}
            FROM requests
            WHERE status = 'dead'
            ORDER BY updated_at DESC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(requests)
    }

    /// Per-status row counts in a single scan.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn status_counts(&self) -> Result<StatusCounts> {
        let row: (i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending'),
                COUNT(*) FILTER (WHERE status = 'scheduled'),
                COUNT(*) FILTER (WHERE status = 'processing'),
                COUNT(*) FILTER (WHERE status = 'completed'),
                COUNT(*) FILTER (WHERE status = 'failed'),
                COUNT(*) FILTER (WHERE status = 'dead'),
                COUNT(*) FILTER (WHERE status = 'cancelled')
            FROM requests
            "#,
        )
        .fetch_one(&*self.pool)
        .await?;

        Ok(StatusCounts {
            pending: row.0,
            scheduled: row.1,
            processing: row.2,
            completed: row.3,
            failed: row.4,
            dead: row.5,
            cancelled: row.6,
        })
    }

    /// Removes completed requests older than `days`. Attempt rows cascade.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn cleanup_completed(&self, days: i32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM requests
            WHERE status = 'completed'
              AND completed_at < NOW() - make_interval(days => $1)
            "#,
        )
        .bind(days)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Removes dead requests older than `days`. Attempt rows cascade.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn cleanup_dead(&self, days: i32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM requests
            WHERE status = 'dead'
              AND updated_at < NOW() - make_interval(days => $1)
            "#,
        )
        .bind(days)
        .execute(&*self.pool)
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
