//! Background-job repository implementation.
//!
//! The claim query is the sole synchronization primitive of the worker
//! pool: a single `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP
//! LOCKED LIMIT 1)` statement lets concurrent workers each take a
//! different row without blocking on each other, and a stale `fetched_at`
//! (older than the visibility timeout) makes an abandoned claim eligible
//! again.

use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use conveyor_core::error::{AppError, ErrorKind};
use conveyor_core::result::AppResult;
use conveyor_entity::background_job::BackgroundJob;

/// Repository for the transient worker-pool claim table.
#[derive(Debug, Clone)]
pub struct BackgroundJobRepository {
    pool: PgPool,
}

impl BackgroundJobRepository {
    /// Create a new background-job repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a unit of work for an execution record.
    pub async fn enqueue(
        &self,
        metadata_id: Uuid,
        input_kind: Option<&str>,
        input: Option<&Value>,
    ) -> AppResult<BackgroundJob> {
        sqlx::query_as::<_, BackgroundJob>(
            "INSERT INTO background_job (metadata_id, input_kind, input) \
             VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(metadata_id)
        .bind(input_kind)
        .bind(input)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to enqueue job", e))
    }

    /// Enqueue a unit of work inside an existing transaction, so the
    /// dispatcher can commit it atomically with the execution record.
    pub async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        metadata_id: Uuid,
        input_kind: Option<&str>,
        input: Option<&Value>,
    ) -> AppResult<BackgroundJob> {
        sqlx::query_as::<_, BackgroundJob>(
            "INSERT INTO background_job (metadata_id, input_kind, input) \
             VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(metadata_id)
        .bind(input_kind)
        .bind(input)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to enqueue job", e))
    }

    /// Atomically claim the oldest claimable row, stamping `fetched_at`.
    ///
    /// A row is claimable when it was never fetched or its claim is older
    /// than `visibility_timeout_seconds`. Returns `None` when nothing is
    /// claimable.
    pub async fn claim_next(
        &self,
        visibility_timeout_seconds: u64,
    ) -> AppResult<Option<BackgroundJob>> {
        sqlx::query_as::<_, BackgroundJob>(
            "UPDATE background_job SET fetched_at = NOW() \
             WHERE id = ( \
                SELECT id FROM background_job \
                WHERE fetched_at IS NULL \
                   OR fetched_at < NOW() - make_interval(secs => $1) \
                ORDER BY created_at ASC \
                FOR UPDATE SKIP LOCKED \
                LIMIT 1 \
             ) RETURNING *",
        )
        .bind(visibility_timeout_seconds as f64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to claim job", e))
    }

    /// Delete a job row after execution. Returns whether the row was
    /// still present.
    pub async fn delete(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM background_job WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to delete job", e))?;
        Ok(result.rows_affected() > 0)
    }

    /// Count rows awaiting a worker (unclaimed or stale-claimed).
    pub async fn depth(&self, visibility_timeout_seconds: u64) -> AppResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM background_job \
             WHERE fetched_at IS NULL OR fetched_at < NOW() - make_interval(secs => $1)",
        )
        .bind(visibility_timeout_seconds as f64)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to count jobs", e))
    }
}
