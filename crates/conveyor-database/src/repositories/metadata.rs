//! Metadata (execution record) repository implementation.
//!
//! State transitions are guarded in SQL: each update names the state it
//! expects, so a record that already moved on is left untouched and the
//! caller observes `None` / zero rows instead of clobbering history.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use conveyor_core::error::{AppError, ErrorKind};
use conveyor_core::result::AppResult;
use conveyor_entity::metadata::model::{Metadata, NewMetadata};

/// Repository for execution-record CRUD and state transitions.
#[derive(Debug, Clone)]
pub struct MetadataRepository {
    pool: PgPool,
}

impl MetadataRepository {
    /// Create a new metadata repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Find an execution record by ID.
    pub async fn find_by_id(&self, id: Uuid) -> AppResult<Option<Metadata>> {
        sqlx::query_as::<_, Metadata>("SELECT * FROM metadata WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to find metadata", e))
    }

    /// Create a new execution record in `Pending` state.
    pub async fn create(&self, data: &NewMetadata) -> AppResult<Metadata> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to begin transaction", e)
        })?;
        let created = self.create_in_tx(&mut tx, data).await?;
        tx.commit().await.map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to commit transaction", e)
        })?;
        Ok(created)
    }

    /// Create a new execution record inside an existing transaction.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        data: &NewMetadata,
    ) -> AppResult<Metadata> {
        sqlx::query_as::<_, Metadata>(
            "INSERT INTO metadata (external_id, name, manifest_id, parent_id, input, scheduled_at) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
        )
        .bind(&data.external_id)
        .bind(&data.name)
        .bind(data.manifest_id)
        .bind(data.parent_id)
        .bind(&data.input)
        .bind(data.scheduled_at)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to create metadata", e))
    }

    /// Transition `Pending → InProgress`, recording the start time.
    ///
    /// Returns `None` when the record is not pending, which deduplicates
    /// at-least-once deliveries from the task server.
    pub async fn mark_in_progress(&self, id: Uuid) -> AppResult<Option<Metadata>> {
        sqlx::query_as::<_, Metadata>(
            "UPDATE metadata SET workflow_state = 'in_progress', started_at = NOW() \
             WHERE id = $1 AND workflow_state = 'pending' RETURNING *",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to start metadata", e))
    }

    /// Transition `InProgress → Completed` with the workflow output.
    ///
    /// Returns whether a row actually transitioned. A record that
    /// already left `in_progress` (another node's startup recovery, for
    /// example) is left untouched and the caller must not treat the run
    /// as successful.
    pub async fn complete(&self, id: Uuid, output: Option<&serde_json::Value>) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE metadata SET workflow_state = 'completed', output = $2, \
                finished_at = NOW(), current_step = NULL, step_started_at = NULL \
             WHERE id = $1 AND workflow_state = 'in_progress'",
        )
        .bind(id)
        .bind(output)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to complete metadata", e))?;
        Ok(result.rows_affected() > 0)
    }

    /// Transition `InProgress → Failed` with failure details.
    pub async fn fail(
        &self,
        id: Uuid,
        step: Option<&str>,
        reason: &str,
        details: Option<&str>,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE metadata SET workflow_state = 'failed', failure_step = $2, \
                failure_reason = $3, failure_details = $4, finished_at = NOW() \
             WHERE id = $1 AND workflow_state = 'in_progress'",
        )
        .bind(id)
        .bind(step)
        .bind(reason)
        .bind(details)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to fail metadata", e))?;
        Ok(())
    }

    /// Record the step currently executing, for progress tracking.
    pub async fn update_progress(&self, id: Uuid, step: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE metadata SET current_step = $2, step_started_at = NOW() \
             WHERE id = $1 AND workflow_state = 'in_progress'",
        )
        .bind(id)
        .bind(step)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to update progress", e))?;
        Ok(())
    }

    /// Set the persisted cancellation flag. Returns whether a live
    /// (pending or in-progress) record was flagged.
    pub async fn request_cancellation(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE metadata SET cancellation_requested = TRUE \
             WHERE id = $1 AND workflow_state IN ('pending', 'in_progress')",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to request cancellation", e)
        })?;
        Ok(result.rows_affected() > 0)
    }

    /// Read the persisted cancellation flag.
    pub async fn cancellation_requested(&self, id: Uuid) -> AppResult<bool> {
        sqlx::query_scalar::<_, bool>("SELECT cancellation_requested FROM metadata WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map(|flag| flag.unwrap_or(false))
            .map_err(|e| {
                AppError::with_source(ErrorKind::Database, "Failed to read cancellation flag", e)
            })
    }

    /// Fail every execution left `InProgress` from before the given
    /// instant. Used by startup recovery; returns the number of records
    /// failed. The SQL applies [`Metadata::is_orphaned`] as a set-wide
    /// update.
    pub async fn fail_orphaned(&self, before: DateTime<Utc>, reason: &str) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE metadata SET workflow_state = 'failed', failure_reason = $2, \
                finished_at = NOW() \
             WHERE workflow_state = 'in_progress' AND started_at < $1",
        )
        .bind(before)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to fail orphaned metadata", e)
        })?;
        Ok(result.rows_affected())
    }

    /// List in-progress executions that exceeded their manifest's
    /// timeout. Flagged for operator visibility only; slot reclaim goes
    /// through the background-job visibility timeout.
    pub async fn list_overdue(&self) -> AppResult<Vec<Metadata>> {
        sqlx::query_as::<_, Metadata>(
            "SELECT md.* FROM metadata md \
             JOIN manifest m ON m.id = md.manifest_id \
             WHERE md.workflow_state = 'in_progress' \
             AND md.started_at < NOW() - make_interval(secs => m.timeout_seconds::float8)",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to list overdue metadata", e)
        })
    }
}
