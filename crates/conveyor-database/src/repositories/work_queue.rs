//! Work-queue repository implementation.

use serde_json::Value;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use conveyor_core::error::{AppError, ErrorKind};
use conveyor_core::result::AppResult;
use conveyor_entity::queue::WorkQueueEntry;

/// A staged work-queue entry joined with the manifest fields the
/// dispatcher needs to build an execution record.
#[derive(Debug, Clone, FromRow)]
pub struct DispatchCandidate {
    /// The queue entry itself.
    #[sqlx(flatten)]
    pub entry: WorkQueueEntry,
    /// Manifest display name.
    pub manifest_name: String,
    /// Manifest external ID.
    pub manifest_external_id: String,
    /// Manifest default input.
    pub manifest_input: Option<Value>,
    /// Owning group, if any.
    pub group_id: Option<Uuid>,
    /// Owning group's concurrency cap.
    pub group_max_active_jobs: Option<i32>,
}

/// Repository for the transient "due and not yet dispatched" staging
/// table.
#[derive(Debug, Clone)]
pub struct WorkQueueRepository {
    pool: PgPool,
}

impl WorkQueueRepository {
    /// Create a new work-queue repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Stage a due decision for a manifest.
    ///
    /// At most one live entry exists per manifest; a second enqueue is a
    /// no-op and returns `None`.
    pub async fn enqueue(&self, manifest_id: Uuid, priority: i32) -> AppResult<Option<WorkQueueEntry>> {
        sqlx::query_as::<_, WorkQueueEntry>(
            "INSERT INTO work_queue (manifest_id, priority) VALUES ($1, $2) \
             ON CONFLICT (manifest_id) DO NOTHING RETURNING *",
        )
        .bind(manifest_id)
        .bind(priority)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to enqueue work", e))
    }

    /// Load staged entries in dispatch order: priority descending, then
    /// FIFO by enqueue time.
    pub async fn list_candidates(&self, limit: i64) -> AppResult<Vec<DispatchCandidate>> {
        sqlx::query_as::<_, DispatchCandidate>(
            "SELECT wq.*, \
                m.name AS manifest_name, \
                m.external_id AS manifest_external_id, \
                m.input AS manifest_input, \
                m.group_id AS group_id, \
                g.max_active_jobs AS group_max_active_jobs \
             FROM work_queue wq \
             JOIN manifest m ON m.id = wq.manifest_id \
             LEFT JOIN manifest_group g ON g.id = m.group_id \
             ORDER BY wq.priority DESC, wq.enqueued_at ASC \
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to list queue candidates", e)
        })
    }

    /// Delete a staged entry inside an existing transaction. Returns
    /// whether the row was still present (a concurrent dispatcher may
    /// have consumed it first).
    pub async fn delete_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM work_queue WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Database, "Failed to delete queue entry", e)
            })?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a staged entry outside a transaction.
    pub async fn delete(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM work_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Database, "Failed to delete queue entry", e)
            })?;
        Ok(result.rows_affected() > 0)
    }

    /// Count staged entries.
    pub async fn depth(&self) -> AppResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM work_queue")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to count queue", e))
    }
}
