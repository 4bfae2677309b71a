//! Manifest-group repository implementation.

use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use conveyor_core::error::{AppError, ErrorKind};
use conveyor_core::result::AppResult;
use conveyor_entity::group::{ManifestGroup, NewManifestGroup};

/// Repository for manifest-group CRUD and capacity queries.
#[derive(Debug, Clone)]
pub struct GroupRepository {
    pool: PgPool,
}

impl GroupRepository {
    /// Create a new group repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Find a group by ID.
    pub async fn find_by_id(&self, id: Uuid) -> AppResult<Option<ManifestGroup>> {
        sqlx::query_as::<_, ManifestGroup>("SELECT * FROM manifest_group WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to find group", e))
    }

    /// Find a group by its unique name.
    pub async fn find_by_name(&self, name: &str) -> AppResult<Option<ManifestGroup>> {
        sqlx::query_as::<_, ManifestGroup>("SELECT * FROM manifest_group WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to find group", e))
    }

    /// Upsert a group by name inside an existing transaction.
    pub async fn upsert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        data: &NewManifestGroup,
    ) -> AppResult<ManifestGroup> {
        sqlx::query_as::<_, ManifestGroup>(
            "INSERT INTO manifest_group (name, priority, max_active_jobs, is_enabled) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (name) DO UPDATE SET \
                priority = EXCLUDED.priority, \
                max_active_jobs = EXCLUDED.max_active_jobs, \
                is_enabled = EXCLUDED.is_enabled \
             RETURNING *",
        )
        .bind(&data.name)
        .bind(data.priority)
        .bind(data.max_active_jobs)
        .bind(data.is_enabled)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to upsert group", e))
    }

    /// Count manifests in the group with an active (queued or running)
    /// execution. This is the value bounded by `max_active_jobs`.
    pub async fn active_count(&self, group_id: Uuid) -> AppResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM manifest m \
             WHERE m.group_id = $1 AND ( \
                EXISTS (SELECT 1 FROM work_queue wq WHERE wq.manifest_id = m.id) \
                OR EXISTS (SELECT 1 FROM metadata md WHERE md.manifest_id = m.id \
                    AND md.workflow_state IN ('pending', 'in_progress')) \
             )",
        )
        .bind(group_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to count active jobs", e))
    }

    /// Count dispatched (pending or in-progress) executions in the
    /// group, excluding staged queue entries. The dispatcher uses this
    /// to avoid pushing a group past its cap when draining a backlog.
    pub async fn running_count(&self, group_id: Uuid) -> AppResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM metadata md \
             JOIN manifest m ON m.id = md.manifest_id \
             WHERE m.group_id = $1 \
             AND md.workflow_state IN ('pending', 'in_progress')",
        )
        .bind(group_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to count running jobs", e))
    }

    /// Delete groups that no longer own any manifests. Returns the number
    /// of groups removed.
    pub async fn delete_empty(&self) -> AppResult<u64> {
        let result = sqlx::query(
            "DELETE FROM manifest_group g \
             WHERE NOT EXISTS (SELECT 1 FROM manifest m WHERE m.group_id = g.id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to delete empty groups", e)
        })?;
        Ok(result.rows_affected())
    }
}
