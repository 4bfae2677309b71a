//! Manifest repository implementation.
//!
//! Besides plain CRUD this module carries the activity view the manifest
//! manager polls: each enabled manifest together with the aggregate
//! counts the reap/determine steps need, computed via existence/count
//! subqueries rather than by loading child collections.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use conveyor_core::error::{AppError, ErrorKind};
use conveyor_core::result::AppResult;
use conveyor_entity::manifest::model::{Manifest, NewManifest};

/// An enabled manifest joined with the aggregate state the manifest
/// manager needs for one scheduling decision.
#[derive(Debug, Clone, FromRow)]
pub struct ManifestActivity {
    /// The manifest itself.
    #[sqlx(flatten)]
    pub manifest: Manifest,
    /// Failed executions since the last successful run.
    pub failed_runs: i64,
    /// Finish time of the most recent failed execution, for backoff.
    pub last_failed_at: Option<DateTime<Utc>>,
    /// Whether an unresolved dead letter awaits intervention.
    pub has_open_dead_letter: bool,
    /// Whether a work-queue row is already staged.
    pub is_queued: bool,
    /// Pending or in-progress executions of this manifest.
    pub active_runs: i64,
    /// Owning group's concurrency cap, if grouped.
    pub group_max_active_jobs: Option<i32>,
    /// Owning group's enabled flag, if grouped.
    pub group_is_enabled: Option<bool>,
    /// Manifests in the owning group with an active execution.
    pub group_active: i64,
    /// Parent manifest's last successful run, for dependent kinds.
    pub parent_last_successful_run: Option<DateTime<Utc>>,
}

/// Repository for manifest CRUD and the manager's activity view.
#[derive(Debug, Clone)]
pub struct ManifestRepository {
    pool: PgPool,
}

impl ManifestRepository {
    /// Create a new manifest repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Find a manifest by ID.
    pub async fn find_by_id(&self, id: Uuid) -> AppResult<Option<Manifest>> {
        sqlx::query_as::<_, Manifest>("SELECT * FROM manifest WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to find manifest", e))
    }

    /// Find a manifest by its stable external ID.
    pub async fn find_by_external_id(&self, external_id: &str) -> AppResult<Option<Manifest>> {
        sqlx::query_as::<_, Manifest>("SELECT * FROM manifest WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to find manifest", e))
    }

    /// Find a manifest by external ID inside an existing transaction.
    /// Used by seeding to resolve dependency parents atomically with the
    /// rest of the batch.
    pub async fn find_by_external_id_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        external_id: &str,
    ) -> AppResult<Option<Manifest>> {
        sqlx::query_as::<_, Manifest>("SELECT * FROM manifest WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to find manifest", e))
    }

    /// Upsert a manifest by external ID inside an existing transaction.
    ///
    /// The external ID is the idempotency key: seeding the same
    /// definition twice updates it in place and preserves
    /// `last_successful_run`.
    pub async fn upsert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        data: &NewManifest,
    ) -> AppResult<Manifest> {
        sqlx::query_as::<_, Manifest>(
            "INSERT INTO manifest (external_id, name, workflow_kind, input, schedule_kind, \
                cron_expression, interval_seconds, max_retries, timeout_seconds, group_id, \
                priority, depends_on, is_enabled) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (external_id) DO UPDATE SET \
                name = EXCLUDED.name, \
                workflow_kind = EXCLUDED.workflow_kind, \
                input = EXCLUDED.input, \
                schedule_kind = EXCLUDED.schedule_kind, \
                cron_expression = EXCLUDED.cron_expression, \
                interval_seconds = EXCLUDED.interval_seconds, \
                max_retries = EXCLUDED.max_retries, \
                timeout_seconds = EXCLUDED.timeout_seconds, \
                group_id = EXCLUDED.group_id, \
                priority = EXCLUDED.priority, \
                depends_on = EXCLUDED.depends_on, \
                is_enabled = EXCLUDED.is_enabled, \
                updated_at = NOW() \
             RETURNING *",
        )
        .bind(&data.external_id)
        .bind(&data.name)
        .bind(&data.workflow_kind)
        .bind(&data.input)
        .bind(data.schedule_kind)
        .bind(&data.cron_expression)
        .bind(data.interval_seconds)
        .bind(data.max_retries)
        .bind(data.timeout_seconds)
        .bind(data.group_id)
        .bind(data.priority)
        .bind(data.depends_on)
        .bind(data.is_enabled)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to upsert manifest", e))
    }

    /// Advance the last-successful-run marker.
    pub async fn set_last_successful_run(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        sqlx::query("UPDATE manifest SET last_successful_run = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Database, "Failed to update last run", e)
            })?;
        Ok(())
    }

    /// Enable or disable a manifest.
    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> AppResult<()> {
        sqlx::query("UPDATE manifest SET is_enabled = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(enabled)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to update manifest", e))?;
        Ok(())
    }

    /// Load every enabled manifest with the aggregate activity state the
    /// manager's reap/determine steps need.
    pub async fn load_activity(&self) -> AppResult<Vec<ManifestActivity>> {
        sqlx::query_as::<_, ManifestActivity>(
            "SELECT m.*, \
                (SELECT COUNT(*) FROM metadata md \
                    WHERE md.manifest_id = m.id AND md.workflow_state = 'failed' \
                    AND (m.last_successful_run IS NULL \
                         OR md.created_at > m.last_successful_run)) AS failed_runs, \
                (SELECT MAX(md.finished_at) FROM metadata md \
                    WHERE md.manifest_id = m.id AND md.workflow_state = 'failed') \
                    AS last_failed_at, \
                EXISTS (SELECT 1 FROM dead_letter dl \
                    WHERE dl.manifest_id = m.id AND dl.resolved_at IS NULL) \
                    AS has_open_dead_letter, \
                EXISTS (SELECT 1 FROM work_queue wq WHERE wq.manifest_id = m.id) AS is_queued, \
                (SELECT COUNT(*) FROM metadata md WHERE md.manifest_id = m.id \
                    AND md.workflow_state IN ('pending', 'in_progress')) AS active_runs, \
                g.max_active_jobs AS group_max_active_jobs, \
                g.is_enabled AS group_is_enabled, \
                CASE WHEN m.group_id IS NULL THEN 0 ELSE \
                    (SELECT COUNT(*) FROM manifest m2 \
                     WHERE m2.group_id = m.group_id AND ( \
                        EXISTS (SELECT 1 FROM work_queue wq2 WHERE wq2.manifest_id = m2.id) \
                        OR EXISTS (SELECT 1 FROM metadata md2 WHERE md2.manifest_id = m2.id \
                            AND md2.workflow_state IN ('pending', 'in_progress')))) \
                END AS group_active, \
                p.last_successful_run AS parent_last_successful_run \
             FROM manifest m \
             LEFT JOIN manifest_group g ON g.id = m.group_id \
             LEFT JOIN manifest p ON p.id = m.depends_on \
             WHERE m.is_enabled \
             ORDER BY m.priority DESC, m.external_id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to load manifest activity", e)
        })
    }

    /// List enabled on-demand manifests, for explicit bulk enqueue.
    pub async fn list_on_demand(&self) -> AppResult<Vec<Manifest>> {
        sqlx::query_as::<_, Manifest>(
            "SELECT * FROM manifest WHERE is_enabled AND schedule_kind = 'on_demand'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to list manifests", e))
    }
}
