//! Dead-letter repository implementation.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use conveyor_core::error::{AppError, ErrorKind};
use conveyor_core::result::AppResult;
use conveyor_entity::dead_letter::DeadLetter;

/// Aggregate dead-letter counters, taken as a point-in-time snapshot.
#[derive(Debug, Clone, FromRow)]
pub struct DeadLetterCounts {
    /// Dead letters not yet resolved.
    pub unresolved: i64,
    /// Unresolved and not acknowledged: awaiting operator intervention.
    pub awaiting_intervention: i64,
    /// Acknowledged dead letters (resolved out of band).
    pub acknowledged: i64,
    /// Resolved via retry.
    pub retried: i64,
    /// Creation time of the most recent dead letter.
    pub latest: Option<DateTime<Utc>>,
}

/// Per-manifest dead-letter breakdown row.
#[derive(Debug, Clone, FromRow)]
pub struct ManifestDeadLetterCount {
    /// The manifest.
    pub manifest_id: Uuid,
    /// The manifest's external ID.
    pub external_id: String,
    /// Total dead letters for the manifest.
    pub total: i64,
    /// Unresolved dead letters for the manifest.
    pub unresolved: i64,
}

/// Repository for dead-letter records.
#[derive(Debug, Clone)]
pub struct DeadLetterRepository {
    pool: PgPool,
}

impl DeadLetterRepository {
    /// Create a new dead-letter repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Find a dead letter by ID.
    pub async fn find_by_id(&self, id: Uuid) -> AppResult<Option<DeadLetter>> {
        sqlx::query_as::<_, DeadLetter>("SELECT * FROM dead_letter WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to find dead letter", e))
    }

    /// Record a dead letter for a manifest.
    pub async fn create(&self, manifest_id: Uuid, reason: &str) -> AppResult<DeadLetter> {
        sqlx::query_as::<_, DeadLetter>(
            "INSERT INTO dead_letter (manifest_id, reason) VALUES ($1, $2) RETURNING *",
        )
        .bind(manifest_id)
        .bind(reason)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to create dead letter", e))
    }

    /// Check whether the manifest has an unresolved dead letter.
    pub async fn has_open_for_manifest(&self, manifest_id: Uuid) -> AppResult<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM dead_letter \
             WHERE manifest_id = $1 AND resolved_at IS NULL)",
        )
        .bind(manifest_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to check dead letters", e))
    }

    /// Mark a dead letter acknowledged, retaining it for audit. Returns
    /// the updated record, or `None` if the id is unknown.
    pub async fn acknowledge(&self, id: Uuid, note: Option<&str>) -> AppResult<Option<DeadLetter>> {
        sqlx::query_as::<_, DeadLetter>(
            "UPDATE dead_letter SET acknowledged = TRUE, acknowledgement_note = $2, \
                resolved_at = COALESCE(resolved_at, NOW()) \
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(note)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to acknowledge dead letter", e)
        })
    }

    /// Mark a dead letter resolved without acknowledgement (the retry
    /// path). Returns the updated record.
    pub async fn mark_resolved(&self, id: Uuid) -> AppResult<Option<DeadLetter>> {
        sqlx::query_as::<_, DeadLetter>(
            "UPDATE dead_letter SET resolved_at = NOW() \
             WHERE id = $1 AND resolved_at IS NULL RETURNING *",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to resolve dead letter", e)
        })
    }

    /// Bulk-delete dead letters older than the given instant. Returns
    /// the number removed.
    pub async fn purge(&self, older_than: DateTime<Utc>, only_acknowledged: bool) -> AppResult<u64> {
        let result = sqlx::query(
            "DELETE FROM dead_letter WHERE created_at < $1 AND ($2 = FALSE OR acknowledged)",
        )
        .bind(older_than)
        .bind(only_acknowledged)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to purge dead letters", e))?;
        Ok(result.rows_affected())
    }

    /// Snapshot the aggregate counters.
    pub async fn counts(&self) -> AppResult<DeadLetterCounts> {
        sqlx::query_as::<_, DeadLetterCounts>(
            "SELECT \
                COUNT(*) FILTER (WHERE resolved_at IS NULL) AS unresolved, \
                COUNT(*) FILTER (WHERE resolved_at IS NULL AND NOT acknowledged) \
                    AS awaiting_intervention, \
                COUNT(*) FILTER (WHERE acknowledged) AS acknowledged, \
                COUNT(*) FILTER (WHERE resolved_at IS NOT NULL AND NOT acknowledged) AS retried, \
                MAX(created_at) AS latest \
             FROM dead_letter",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to count dead letters", e))
    }

    /// Snapshot the per-manifest breakdown.
    pub async fn per_manifest(&self) -> AppResult<Vec<ManifestDeadLetterCount>> {
        sqlx::query_as::<_, ManifestDeadLetterCount>(
            "SELECT dl.manifest_id, m.external_id, \
                COUNT(*) AS total, \
                COUNT(*) FILTER (WHERE dl.resolved_at IS NULL) AS unresolved \
             FROM dead_letter dl \
             JOIN manifest m ON m.id = dl.manifest_id \
             GROUP BY dl.manifest_id, m.external_id \
             ORDER BY total DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to break down dead letters", e)
        })
    }
}
