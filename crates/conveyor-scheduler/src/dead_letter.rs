//! Dead-letter service: decision, retry, acknowledge, purge, and
//! statistics for manifests that exhausted their retry budget.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info, warn};
use uuid::Uuid;

use conveyor_core::config::dead_letter::DeadLetterConfig;
use conveyor_core::error::AppError;
use conveyor_core::registry::{TOGGLE_DEAD_LETTER_PURGE, ToggleRegistry};
use conveyor_core::result::AppResult;
use conveyor_database::repositories::dead_letter::{DeadLetterCounts, ManifestDeadLetterCount};
use conveyor_database::repositories::{
    DeadLetterRepository, ManifestRepository, MetadataRepository,
};
use conveyor_entity::dead_letter::DeadLetter;
use conveyor_entity::metadata::model::{Metadata, NewMetadata};
use conveyor_worker::BackgroundTaskServer;

/// Point-in-time snapshot of dead-letter state, for operator dashboards.
#[derive(Debug, Clone)]
pub struct DeadLetterStatistics {
    /// Aggregate counters.
    pub counts: DeadLetterCounts,
    /// Per-manifest breakdown, most-affected first.
    pub per_manifest: Vec<ManifestDeadLetterCount>,
}

/// Decide whether a manifest's failure history exhausts its retry
/// budget. Pure; the count covers failures since the last success.
pub fn should_dead_letter(failed_runs: i64, max_retries: i32) -> bool {
    failed_runs > 0 && failed_runs >= max_retries as i64
}

/// Service for creating and resolving dead letters.
pub struct DeadLetterService {
    dead_letters: DeadLetterRepository,
    metadata: MetadataRepository,
    manifests: ManifestRepository,
    task_server: Arc<dyn BackgroundTaskServer>,
}

impl DeadLetterService {
    /// Create a new dead-letter service.
    pub fn new(
        dead_letters: DeadLetterRepository,
        metadata: MetadataRepository,
        manifests: ManifestRepository,
        task_server: Arc<dyn BackgroundTaskServer>,
    ) -> Self {
        Self {
            dead_letters,
            metadata,
            manifests,
            task_server,
        }
    }

    /// Record a dead letter for a manifest, unless one is already open.
    /// Returns the new record, or `None` when the manifest already
    /// awaits intervention.
    pub async fn dead_letter(
        &self,
        manifest_id: Uuid,
        reason: &str,
    ) -> AppResult<Option<DeadLetter>> {
        if self.dead_letters.has_open_for_manifest(manifest_id).await? {
            return Ok(None);
        }
        let record = self.dead_letters.create(manifest_id, reason).await?;
        warn!(%manifest_id, reason, dead_letter_id = %record.id, "Manifest dead-lettered");
        Ok(Some(record))
    }

    /// Retry a dead-lettered manifest: create a fresh pending execution,
    /// enqueue it, and mark the dead letter resolved (retaining it for
    /// audit).
    pub async fn retry(&self, dead_letter_id: Uuid) -> AppResult<Metadata> {
        let dead_letter = self
            .dead_letters
            .find_by_id(dead_letter_id)
            .await?
            .ok_or_else(|| AppError::not_found("dead letter not found"))?;

        let manifest = self
            .manifests
            .find_by_id(dead_letter.manifest_id)
            .await?
            .ok_or_else(|| AppError::not_found("manifest for dead letter not found"))?;

        let now = Utc::now();
        let record = self
            .metadata
            .create(&NewMetadata {
                external_id: format!("{}-retry-{}", manifest.external_id, now.timestamp_millis()),
                name: manifest.name.clone(),
                manifest_id: Some(manifest.id),
                parent_id: None,
                input: manifest.input.clone(),
                scheduled_at: now,
            })
            .await?;

        self.task_server.enqueue(record.id).await?;
        self.dead_letters.mark_resolved(dead_letter_id).await?;

        info!(
            dead_letter_id = %dead_letter_id,
            metadata_id = %record.id,
            external_id = %manifest.external_id,
            "Dead letter retried"
        );
        Ok(record)
    }

    /// Mark a dead letter resolved without retrying, for out-of-band
    /// fixes.
    pub async fn acknowledge(&self, dead_letter_id: Uuid, note: Option<&str>) -> AppResult<DeadLetter> {
        self.dead_letters
            .acknowledge(dead_letter_id, note)
            .await?
            .ok_or_else(|| AppError::not_found("dead letter not found"))
    }

    /// Bulk-delete dead letters older than `older_than`. Returns the
    /// number removed.
    pub async fn purge(
        &self,
        older_than: chrono::DateTime<Utc>,
        only_acknowledged: bool,
    ) -> AppResult<u64> {
        let removed = self.dead_letters.purge(older_than, only_acknowledged).await?;
        if removed > 0 {
            info!(removed, only_acknowledged, "Purged dead letters");
        }
        Ok(removed)
    }

    /// Snapshot aggregate counters and the per-manifest breakdown.
    pub async fn statistics(&self) -> AppResult<DeadLetterStatistics> {
        Ok(DeadLetterStatistics {
            counts: self.dead_letters.counts().await?,
            per_manifest: self.dead_letters.per_manifest().await?,
        })
    }

    /// Periodic auto-purge loop, running until shutdown. Only purges
    /// acknowledged dead letters past the retention period.
    pub async fn run_auto_purge(
        &self,
        config: DeadLetterConfig,
        toggles: Arc<ToggleRegistry>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let interval = Duration::from_secs(config.purge_interval_seconds);
        info!(
            retention_days = config.retention_days,
            interval_seconds = config.purge_interval_seconds,
            "Dead-letter auto-purge started"
        );

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        info!("Dead-letter auto-purge shutting down");
                        break;
                    }
                }
                _ = time::sleep(interval) => {
                    if !toggles.is_enabled(TOGGLE_DEAD_LETTER_PURGE) {
                        continue;
                    }
                    let cutoff = Utc::now() - ChronoDuration::days(config.retention_days as i64);
                    if let Err(e) = self.purge(cutoff, true).await {
                        error!(error = %e, "Dead-letter auto-purge sweep failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_reached_exactly() {
        assert!(!should_dead_letter(0, 3));
        assert!(!should_dead_letter(2, 3));
        assert!(should_dead_letter(3, 3));
        assert!(should_dead_letter(4, 3));
    }

    #[test]
    fn test_zero_retry_budget_dead_letters_on_first_failure() {
        assert!(!should_dead_letter(0, 0));
        assert!(should_dead_letter(1, 0));
    }
}
