//! Job-dispatcher poll loop.
//!
//! Each tick drains the work queue in priority order and converts staged
//! entries into execution records handed to the task server. The hand-off
//! is transactional when the task server shares the scheduler's database:
//! the metadata insert, the queue-row delete, and the task enqueue commit
//! together, so a crash mid-dispatch leaves either a staged entry or a
//! fully dispatched job, never a half state.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info};
use uuid::Uuid;

use conveyor_core::config::scheduler::SchedulerConfig;
use conveyor_core::error::{AppError, ErrorKind};
use conveyor_core::registry::{TOGGLE_JOB_DISPATCHER, ToggleRegistry};
use conveyor_core::result::AppResult;
use conveyor_database::repositories::work_queue::DispatchCandidate;
use conveyor_database::repositories::{GroupRepository, MetadataRepository, WorkQueueRepository};
use conveyor_entity::metadata::model::{Metadata, NewMetadata};
use conveyor_worker::BackgroundTaskServer;

/// How many staged entries one tick considers.
const DISPATCH_BATCH_SIZE: i64 = 100;

/// Build the unique external ID for an execution of a manifest.
fn execution_external_id(manifest_external_id: &str, now: DateTime<Utc>) -> String {
    format!("{}-{}", manifest_external_id, now.timestamp_millis())
}

/// The job-dispatcher poll loop.
pub struct JobDispatcher {
    pool: PgPool,
    queue: WorkQueueRepository,
    metadata: MetadataRepository,
    groups: GroupRepository,
    task_server: Arc<dyn BackgroundTaskServer>,
    toggles: Arc<ToggleRegistry>,
    config: SchedulerConfig,
}

impl JobDispatcher {
    /// Create a new job dispatcher.
    pub fn new(
        pool: PgPool,
        queue: WorkQueueRepository,
        metadata: MetadataRepository,
        groups: GroupRepository,
        task_server: Arc<dyn BackgroundTaskServer>,
        toggles: Arc<ToggleRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            metadata,
            groups,
            task_server,
            toggles,
            config,
        }
    }

    /// Run one dispatch cycle. Returns how many executions were handed
    /// to the task server.
    pub async fn tick(&self) -> AppResult<usize> {
        if !self.toggles.is_enabled(TOGGLE_JOB_DISPATCHER) {
            debug!("Job dispatcher disabled; skipping tick");
            return Ok(0);
        }

        let candidates = self.queue.list_candidates(DISPATCH_BATCH_SIZE).await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        // Remaining dispatch slots per capped group, decremented as this
        // cycle hands off work so a backlog cannot overshoot the cap.
        let mut group_slots: HashMap<Uuid, i64> = HashMap::new();
        let mut dispatched = 0;

        for candidate in candidates {
            if let (Some(group_id), Some(cap)) =
                (candidate.group_id, candidate.group_max_active_jobs)
            {
                let slots = match group_slots.entry(group_id) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        let running = self.groups.running_count(group_id).await?;
                        entry.insert(cap as i64 - running)
                    }
                };
                if *slots <= 0 {
                    debug!(
                        external_id = %candidate.manifest_external_id,
                        %group_id,
                        "Group at capacity; entry stays queued"
                    );
                    continue;
                }
                *slots -= 1;
            }

            match self.dispatch_one(&candidate).await {
                Ok(Some(record)) => {
                    debug!(
                        external_id = %record.external_id,
                        metadata_id = %record.id,
                        "Execution dispatched"
                    );
                    dispatched += 1;
                }
                Ok(None) => {
                    // A concurrent dispatcher consumed the entry first.
                    debug!(
                        external_id = %candidate.manifest_external_id,
                        "Queue entry raced away; skipping"
                    );
                }
                Err(e) => {
                    error!(
                        external_id = %candidate.manifest_external_id,
                        error = %e,
                        "Failed to dispatch queue entry"
                    );
                }
            }
        }

        if dispatched > 0 {
            info!(dispatched, "Job dispatcher tick finished");
        }
        Ok(dispatched)
    }

    /// Dispatch a single staged entry. Returns `None` when the entry was
    /// already consumed by another dispatcher.
    async fn dispatch_one(&self, candidate: &DispatchCandidate) -> AppResult<Option<Metadata>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to begin dispatch transaction", e)
        })?;

        let record = self
            .metadata
            .create_in_tx(
                &mut tx,
                &NewMetadata {
                    external_id: execution_external_id(&candidate.manifest_external_id, now),
                    name: candidate.manifest_name.clone(),
                    manifest_id: Some(candidate.entry.manifest_id),
                    parent_id: None,
                    input: candidate.manifest_input.clone(),
                    scheduled_at: candidate.entry.enqueued_at,
                },
            )
            .await?;

        if !self.queue.delete_in_tx(&mut tx, candidate.entry.id).await? {
            tx.rollback().await.map_err(|e| {
                AppError::with_source(ErrorKind::Database, "Failed to roll back dispatch", e)
            })?;
            return Ok(None);
        }

        match self.task_server.transactional() {
            Some(transactional) => {
                transactional
                    .enqueue_in_tx(&mut tx, record.id, None, None)
                    .await?;
                tx.commit().await.map_err(|e| {
                    AppError::with_source(ErrorKind::Database, "Failed to commit dispatch", e)
                })?;
            }
            None => {
                // External task server: commit the record first, then
                // enqueue. A crash between the two leaves a Pending record
                // that startup recovery or a retry resolves; the executor's
                // Pending-state check absorbs duplicate deliveries.
                tx.commit().await.map_err(|e| {
                    AppError::with_source(ErrorKind::Database, "Failed to commit dispatch", e)
                })?;
                self.task_server.enqueue(record.id).await?;
            }
        }

        Ok(Some(record))
    }

    /// Run an ad-hoc workflow not backed by any manifest: create the
    /// execution record and enqueue it with the inline input.
    pub async fn run_ad_hoc(
        &self,
        name: &str,
        input_kind: &str,
        input: Value,
    ) -> AppResult<Metadata> {
        let now = Utc::now();
        let record = self
            .metadata
            .create(&NewMetadata {
                external_id: format!("adhoc-{}-{}", input_kind, now.timestamp_millis()),
                name: name.to_string(),
                manifest_id: None,
                parent_id: None,
                input: None,
                scheduled_at: now,
            })
            .await?;

        self.task_server
            .enqueue_with_input(record.id, input_kind, input)
            .await?;

        info!(
            metadata_id = %record.id,
            input_kind,
            "Ad-hoc execution dispatched"
        );
        Ok(record)
    }

    /// Poll loop: tick every `dispatcher_poll_seconds` until shutdown. A
    /// failed tick is logged and retried on the next interval.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.dispatcher_poll_seconds);
        info!(
            poll_seconds = self.config.dispatcher_poll_seconds,
            "Job dispatcher started"
        );

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        info!("Job dispatcher shutting down");
                        break;
                    }
                }
                _ = time::sleep(interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Job dispatcher tick failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_execution_external_id_is_time_qualified() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            execution_external_id("etl.nightly", at),
            format!("etl.nightly-{}", at.timestamp_millis())
        );
    }
}
