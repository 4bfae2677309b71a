//! Manifest-manager poll loop.
//!
//! Each tick walks the activity view in priority order and runs the same
//! three steps per manifest: reap exhausted retry budgets into dead
//! letters, decide whether the manifest is due, and stage due manifests
//! on the work queue. The decision itself is a pure function over the
//! activity snapshot so every branch is unit-testable without a
//! database.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, warn};

use conveyor_core::config::scheduler::SchedulerConfig;
use conveyor_core::error::AppError;
use conveyor_core::registry::{ActivationRegistry, TOGGLE_MANIFEST_MANAGER, ToggleRegistry};
use conveyor_core::result::AppResult;
use conveyor_database::repositories::manifest::ManifestActivity;
use conveyor_database::repositories::{ManifestRepository, MetadataRepository, WorkQueueRepository};
use conveyor_entity::manifest::schedule::ScheduleKind;

use crate::dead_letter::{DeadLetterService, should_dead_letter};
use crate::due::is_due;

/// Why a manifest was passed over this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// An unresolved dead letter awaits operator intervention.
    AwaitingIntervention,
    /// A work-queue entry is already staged.
    AlreadyQueued,
    /// An execution is already pending or in progress.
    AlreadyRunning,
    /// The owning group is disabled.
    GroupDisabled,
    /// The owning group is at its concurrency cap.
    GroupAtCapacity,
    /// Recent failure; the retry backoff window has not elapsed.
    InBackoff,
    /// The schedule simply does not fire at this instant.
    NotDue,
}

/// Outcome of one scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Retry budget exhausted: record a dead letter.
    Reap,
    /// Due and unblocked: stage on the work queue.
    Enqueue,
    /// Leave the manifest alone this tick.
    Skip(SkipReason),
}

/// Decide what to do with one manifest at `now`.
///
/// Pure over the activity snapshot. `dormant_activated` reports whether
/// an in-process activation is pending for a dormant dependent; the
/// caller consumes the activation only when the decision is `Enqueue`.
pub fn decide(
    activity: &ManifestActivity,
    config: &SchedulerConfig,
    now: DateTime<Utc>,
    dormant_activated: bool,
) -> Decision {
    let manifest = &activity.manifest;

    if activity.has_open_dead_letter {
        return Decision::Skip(SkipReason::AwaitingIntervention);
    }
    if should_dead_letter(activity.failed_runs, manifest.max_retries) {
        return Decision::Reap;
    }
    if activity.is_queued {
        return Decision::Skip(SkipReason::AlreadyQueued);
    }
    if activity.active_runs > 0 {
        return Decision::Skip(SkipReason::AlreadyRunning);
    }
    if activity.group_is_enabled == Some(false) {
        return Decision::Skip(SkipReason::GroupDisabled);
    }
    if let Some(cap) = activity.group_max_active_jobs {
        if activity.group_active >= cap as i64 {
            return Decision::Skip(SkipReason::GroupAtCapacity);
        }
    }
    if activity.failed_runs > 0 {
        if let Some(failed_at) = activity.last_failed_at {
            let backoff = config.backoff_seconds(activity.failed_runs as u32);
            if (now - failed_at).num_seconds() < backoff as i64 {
                return Decision::Skip(SkipReason::InBackoff);
            }
        }
    }

    let due = match manifest.schedule_kind {
        ScheduleKind::Cron | ScheduleKind::Interval => is_due(manifest, now),
        ScheduleKind::Dependent => parent_ran_since_own(activity),
        ScheduleKind::DormantDependent => dormant_activated && parent_ran_since_own(activity),
        ScheduleKind::None | ScheduleKind::OnDemand => false,
    };
    if due {
        Decision::Enqueue
    } else {
        Decision::Skip(SkipReason::NotDue)
    }
}

/// A dependent fires when its parent succeeded more recently than the
/// dependent's own last success. A parent that never succeeded never
/// triggers.
fn parent_ran_since_own(activity: &ManifestActivity) -> bool {
    match activity.parent_last_successful_run {
        None => false,
        Some(parent_last) => match activity.manifest.last_successful_run {
            None => true,
            Some(own_last) => parent_last > own_last,
        },
    }
}

/// What one tick did, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Manifests dead-lettered this tick.
    pub reaped: usize,
    /// Manifests staged on the work queue this tick.
    pub enqueued: usize,
    /// Manifests passed over this tick.
    pub skipped: usize,
}

/// The manifest-manager poll loop.
pub struct ManifestManager {
    manifests: ManifestRepository,
    metadata: MetadataRepository,
    queue: WorkQueueRepository,
    dead_letters: Arc<DeadLetterService>,
    toggles: Arc<ToggleRegistry>,
    activations: Arc<ActivationRegistry>,
    config: SchedulerConfig,
}

impl ManifestManager {
    /// Create a new manifest manager.
    pub fn new(
        manifests: ManifestRepository,
        metadata: MetadataRepository,
        queue: WorkQueueRepository,
        dead_letters: Arc<DeadLetterService>,
        toggles: Arc<ToggleRegistry>,
        activations: Arc<ActivationRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            manifests,
            metadata,
            queue,
            dead_letters,
            toggles,
            activations,
            config,
        }
    }

    /// Run one scheduling cycle: reap, determine, enqueue, then flag
    /// overdue executions for operator visibility.
    pub async fn tick(&self) -> AppResult<TickSummary> {
        if !self.toggles.is_enabled(TOGGLE_MANIFEST_MANAGER) {
            debug!("Manifest manager disabled; skipping tick");
            return Ok(TickSummary::default());
        }

        let now = Utc::now();
        let mut summary = TickSummary::default();

        for activity in self.manifests.load_activity().await? {
            let manifest = &activity.manifest;
            let dormant_activated = manifest.schedule_kind == ScheduleKind::DormantDependent
                && self.activations.is_activated(manifest.id);

            match decide(&activity, &self.config, now, dormant_activated) {
                Decision::Reap => {
                    let reason = format!(
                        "retry budget exhausted after {} failed runs (max {})",
                        activity.failed_runs, manifest.max_retries
                    );
                    self.dead_letters.dead_letter(manifest.id, &reason).await?;
                    summary.reaped += 1;
                }
                Decision::Enqueue => {
                    if self.queue.enqueue(manifest.id, manifest.priority).await?.is_some() {
                        if dormant_activated {
                            self.activations.consume(manifest.id);
                        }
                        debug!(
                            external_id = %manifest.external_id,
                            priority = manifest.priority,
                            "Manifest staged for dispatch"
                        );
                        summary.enqueued += 1;
                    } else {
                        summary.skipped += 1;
                    }
                }
                Decision::Skip(reason) => {
                    debug!(external_id = %manifest.external_id, ?reason, "Manifest skipped");
                    summary.skipped += 1;
                }
            }
        }

        for overdue in self.metadata.list_overdue().await? {
            warn!(
                metadata_id = %overdue.id,
                external_id = %overdue.external_id,
                started_at = ?overdue.started_at,
                "Execution has exceeded its timeout and is still in progress"
            );
        }

        if summary.reaped > 0 || summary.enqueued > 0 {
            info!(
                reaped = summary.reaped,
                enqueued = summary.enqueued,
                skipped = summary.skipped,
                "Manifest manager tick finished"
            );
        }
        Ok(summary)
    }

    /// Stage an on-demand manifest by external ID. Returns `false` when
    /// an entry for it is already queued.
    pub async fn trigger(&self, external_id: &str) -> AppResult<bool> {
        let manifest = self
            .manifests
            .find_by_external_id(external_id)
            .await?
            .ok_or_else(|| AppError::not_found("manifest not found"))?;
        if !manifest.is_enabled {
            return Err(AppError::validation("manifest is disabled"));
        }
        let staged = self
            .queue
            .enqueue(manifest.id, manifest.priority)
            .await?
            .is_some();
        if staged {
            info!(external_id, "Manifest triggered on demand");
        }
        Ok(staged)
    }

    /// Stage every enabled on-demand manifest. Returns how many entries
    /// were newly queued.
    pub async fn trigger_all_on_demand(&self) -> AppResult<usize> {
        let mut staged = 0;
        for manifest in self.manifests.list_on_demand().await? {
            if self
                .queue
                .enqueue(manifest.id, manifest.priority)
                .await?
                .is_some()
            {
                staged += 1;
            }
        }
        Ok(staged)
    }

    /// Poll loop: tick every `manager_poll_seconds` until shutdown. A
    /// failed tick is logged and retried on the next interval.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.manager_poll_seconds);
        info!(
            poll_seconds = self.config.manager_poll_seconds,
            "Manifest manager started"
        );

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        info!("Manifest manager shutting down");
                        break;
                    }
                }
                _ = time::sleep(interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Manifest manager tick failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use conveyor_entity::manifest::model::Manifest;
    use uuid::Uuid;

    fn base_activity(kind: ScheduleKind) -> ManifestActivity {
        ManifestActivity {
            manifest: Manifest {
                id: Uuid::new_v4(),
                external_id: "etl.nightly".to_string(),
                name: "Nightly ETL".to_string(),
                workflow_kind: "etl".to_string(),
                input: None,
                schedule_kind: kind,
                cron_expression: None,
                interval_seconds: Some(60),
                max_retries: 3,
                timeout_seconds: 3600,
                last_successful_run: None,
                group_id: None,
                priority: 0,
                depends_on: None,
                is_enabled: true,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            failed_runs: 0,
            last_failed_at: None,
            has_open_dead_letter: false,
            is_queued: false,
            active_runs: 0,
            group_max_active_jobs: None,
            group_is_enabled: None,
            group_active: 0,
            parent_last_successful_run: None,
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    #[test]
    fn test_never_run_interval_enqueues() {
        let activity = base_activity(ScheduleKind::Interval);
        assert_eq!(
            decide(&activity, &config(), Utc::now(), false),
            Decision::Enqueue
        );
    }

    #[test]
    fn test_open_dead_letter_blocks_everything() {
        let mut activity = base_activity(ScheduleKind::Interval);
        activity.has_open_dead_letter = true;
        activity.failed_runs = 10;
        assert_eq!(
            decide(&activity, &config(), Utc::now(), false),
            Decision::Skip(SkipReason::AwaitingIntervention)
        );
    }

    #[test]
    fn test_exhausted_retries_reaped() {
        let mut activity = base_activity(ScheduleKind::Interval);
        activity.failed_runs = 3;
        assert_eq!(decide(&activity, &config(), Utc::now(), false), Decision::Reap);
    }

    #[test]
    fn test_already_queued_skipped() {
        let mut activity = base_activity(ScheduleKind::Interval);
        activity.is_queued = true;
        assert_eq!(
            decide(&activity, &config(), Utc::now(), false),
            Decision::Skip(SkipReason::AlreadyQueued)
        );
    }

    #[test]
    fn test_active_run_skipped() {
        let mut activity = base_activity(ScheduleKind::Interval);
        activity.active_runs = 1;
        assert_eq!(
            decide(&activity, &config(), Utc::now(), false),
            Decision::Skip(SkipReason::AlreadyRunning)
        );
    }

    #[test]
    fn test_group_at_capacity_skipped() {
        let mut activity = base_activity(ScheduleKind::Interval);
        activity.manifest.group_id = Some(Uuid::new_v4());
        activity.group_is_enabled = Some(true);
        activity.group_max_active_jobs = Some(2);
        activity.group_active = 2;
        assert_eq!(
            decide(&activity, &config(), Utc::now(), false),
            Decision::Skip(SkipReason::GroupAtCapacity)
        );
    }

    #[test]
    fn test_group_under_capacity_enqueues() {
        let mut activity = base_activity(ScheduleKind::Interval);
        activity.manifest.group_id = Some(Uuid::new_v4());
        activity.group_is_enabled = Some(true);
        activity.group_max_active_jobs = Some(2);
        activity.group_active = 1;
        assert_eq!(
            decide(&activity, &config(), Utc::now(), false),
            Decision::Enqueue
        );
    }

    #[test]
    fn test_disabled_group_skipped() {
        let mut activity = base_activity(ScheduleKind::Interval);
        activity.manifest.group_id = Some(Uuid::new_v4());
        activity.group_is_enabled = Some(false);
        assert_eq!(
            decide(&activity, &config(), Utc::now(), false),
            Decision::Skip(SkipReason::GroupDisabled)
        );
    }

    #[test]
    fn test_backoff_window_skipped_then_cleared() {
        let now = Utc::now();
        let mut activity = base_activity(ScheduleKind::Interval);
        activity.failed_runs = 1;
        activity.last_failed_at = Some(now - ChronoDuration::seconds(10));
        assert_eq!(
            decide(&activity, &config(), now, false),
            Decision::Skip(SkipReason::InBackoff)
        );
        activity.last_failed_at = Some(now - ChronoDuration::seconds(90));
        assert_eq!(decide(&activity, &config(), now, false), Decision::Enqueue);
    }

    #[test]
    fn test_dependent_fires_on_fresh_parent_success() {
        let now = Utc::now();
        let mut activity = base_activity(ScheduleKind::Dependent);
        activity.manifest.depends_on = Some(Uuid::new_v4());

        assert_eq!(
            decide(&activity, &config(), now, false),
            Decision::Skip(SkipReason::NotDue)
        );

        activity.parent_last_successful_run = Some(now - ChronoDuration::minutes(5));
        assert_eq!(decide(&activity, &config(), now, false), Decision::Enqueue);

        activity.manifest.last_successful_run = Some(now - ChronoDuration::minutes(1));
        assert_eq!(
            decide(&activity, &config(), now, false),
            Decision::Skip(SkipReason::NotDue)
        );
    }

    #[test]
    fn test_dormant_dependent_needs_activation() {
        let now = Utc::now();
        let mut activity = base_activity(ScheduleKind::DormantDependent);
        activity.manifest.depends_on = Some(Uuid::new_v4());
        activity.parent_last_successful_run = Some(now - ChronoDuration::minutes(5));

        assert_eq!(
            decide(&activity, &config(), now, false),
            Decision::Skip(SkipReason::NotDue)
        );
        assert_eq!(decide(&activity, &config(), now, true), Decision::Enqueue);
    }

    #[test]
    fn test_on_demand_never_auto_enqueued() {
        let activity = base_activity(ScheduleKind::OnDemand);
        assert_eq!(
            decide(&activity, &config(), Utc::now(), false),
            Decision::Skip(SkipReason::NotDue)
        );
    }
}
