//! Metadata entity model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::state::WorkflowState;

/// One concrete execution attempt of a manifest, or an ad-hoc run.
///
/// Created in `Pending` state by the dispatcher and never mutated after
/// its terminal transition, except that `current_step` / `step_started_at`
/// track progress while executing.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Metadata {
    /// Unique execution-record identifier.
    pub id: Uuid,
    /// External identifier, stable across retries of the same decision.
    pub external_id: String,
    /// Display name, copied from the manifest (or supplied ad hoc).
    pub name: String,
    /// Originating manifest; `None` for ad-hoc runs.
    pub manifest_id: Option<Uuid>,
    /// Parent execution record for nested executions.
    pub parent_id: Option<Uuid>,
    /// Current lifecycle state.
    pub workflow_state: WorkflowState,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When execution reached a terminal state. Set exactly once.
    pub finished_at: Option<DateTime<Utc>>,
    /// Input payload the workflow ran with.
    pub input: Option<serde_json::Value>,
    /// Output payload on success.
    pub output: Option<serde_json::Value>,
    /// Step in which the failure occurred.
    pub failure_step: Option<String>,
    /// Short failure reason.
    pub failure_reason: Option<String>,
    /// Detailed failure information (error chain, stack trace).
    pub failure_details: Option<String>,
    /// Cross-process cancellation flag, polled by the executing workflow.
    pub cancellation_requested: bool,
    /// Step currently executing.
    pub current_step: Option<String>,
    /// When the current step started.
    pub step_started_at: Option<DateTime<Utc>>,
    /// When the run was scheduled to happen.
    pub scheduled_at: DateTime<Utc>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl Metadata {
    /// Check whether this execution has been running longer than the
    /// given bound. Used for operator visibility only; slot reclaim goes
    /// through the background-job visibility timeout.
    pub fn is_stuck(&self, timeout_seconds: i64, now: DateTime<Utc>) -> bool {
        if self.workflow_state != WorkflowState::InProgress {
            return false;
        }
        match self.started_at {
            Some(started) => (now - started).num_seconds() > timeout_seconds,
            None => false,
        }
    }

    /// Check whether this execution was orphaned by a process restart:
    /// still `InProgress` with a start time before the current process
    /// came up, meaning the process running it died without recording an
    /// outcome. Startup recovery fails such records; terminal records
    /// are never eligible again.
    pub fn is_orphaned(&self, process_started_at: DateTime<Utc>) -> bool {
        self.workflow_state == WorkflowState::InProgress
            && self.started_at.is_some_and(|started| started < process_started_at)
    }
}

/// Data required to create a new execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMetadata {
    /// External identifier.
    pub external_id: String,
    /// Display name.
    pub name: String,
    /// Originating manifest, if any.
    pub manifest_id: Option<Uuid>,
    /// Parent execution record, if nested.
    pub parent_id: Option<Uuid>,
    /// Input payload.
    pub input: Option<serde_json::Value>,
    /// When the run was scheduled to happen.
    pub scheduled_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(state: WorkflowState, started_secs_ago: Option<i64>) -> Metadata {
        let now = Utc::now();
        Metadata {
            id: Uuid::new_v4(),
            external_id: "run-1".to_string(),
            name: "run".to_string(),
            manifest_id: None,
            parent_id: None,
            workflow_state: state,
            started_at: started_secs_ago.map(|s| now - Duration::seconds(s)),
            finished_at: None,
            input: None,
            output: None,
            failure_step: None,
            failure_reason: None,
            failure_details: None,
            cancellation_requested: false,
            current_step: None,
            step_started_at: None,
            scheduled_at: now,
            created_at: now,
        }
    }

    #[test]
    fn test_stuck_detection() {
        let now = Utc::now();
        assert!(record(WorkflowState::InProgress, Some(7200)).is_stuck(3600, now));
        assert!(!record(WorkflowState::InProgress, Some(60)).is_stuck(3600, now));
    }

    #[test]
    fn test_stuck_only_applies_in_progress() {
        let now = Utc::now();
        assert!(!record(WorkflowState::Pending, None).is_stuck(3600, now));
        assert!(!record(WorkflowState::Completed, Some(7200)).is_stuck(3600, now));
    }

    #[test]
    fn test_restart_orphans_in_progress_runs_from_before_boot() {
        let boot = Utc::now();
        assert!(record(WorkflowState::InProgress, Some(60)).is_orphaned(boot));
        // Started after this process came up: a live run, not an orphan.
        let mut live = record(WorkflowState::InProgress, Some(60));
        live.started_at = Some(boot + Duration::seconds(30));
        assert!(!live.is_orphaned(boot));
    }

    #[test]
    fn test_restart_orphaning_happens_at_most_once() {
        let boot = Utc::now();
        // Once failed by a recovery pass (or finished any other way), the
        // record is terminal and never eligible again.
        assert!(!record(WorkflowState::Failed, Some(60)).is_orphaned(boot));
        assert!(!record(WorkflowState::Completed, Some(60)).is_orphaned(boot));
        assert!(!record(WorkflowState::Pending, None).is_orphaned(boot));
    }
}
