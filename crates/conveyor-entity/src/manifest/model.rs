//! Manifest entity model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::schedule::ScheduleKind;

/// Highest allowed manifest priority.
pub const MAX_PRIORITY: i32 = 31;

/// A job definition: what workflow to run, with what default input, on
/// what schedule.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Manifest {
    /// Unique manifest identifier.
    pub id: Uuid,
    /// Stable upsert key, unique across all manifests.
    pub external_id: String,
    /// Human-readable name.
    pub name: String,
    /// Workflow kind discriminator, resolved through the handler registry.
    pub workflow_kind: String,
    /// Default input payload passed to the workflow (JSON).
    pub input: Option<serde_json::Value>,
    /// How this manifest is scheduled.
    pub schedule_kind: ScheduleKind,
    /// Cron expression, meaningful only for [`ScheduleKind::Cron`].
    pub cron_expression: Option<String>,
    /// Interval in seconds, meaningful only for [`ScheduleKind::Interval`].
    pub interval_seconds: Option<i64>,
    /// Consecutive failures tolerated before dead-lettering.
    pub max_retries: i32,
    /// Expected execution time bound, for operator visibility.
    pub timeout_seconds: i64,
    /// Completion time of the most recent successful run.
    pub last_successful_run: Option<DateTime<Utc>>,
    /// Owning group, if any.
    pub group_id: Option<Uuid>,
    /// Dispatch priority, 0–31, higher dispatches first.
    pub priority: i32,
    /// Parent manifest for dependent schedule kinds.
    pub depends_on: Option<Uuid>,
    /// Whether the manifest participates in scheduling.
    pub is_enabled: bool,
    /// When the manifest was created.
    pub created_at: DateTime<Utc>,
    /// When the manifest was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Manifest {
    /// Check that schedule fields are mutually consistent.
    ///
    /// Exactly one of cron expression / interval is meaningful per kind,
    /// and dependent kinds must carry a parent reference.
    pub fn schedule_is_valid(&self) -> bool {
        match self.schedule_kind {
            ScheduleKind::Cron => self.cron_expression.is_some(),
            ScheduleKind::Interval => self.interval_seconds.is_some_and(|s| s > 0),
            ScheduleKind::Dependent | ScheduleKind::DormantDependent => self.depends_on.is_some(),
            ScheduleKind::None | ScheduleKind::OnDemand => true,
        }
    }
}

/// Data required to create or upsert a manifest.
///
/// `external_id` is the idempotency key: upserting the same external id
/// twice updates the existing definition in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewManifest {
    /// Stable upsert key.
    pub external_id: String,
    /// Human-readable name.
    pub name: String,
    /// Workflow kind discriminator.
    pub workflow_kind: String,
    /// Default input payload.
    pub input: Option<serde_json::Value>,
    /// Schedule kind.
    pub schedule_kind: ScheduleKind,
    /// Cron expression for cron manifests.
    pub cron_expression: Option<String>,
    /// Interval in seconds for interval manifests.
    pub interval_seconds: Option<i64>,
    /// Retry budget.
    pub max_retries: i32,
    /// Expected execution time bound.
    pub timeout_seconds: i64,
    /// Owning group.
    pub group_id: Option<Uuid>,
    /// Dispatch priority, 0–31.
    pub priority: i32,
    /// Parent manifest for dependent kinds.
    pub depends_on: Option<Uuid>,
    /// Whether the manifest is enabled.
    pub is_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(kind: ScheduleKind) -> Manifest {
        Manifest {
            id: Uuid::new_v4(),
            external_id: "reports.daily".to_string(),
            name: "Daily report".to_string(),
            workflow_kind: "report".to_string(),
            input: None,
            schedule_kind: kind,
            cron_expression: None,
            interval_seconds: None,
            max_retries: 3,
            timeout_seconds: 3600,
            last_successful_run: None,
            group_id: None,
            priority: 0,
            depends_on: None,
            is_enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_cron_requires_expression() {
        let mut m = manifest(ScheduleKind::Cron);
        assert!(!m.schedule_is_valid());
        m.cron_expression = Some("0 * * * *".to_string());
        assert!(m.schedule_is_valid());
    }

    #[test]
    fn test_interval_requires_positive_seconds() {
        let mut m = manifest(ScheduleKind::Interval);
        assert!(!m.schedule_is_valid());
        m.interval_seconds = Some(0);
        assert!(!m.schedule_is_valid());
        m.interval_seconds = Some(300);
        assert!(m.schedule_is_valid());
    }

    #[test]
    fn test_dependent_requires_parent() {
        let mut m = manifest(ScheduleKind::Dependent);
        assert!(!m.schedule_is_valid());
        m.depends_on = Some(Uuid::new_v4());
        assert!(m.schedule_is_valid());
    }

    #[test]
    fn test_on_demand_always_valid() {
        assert!(manifest(ScheduleKind::OnDemand).schedule_is_valid());
        assert!(manifest(ScheduleKind::None).schedule_is_valid());
    }
}
