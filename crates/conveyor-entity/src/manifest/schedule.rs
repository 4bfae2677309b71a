//! Schedule kind enumeration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a manifest is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "schedule_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Not scheduled at all.
    None,
    /// Scheduled by a cron expression.
    Cron,
    /// Scheduled at a fixed interval after the last successful run.
    Interval,
    /// Only runs when explicitly triggered.
    OnDemand,
    /// Runs after its parent manifest succeeds.
    Dependent,
    /// Depends on a parent but never auto-fires; runs only via explicit
    /// runtime activation.
    DormantDependent,
}

impl ScheduleKind {
    /// Check whether this kind requires a `depends_on` parent manifest.
    pub fn requires_parent(&self) -> bool {
        matches!(self, Self::Dependent | Self::DormantDependent)
    }

    /// Check whether the due-time evaluator applies to this kind.
    ///
    /// Dependent kinds are decided against their parent instead, and
    /// on-demand manifests only run when explicitly triggered.
    pub fn is_clock_driven(&self) -> bool {
        matches!(self, Self::Cron | Self::Interval)
    }

    /// Return the kind as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Cron => "cron",
            Self::Interval => "interval",
            Self::OnDemand => "on_demand",
            Self::Dependent => "dependent",
            Self::DormantDependent => "dormant_dependent",
        }
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_parent() {
        assert!(ScheduleKind::Dependent.requires_parent());
        assert!(ScheduleKind::DormantDependent.requires_parent());
        assert!(!ScheduleKind::Cron.requires_parent());
        assert!(!ScheduleKind::OnDemand.requires_parent());
    }

    #[test]
    fn test_clock_driven() {
        assert!(ScheduleKind::Cron.is_clock_driven());
        assert!(ScheduleKind::Interval.is_clock_driven());
        assert!(!ScheduleKind::Dependent.is_clock_driven());
        assert!(!ScheduleKind::None.is_clock_driven());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&ScheduleKind::DormantDependent).expect("serialize");
        assert_eq!(json, "\"dormant_dependent\"");
    }
}
