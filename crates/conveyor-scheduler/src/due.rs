//! Pure due-time evaluation for clock-driven manifests.
//!
//! The cron check is a deliberate approximation: rather than computing
//! the exact next fire time, it buckets the expression by which fields
//! are wildcarded and requires the corresponding wall-clock span to have
//! elapsed since the last successful run. Malformed expressions are
//! reported and treated as not due, so a bad definition can never crash
//! a polling cycle.

use chrono::{DateTime, Utc};
use tracing::warn;

use conveyor_entity::manifest::model::Manifest;
use conveyor_entity::manifest::schedule::ScheduleKind;

/// Decide whether a clock-driven manifest should run at `now`.
///
/// Idempotent and side-effect free: the same `(manifest, now)` always
/// yields the same answer. Dependent kinds always return `false` here;
/// they are decided against their parent by the manifest manager.
pub fn is_due(manifest: &Manifest, now: DateTime<Utc>) -> bool {
    match manifest.schedule_kind {
        ScheduleKind::None | ScheduleKind::OnDemand => false,
        ScheduleKind::Dependent | ScheduleKind::DormantDependent => false,
        ScheduleKind::Interval => interval_due(manifest, now),
        ScheduleKind::Cron => cron_due(manifest, now),
    }
}

fn interval_due(manifest: &Manifest, now: DateTime<Utc>) -> bool {
    let Some(interval) = manifest.interval_seconds.filter(|s| *s > 0) else {
        warn!(
            external_id = %manifest.external_id,
            "Interval manifest without a positive interval; skipping"
        );
        return false;
    };
    match manifest.last_successful_run {
        None => true,
        Some(last) => (now - last).num_seconds() >= interval,
    }
}

fn cron_due(manifest: &Manifest, now: DateTime<Utc>) -> bool {
    let Some(expr) = manifest.cron_expression.as_deref() else {
        warn!(
            external_id = %manifest.external_id,
            "Cron manifest without an expression; skipping"
        );
        return false;
    };
    let Some(required) = required_elapsed_seconds(expr) else {
        warn!(
            external_id = %manifest.external_id,
            cron = expr,
            "Malformed cron expression; skipping"
        );
        return false;
    };
    match manifest.last_successful_run {
        None => true,
        Some(last) => (now - last).num_seconds() >= required,
    }
}

/// Map a five-field cron expression to the minimum wall-clock span that
/// must elapse between runs, by granularity of the wildcarded fields:
/// minute wildcard runs every minute, a fixed minute with an hour
/// wildcard every hour, a fixed hour with a day-of-month wildcard every
/// day, and anything more specific conservatively every day.
fn required_elapsed_seconds(expr: &str) -> Option<i64> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 || fields.iter().any(|f| f.is_empty()) {
        return None;
    }
    let wildcard = |field: &str| field.starts_with('*');
    Some(if wildcard(fields[0]) {
        60
    } else if wildcard(fields[1]) {
        3600
    } else if wildcard(fields[2]) {
        86400
    } else {
        86400
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn manifest(kind: ScheduleKind) -> Manifest {
        Manifest {
            id: Uuid::new_v4(),
            external_id: "etl.sync".to_string(),
            name: "Sync".to_string(),
            workflow_kind: "sync".to_string(),
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

    fn interval_manifest(seconds: i64, last_run_secs_ago: Option<i64>) -> Manifest {
        let mut m = manifest(ScheduleKind::Interval);
        m.interval_seconds = Some(seconds);
        m.last_successful_run = last_run_secs_ago.map(|s| Utc::now() - Duration::seconds(s));
        m
    }

    fn cron_manifest(expr: &str, last_run_secs_ago: Option<i64>) -> Manifest {
        let mut m = manifest(ScheduleKind::Cron);
        m.cron_expression = Some(expr.to_string());
        m.last_successful_run = last_run_secs_ago.map(|s| Utc::now() - Duration::seconds(s));
        m
    }

    #[test]
    fn test_interval_never_run_is_due() {
        assert!(is_due(&interval_manifest(300, None), Utc::now()));
    }

    #[test]
    fn test_interval_boundary() {
        let now = Utc::now();
        assert!(!is_due(&interval_manifest(300, Some(299)), now));
        assert!(is_due(&interval_manifest(300, Some(301)), now));
    }

    #[test]
    fn test_interval_missing_seconds_not_due() {
        let mut m = manifest(ScheduleKind::Interval);
        m.interval_seconds = None;
        assert!(!is_due(&m, Utc::now()));
        m.interval_seconds = Some(0);
        assert!(!is_due(&m, Utc::now()));
    }

    #[test]
    fn test_cron_never_run_is_due() {
        assert!(is_due(&cron_manifest("* * * * *", None), Utc::now()));
    }

    #[test]
    fn test_cron_minute_wildcard_granularity() {
        let now = Utc::now();
        assert!(!is_due(&cron_manifest("* * * * *", Some(30)), now));
        assert!(is_due(&cron_manifest("* * * * *", Some(61)), now));
        assert!(is_due(&cron_manifest("*/5 * * * *", Some(61)), now));
    }

    #[test]
    fn test_cron_hourly_granularity() {
        let now = Utc::now();
        assert!(!is_due(&cron_manifest("15 * * * *", Some(1800)), now));
        assert!(is_due(&cron_manifest("15 * * * *", Some(3700)), now));
    }

    #[test]
    fn test_cron_daily_granularity() {
        let now = Utc::now();
        assert!(!is_due(&cron_manifest("0 2 * * *", Some(43200)), now));
        assert!(is_due(&cron_manifest("0 2 * * *", Some(90000)), now));
    }

    #[test]
    fn test_cron_fully_fixed_is_conservative_daily() {
        let now = Utc::now();
        assert!(!is_due(&cron_manifest("0 2 1 1 0", Some(43200)), now));
        assert!(is_due(&cron_manifest("0 2 1 1 0", Some(90000)), now));
    }

    #[test]
    fn test_cron_malformed_not_due() {
        let now = Utc::now();
        assert!(!is_due(&cron_manifest("broken", None), now));
        assert!(!is_due(&cron_manifest("* * *", Some(90000)), now));
        let mut m = manifest(ScheduleKind::Cron);
        m.cron_expression = None;
        assert!(!is_due(&m, now));
    }

    #[test]
    fn test_on_demand_and_dependent_never_due() {
        let now = Utc::now();
        assert!(!is_due(&manifest(ScheduleKind::OnDemand), now));
        assert!(!is_due(&manifest(ScheduleKind::None), now));
        assert!(!is_due(&manifest(ScheduleKind::Dependent), now));
        assert!(!is_due(&manifest(ScheduleKind::DormantDependent), now));
    }

    #[test]
    fn test_idempotent_decision() {
        let now = Utc::now();
        let m = interval_manifest(300, Some(301));
        assert_eq!(is_due(&m, now), is_due(&m, now));
    }
}
