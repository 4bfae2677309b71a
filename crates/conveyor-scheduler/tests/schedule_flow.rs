//! Decision-layer walkthrough of a manifest's lifecycle: due evaluation
//! and the manager's decide step across an interval schedule's timeline,
//! including failure, backoff, and dead-lettering.

use chrono::{Duration, Utc};
use uuid::Uuid;

use conveyor_core::config::scheduler::SchedulerConfig;
use conveyor_database::repositories::manifest::ManifestActivity;
use conveyor_entity::manifest::model::Manifest;
use conveyor_entity::manifest::schedule::ScheduleKind;
use conveyor_scheduler::manager::{Decision, SkipReason, decide};

fn interval_activity(interval_seconds: i64) -> ManifestActivity {
    ManifestActivity {
        manifest: Manifest {
            id: Uuid::new_v4(),
            external_id: "billing.rollup".to_string(),
            name: "Billing rollup".to_string(),
            workflow_kind: "rollup".to_string(),
            input: None,
            schedule_kind: ScheduleKind::Interval,
            cron_expression: None,
            interval_seconds: Some(interval_seconds),
            max_retries: 2,
            timeout_seconds: 600,
            last_successful_run: None,
            group_id: None,
            priority: 5,
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

#[test]
fn interval_manifest_walks_the_full_cycle() {
    let config = SchedulerConfig::default();
    let now = Utc::now();
    let mut activity = interval_activity(300);

    // Never run: due immediately, so the manager stages it.
    assert_eq!(decide(&activity, &config, now, false), Decision::Enqueue);

    // Staged: subsequent ticks leave it alone.
    activity.is_queued = true;
    assert_eq!(
        decide(&activity, &config, now, false),
        Decision::Skip(SkipReason::AlreadyQueued)
    );

    // Dispatched and running: still left alone.
    activity.is_queued = false;
    activity.active_runs = 1;
    assert_eq!(
        decide(&activity, &config, now, false),
        Decision::Skip(SkipReason::AlreadyRunning)
    );

    // Finished successfully: not due again until the interval elapses.
    activity.active_runs = 0;
    activity.manifest.last_successful_run = Some(now);
    assert_eq!(
        decide(&activity, &config, now + Duration::seconds(299), false),
        Decision::Skip(SkipReason::NotDue)
    );
    assert_eq!(
        decide(&activity, &config, now + Duration::seconds(301), false),
        Decision::Enqueue
    );
}

#[test]
fn failures_walk_through_backoff_into_dead_letter() {
    let config = SchedulerConfig::default();
    let now = Utc::now();
    let mut activity = interval_activity(300);

    // First failure: held back while the backoff window is open.
    activity.failed_runs = 1;
    activity.last_failed_at = Some(now - Duration::seconds(5));
    assert_eq!(
        decide(&activity, &config, now, false),
        Decision::Skip(SkipReason::InBackoff)
    );

    // Backoff elapsed: retried.
    activity.last_failed_at = Some(now - Duration::seconds(120));
    assert_eq!(decide(&activity, &config, now, false), Decision::Enqueue);

    // Retry budget exhausted (max_retries = 2): reaped exactly once,
    // then the open dead letter blocks further scheduling.
    activity.failed_runs = 2;
    assert_eq!(decide(&activity, &config, now, false), Decision::Reap);
    activity.has_open_dead_letter = true;
    assert_eq!(
        decide(&activity, &config, now, false),
        Decision::Skip(SkipReason::AwaitingIntervention)
    );
}
