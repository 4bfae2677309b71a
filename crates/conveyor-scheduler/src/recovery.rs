//! Startup recovery, run once before any poll loop starts.
//!
//! Ordering matters: orphaned executions are failed first so the first
//! manager tick sees an honest failure history, then the seed plan is
//! applied (a seeding failure aborts startup rather than letting the
//! loops poll a half-seeded configuration), then groups that lost all
//! their members are swept away.

use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};

use conveyor_core::config::scheduler::SchedulerConfig;
use conveyor_core::result::AppResult;
use conveyor_database::repositories::{GroupRepository, ManifestRepository, MetadataRepository};

use crate::seed::{SeedPlan, SeedReport};

/// Reason recorded on executions orphaned by a restart.
const ORPHANED_REASON: &str = "server restarted while job was in progress";

/// What startup recovery did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// In-progress executions from before the restart marked failed.
    pub orphaned_failed: u64,
    /// Result of applying the seed plan.
    pub seed: SeedReport,
    /// Groups removed because they no longer own any manifests.
    pub empty_groups_removed: u64,
}

/// Run startup recovery. A seed failure is returned as an error and must
/// abort startup.
pub async fn run_startup_recovery(
    pool: &PgPool,
    metadata: &MetadataRepository,
    groups: &GroupRepository,
    manifests: &ManifestRepository,
    plan: &SeedPlan,
    config: &SchedulerConfig,
) -> AppResult<RecoveryReport> {
    let mut report = RecoveryReport::default();

    if config.recover_stuck_jobs {
        report.orphaned_failed = metadata.fail_orphaned(Utc::now(), ORPHANED_REASON).await?;
        if report.orphaned_failed > 0 {
            warn!(
                count = report.orphaned_failed,
                "Failed executions orphaned by the previous shutdown"
            );
        }
    }

    report.seed = plan.apply(pool, groups, manifests, config).await?;
    report.empty_groups_removed = groups.delete_empty().await?;

    info!(
        orphaned_failed = report.orphaned_failed,
        seeded_groups = report.seed.groups,
        seeded_manifests = report.seed.manifests,
        empty_groups_removed = report.empty_groups_removed,
        "Startup recovery finished"
    );
    Ok(report)
}
