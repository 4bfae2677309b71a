//! Background-job entity: a unit of work claimed by the worker pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A queued unit of work for the built-in task server.
///
/// Rows exist only between enqueue and completion; workers delete them
/// unconditionally after execution, so the table never doubles as an
/// audit log. A row with a stale `fetched_at` (older than the visibility
/// timeout) is considered abandoned and becomes claimable again.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BackgroundJob {
    /// Unique job identifier (the task id returned on enqueue).
    pub id: Uuid,
    /// The execution record this job carries out.
    pub metadata_id: Uuid,
    /// Input kind discriminator for ad-hoc executions without a manifest.
    pub input_kind: Option<String>,
    /// Ad-hoc input payload, if any.
    pub input: Option<serde_json::Value>,
    /// Claim timestamp; `None` until a worker claims the row.
    pub fetched_at: Option<DateTime<Utc>>,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
}

impl BackgroundJob {
    /// Check whether the row is claimable at `now`: never claimed, or
    /// claimed longer ago than the visibility timeout.
    pub fn is_claimable(&self, now: DateTime<Utc>, visibility_timeout_seconds: i64) -> bool {
        match self.fetched_at {
            None => true,
            Some(fetched) => (now - fetched).num_seconds() > visibility_timeout_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(fetched_secs_ago: Option<i64>) -> BackgroundJob {
        let now = Utc::now();
        BackgroundJob {
            id: Uuid::new_v4(),
            metadata_id: Uuid::new_v4(),
            input_kind: None,
            input: None,
            fetched_at: fetched_secs_ago.map(|s| now - Duration::seconds(s)),
            created_at: now,
        }
    }

    #[test]
    fn test_unclaimed_is_claimable() {
        assert!(job(None).is_claimable(Utc::now(), 1800));
    }

    #[test]
    fn test_fresh_claim_is_not_claimable() {
        assert!(!job(Some(60)).is_claimable(Utc::now(), 1800));
    }

    #[test]
    fn test_stale_claim_becomes_claimable() {
        assert!(job(Some(1801)).is_claimable(Utc::now(), 1800));
        assert!(!job(Some(1799)).is_claimable(Utc::now(), 1800));
    }
}
