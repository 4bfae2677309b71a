//! Manifest group entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A named batch of manifests scheduled together, with a shared
/// concurrency cap.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ManifestGroup {
    /// Unique group identifier.
    pub id: Uuid,
    /// Unique group name.
    pub name: String,
    /// Dispatch priority applied to the group's manifests.
    pub priority: i32,
    /// Maximum number of manifests in this group with an active (queued
    /// or in-progress) execution. `None` = unbounded.
    pub max_active_jobs: Option<i32>,
    /// Whether the group participates in scheduling.
    pub is_enabled: bool,
    /// When the group was created.
    pub created_at: DateTime<Utc>,
}

impl ManifestGroup {
    /// Check whether the group still has capacity given the current
    /// number of active executions.
    pub fn has_capacity(&self, active: i64) -> bool {
        match self.max_active_jobs {
            Some(cap) => active < cap as i64,
            None => true,
        }
    }
}

/// Data required to create or upsert a manifest group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewManifestGroup {
    /// Unique group name (the upsert key).
    pub name: String,
    /// Dispatch priority.
    pub priority: i32,
    /// Concurrency cap, `None` = unbounded.
    pub max_active_jobs: Option<i32>,
    /// Whether the group is enabled.
    pub is_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_unbounded() {
        let group = ManifestGroup {
            id: Uuid::new_v4(),
            name: "etl".to_string(),
            priority: 0,
            max_active_jobs: None,
            is_enabled: true,
            created_at: Utc::now(),
        };
        assert!(group.has_capacity(1_000_000));
    }

    #[test]
    fn test_capacity_bounded() {
        let group = ManifestGroup {
            id: Uuid::new_v4(),
            name: "etl".to_string(),
            priority: 0,
            max_active_jobs: Some(2),
            is_enabled: true,
            created_at: Utc::now(),
        };
        assert!(group.has_capacity(0));
        assert!(group.has_capacity(1));
        assert!(!group.has_capacity(2));
        assert!(!group.has_capacity(3));
    }
}
