//! Declarative seed plan for manifests and groups.
//!
//! Applications describe their job definitions with a small fluent
//! builder and apply the whole plan in one transaction at startup.
//! External IDs are the idempotency keys, so re-applying the same plan
//! on every boot converges instead of duplicating.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use conveyor_core::config::scheduler::SchedulerConfig;
use conveyor_core::error::{AppError, ErrorKind};
use conveyor_core::result::AppResult;
use conveyor_database::repositories::{GroupRepository, ManifestRepository};
use conveyor_entity::group::NewManifestGroup;
use conveyor_entity::manifest::model::{MAX_PRIORITY, NewManifest};
use conveyor_entity::manifest::schedule::ScheduleKind;

/// How a seeded manifest is scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleSpec {
    /// Five-field cron expression.
    Cron(String),
    /// Fixed interval in seconds.
    Interval(i64),
    /// Fires only when explicitly triggered.
    OnDemand,
    /// Fires after the named parent manifest succeeds.
    Dependent {
        /// Parent manifest external ID.
        parent: String,
    },
    /// Depends on a parent but fires only via runtime activation.
    Dormant {
        /// Parent manifest external ID.
        parent: String,
    },
}

/// One manifest declaration.
#[derive(Debug, Clone)]
pub struct ManifestSeed {
    external_id: String,
    name: Option<String>,
    workflow_kind: String,
    input: Option<Value>,
    schedules: Vec<ScheduleSpec>,
    max_retries: Option<i32>,
    timeout_seconds: Option<i64>,
    priority: Option<i32>,
    enabled: bool,
}

impl ManifestSeed {
    /// Declare a manifest by external ID and workflow kind.
    pub fn new(external_id: impl Into<String>, workflow_kind: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            name: None,
            workflow_kind: workflow_kind.into(),
            input: None,
            schedules: Vec::new(),
            max_retries: None,
            timeout_seconds: None,
            priority: None,
            enabled: true,
        }
    }

    /// Set the display name. Defaults to the external ID.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the default input payload.
    pub fn input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    /// Schedule by cron expression.
    pub fn cron(mut self, expression: impl Into<String>) -> Self {
        self.schedules.push(ScheduleSpec::Cron(expression.into()));
        self
    }

    /// Schedule every `seconds` seconds.
    pub fn every_seconds(mut self, seconds: i64) -> Self {
        self.schedules.push(ScheduleSpec::Interval(seconds));
        self
    }

    /// Schedule on demand only.
    pub fn on_demand(mut self) -> Self {
        self.schedules.push(ScheduleSpec::OnDemand);
        self
    }

    /// Fire after the named parent manifest succeeds.
    pub fn after(mut self, parent_external_id: impl Into<String>) -> Self {
        self.schedules.push(ScheduleSpec::Dependent {
            parent: parent_external_id.into(),
        });
        self
    }

    /// Depend on the named parent but fire only via runtime activation.
    pub fn dormant_after(mut self, parent_external_id: impl Into<String>) -> Self {
        self.schedules.push(ScheduleSpec::Dormant {
            parent: parent_external_id.into(),
        });
        self
    }

    /// Set the retry budget.
    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the expected execution time bound.
    pub fn timeout_seconds(mut self, timeout_seconds: i64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    /// Set the dispatch priority, 0–31.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Seed the manifest disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn schedule(&self) -> AppResult<&ScheduleSpec> {
        match self.schedules.as_slice() {
            [single] => Ok(single),
            [] => Err(AppError::validation(format!(
                "manifest '{}' declares no schedule",
                self.external_id
            ))),
            _ => Err(AppError::validation(format!(
                "manifest '{}' declares more than one schedule",
                self.external_id
            ))),
        }
    }

    fn parent_external_id(&self) -> Option<&str> {
        match self.schedules.as_slice() {
            [ScheduleSpec::Dependent { parent }] | [ScheduleSpec::Dormant { parent }] => {
                Some(parent)
            }
            _ => None,
        }
    }

    fn validate(&self) -> AppResult<()> {
        let schedule = self.schedule()?;
        if let ScheduleSpec::Interval(seconds) = schedule {
            if *seconds <= 0 {
                return Err(AppError::validation(format!(
                    "manifest '{}' declares a non-positive interval",
                    self.external_id
                )));
            }
        }
        if let Some(priority) = self.priority {
            if !(0..=MAX_PRIORITY).contains(&priority) {
                return Err(AppError::validation(format!(
                    "manifest '{}' priority {} is outside 0..={}",
                    self.external_id, priority, MAX_PRIORITY
                )));
            }
        }
        Ok(())
    }

    fn build(
        &self,
        group: Option<(Uuid, i32)>,
        depends_on: Option<Uuid>,
        defaults: &SchedulerConfig,
    ) -> AppResult<NewManifest> {
        let (schedule_kind, cron_expression, interval_seconds) = match self.schedule()? {
            ScheduleSpec::Cron(expr) => (ScheduleKind::Cron, Some(expr.clone()), None),
            ScheduleSpec::Interval(seconds) => (ScheduleKind::Interval, None, Some(*seconds)),
            ScheduleSpec::OnDemand => (ScheduleKind::OnDemand, None, None),
            ScheduleSpec::Dependent { .. } => (ScheduleKind::Dependent, None, None),
            ScheduleSpec::Dormant { .. } => (ScheduleKind::DormantDependent, None, None),
        };
        let (group_id, group_priority) = match group {
            Some((id, priority)) => (Some(id), Some(priority)),
            None => (None, None),
        };
        Ok(NewManifest {
            external_id: self.external_id.clone(),
            name: self.name.clone().unwrap_or_else(|| self.external_id.clone()),
            workflow_kind: self.workflow_kind.clone(),
            input: self.input.clone(),
            schedule_kind,
            cron_expression,
            interval_seconds,
            max_retries: self.max_retries.unwrap_or(defaults.default_max_retries),
            timeout_seconds: self
                .timeout_seconds
                .unwrap_or(defaults.default_timeout_seconds),
            group_id,
            priority: self.priority.or(group_priority).unwrap_or(0),
            depends_on,
            is_enabled: self.enabled,
        })
    }
}

/// One group declaration with its member manifests.
#[derive(Debug, Clone)]
pub struct GroupSeed {
    name: String,
    priority: i32,
    max_active_jobs: Option<i32>,
    enabled: bool,
    manifests: Vec<ManifestSeed>,
}

impl GroupSeed {
    /// Declare a group by unique name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            max_active_jobs: None,
            enabled: true,
            manifests: Vec::new(),
        }
    }

    /// Set the group dispatch priority, inherited by members that do not
    /// set their own.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Cap concurrent active executions across the group's members.
    pub fn max_active_jobs(mut self, cap: i32) -> Self {
        self.max_active_jobs = Some(cap);
        self
    }

    /// Seed the group disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Add a member manifest.
    pub fn manifest(mut self, seed: ManifestSeed) -> Self {
        self.manifests.push(seed);
        self
    }
}

/// What applying a seed plan did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    /// Groups upserted.
    pub groups: usize,
    /// Manifests upserted.
    pub manifests: usize,
}

/// A whole application's manifest declarations, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct SeedPlan {
    groups: Vec<GroupSeed>,
    manifests: Vec<ManifestSeed>,
}

impl SeedPlan {
    /// Create an empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a group with its members.
    pub fn group(mut self, group: GroupSeed) -> Self {
        self.groups.push(group);
        self
    }

    /// Add an ungrouped manifest.
    pub fn manifest(mut self, seed: ManifestSeed) -> Self {
        self.manifests.push(seed);
        self
    }

    /// Add a batch of dependents that all fire after the named parent.
    pub fn dependents(
        mut self,
        parent_external_id: impl Into<String>,
        seeds: impl IntoIterator<Item = ManifestSeed>,
    ) -> Self {
        let parent = parent_external_id.into();
        for seed in seeds {
            self.manifests.push(seed.after(parent.clone()));
        }
        self
    }

    fn all_seeds(&self) -> impl Iterator<Item = &ManifestSeed> {
        self.manifests
            .iter()
            .chain(self.groups.iter().flat_map(|g| g.manifests.iter()))
    }

    /// Validate the plan without touching the database.
    pub fn validate(&self) -> AppResult<()> {
        let mut seen = HashSet::new();
        for seed in self.all_seeds() {
            seed.validate()?;
            if !seen.insert(seed.external_id.as_str()) {
                return Err(AppError::validation(format!(
                    "duplicate manifest external id '{}'",
                    seed.external_id
                )));
            }
        }
        let mut group_names = HashSet::new();
        for group in &self.groups {
            if !group_names.insert(group.name.as_str()) {
                return Err(AppError::validation(format!(
                    "duplicate group name '{}'",
                    group.name
                )));
            }
        }
        Ok(())
    }

    /// Apply the plan in one transaction: upsert groups, then manifests,
    /// resolving dependency parents from the plan itself or from
    /// already-persisted manifests. Any failure rolls the whole plan
    /// back.
    pub async fn apply(
        &self,
        pool: &PgPool,
        groups: &GroupRepository,
        manifests: &ManifestRepository,
        defaults: &SchedulerConfig,
    ) -> AppResult<SeedReport> {
        self.validate()?;

        let mut tx = pool.begin().await.map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to begin seed transaction", e)
        })?;
        let mut report = SeedReport::default();

        let mut group_of: HashMap<&str, (Uuid, i32)> = HashMap::new();
        for group in &self.groups {
            let persisted = groups
                .upsert_in_tx(
                    &mut tx,
                    &NewManifestGroup {
                        name: group.name.clone(),
                        priority: group.priority,
                        max_active_jobs: group.max_active_jobs,
                        is_enabled: group.enabled,
                    },
                )
                .await?;
            for member in &group.manifests {
                group_of.insert(member.external_id.as_str(), (persisted.id, group.priority));
            }
            report.groups += 1;
        }

        // Parents before dependents: repeatedly upsert every seed whose
        // parent is already resolvable, either from this plan or from a
        // manifest persisted by an earlier boot.
        let mut ids: HashMap<String, Uuid> = HashMap::new();
        let mut pending: Vec<&ManifestSeed> = self.all_seeds().collect();
        while !pending.is_empty() {
            let mut deferred = Vec::new();
            let mut progressed = false;

            for seed in pending {
                let depends_on = match seed.parent_external_id() {
                    None => None,
                    Some(parent) => match ids.get(parent) {
                        Some(id) => Some(*id),
                        None => match manifests.find_by_external_id_in_tx(&mut tx, parent).await? {
                            Some(existing) => Some(existing.id),
                            None => {
                                deferred.push(seed);
                                continue;
                            }
                        },
                    },
                };
                let group = group_of.get(seed.external_id.as_str()).copied();
                let persisted = manifests
                    .upsert_in_tx(&mut tx, &seed.build(group, depends_on, defaults)?)
                    .await?;
                ids.insert(seed.external_id.clone(), persisted.id);
                report.manifests += 1;
                progressed = true;
            }

            if !progressed {
                let missing: Vec<&str> = deferred
                    .iter()
                    .filter_map(|s| s.parent_external_id())
                    .collect();
                return Err(AppError::validation(format!(
                    "unresolvable dependency parents: {}",
                    missing.join(", ")
                )));
            }
            pending = deferred;
        }

        tx.commit().await.map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to commit seed transaction", e)
        })?;

        info!(
            groups = report.groups,
            manifests = report.manifests,
            "Seed plan applied"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defaults() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    #[test]
    fn test_builder_maps_to_new_manifest() {
        let seed = ManifestSeed::new("etl.nightly", "etl")
            .name("Nightly ETL")
            .input(json!({"source": "warehouse"}))
            .cron("0 2 * * *")
            .max_retries(5)
            .priority(10);
        let built = seed.build(None, None, &defaults()).unwrap();
        assert_eq!(built.external_id, "etl.nightly");
        assert_eq!(built.name, "Nightly ETL");
        assert_eq!(built.schedule_kind, ScheduleKind::Cron);
        assert_eq!(built.cron_expression.as_deref(), Some("0 2 * * *"));
        assert_eq!(built.max_retries, 5);
        assert_eq!(built.priority, 10);
        assert!(built.is_enabled);
    }

    #[test]
    fn test_defaults_fill_unset_fields() {
        let built = ManifestSeed::new("sync", "sync")
            .every_seconds(300)
            .build(None, None, &defaults())
            .unwrap();
        assert_eq!(built.name, "sync");
        assert_eq!(built.max_retries, defaults().default_max_retries);
        assert_eq!(built.timeout_seconds, defaults().default_timeout_seconds);
        assert_eq!(built.priority, 0);
    }

    #[test]
    fn test_group_priority_inherited() {
        let built = ManifestSeed::new("sync", "sync")
            .every_seconds(300)
            .build(Some((Uuid::new_v4(), 7)), None, &defaults())
            .unwrap();
        assert_eq!(built.priority, 7);
    }

    #[test]
    fn test_missing_schedule_rejected() {
        let plan = SeedPlan::new().manifest(ManifestSeed::new("sync", "sync"));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_double_schedule_rejected() {
        let plan = SeedPlan::new().manifest(
            ManifestSeed::new("sync", "sync")
                .every_seconds(300)
                .cron("* * * * *"),
        );
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_priority_out_of_range_rejected() {
        let plan = SeedPlan::new()
            .manifest(ManifestSeed::new("sync", "sync").every_seconds(300).priority(32));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_duplicate_external_id_rejected() {
        let plan = SeedPlan::new()
            .manifest(ManifestSeed::new("sync", "sync").every_seconds(300))
            .group(
                GroupSeed::new("etl")
                    .manifest(ManifestSeed::new("sync", "sync").on_demand()),
            );
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_dependents_batch_sets_parent() {
        let plan = SeedPlan::new()
            .manifest(ManifestSeed::new("extract", "etl").every_seconds(3600))
            .dependents(
                "extract",
                [
                    ManifestSeed::new("transform", "etl"),
                    ManifestSeed::new("load", "etl"),
                ],
            );
        plan.validate().unwrap();
        let parents: Vec<_> = plan
            .all_seeds()
            .filter_map(|s| s.parent_external_id())
            .collect();
        assert_eq!(parents, vec!["extract", "extract"]);
    }

    #[test]
    fn test_dormant_dependent_kind() {
        let built = ManifestSeed::new("audit", "audit")
            .dormant_after("extract")
            .build(None, Some(Uuid::new_v4()), &defaults())
            .unwrap();
        assert_eq!(built.schedule_kind, ScheduleKind::DormantDependent);
        assert!(built.depends_on.is_some());
    }
}
