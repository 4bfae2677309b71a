//! Built-in workflows shipped with the server binary.
//!
//! Applications embedding the Conveyor crates register their own
//! handlers; the standalone server carries a heartbeat workflow so a
//! fresh deployment exercises the whole pipeline end to end.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use conveyor_database::DatabasePool;
use conveyor_scheduler::{ManifestSeed, SeedPlan};
use conveyor_worker::executor::{WorkflowContext, WorkflowError, WorkflowHandler};

/// Workflow kind of the built-in heartbeat.
pub const HEARTBEAT_KIND: &str = "conveyor.heartbeat";

/// External ID of the seeded heartbeat manifest.
pub const HEARTBEAT_EXTERNAL_ID: &str = "conveyor.heartbeat";

/// Periodic self-check: verifies database connectivity and reports the
/// observation time as output.
pub struct HeartbeatWorkflow {
    db: Arc<DatabasePool>,
}

impl HeartbeatWorkflow {
    /// Create the heartbeat workflow.
    pub fn new(db: Arc<DatabasePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl WorkflowHandler for HeartbeatWorkflow {
    fn kind(&self) -> &str {
        HEARTBEAT_KIND
    }

    async fn execute(
        &self,
        ctx: &WorkflowContext,
        _input: Option<Value>,
    ) -> Result<Option<Value>, WorkflowError> {
        ctx.enter_step("check-database").await?;
        let healthy = self.db.health_check().await?;
        if !healthy {
            return Err(WorkflowError::Failed {
                step: "check-database".to_string(),
                reason: "database health check returned unhealthy".to_string(),
            });
        }
        Ok(Some(json!({ "observed_at": Utc::now() })))
    }
}

/// Seed plan for the standalone server: the heartbeat every five
/// minutes.
pub fn builtin_seed_plan() -> SeedPlan {
    SeedPlan::new().manifest(
        ManifestSeed::new(HEARTBEAT_EXTERNAL_ID, HEARTBEAT_KIND)
            .name("Conveyor heartbeat")
            .every_seconds(300)
            .max_retries(3)
            .timeout_seconds(60),
    )
}
