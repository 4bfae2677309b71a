//! Workflow handler registry and the launcher that runs one claimed job.
//!
//! Handlers are resolved through an explicit registry keyed by the
//! manifest's `workflow_kind` discriminator, populated at startup. Every
//! execution outcome is recorded on the metadata record; the worker loop
//! never sees a workflow error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use conveyor_core::error::AppError;
use conveyor_core::registry::ActivationRegistry;
use conveyor_core::result::AppResult;
use conveyor_database::repositories::{ManifestRepository, MetadataRepository};
use conveyor_entity::manifest::model::Manifest;

use crate::cancellation::CancellationRegistry;
use crate::task_server::{ClaimedJob, JobExecutor};

/// Error from a workflow execution.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// The workflow failed at a named step.
    #[error("workflow failed at step '{step}': {reason}")]
    Failed {
        /// The step that failed.
        step: String,
        /// Why it failed.
        reason: String,
    },

    /// The workflow observed a cancellation request.
    #[error("workflow cancelled")]
    Cancelled,

    /// Infrastructure error (database, serialization).
    #[error(transparent)]
    Internal(#[from] AppError),
}

/// Execution-scoped services handed to a workflow handler.
///
/// The context carries the cooperative cancellation seam: handlers call
/// [`WorkflowContext::enter_step`] at step boundaries, which records
/// progress and re-checks both the in-process token and (rate-limited)
/// the persisted cancellation flag.
pub struct WorkflowContext {
    metadata_id: Uuid,
    metadata: MetadataRepository,
    token: CancellationToken,
    activations: Arc<ActivationRegistry>,
    cancellation_poll: Duration,
    last_flag_poll: Mutex<Option<Instant>>,
}

impl WorkflowContext {
    /// The execution record this workflow runs under.
    pub fn metadata_id(&self) -> Uuid {
        self.metadata_id
    }

    /// Check for cancellation without recording progress.
    ///
    /// The in-process token is checked on every call; the persisted flag
    /// is re-read at most once per configured poll interval, so the
    /// worst-case cross-process cancellation latency is one step boundary
    /// plus that interval.
    pub async fn check_cancelled(&self) -> Result<(), WorkflowError> {
        if self.token.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }

        let should_poll = {
            let mut last = self.last_flag_poll.lock().expect("poll clock poisoned");
            match *last {
                Some(at) if at.elapsed() < self.cancellation_poll => false,
                _ => {
                    *last = Some(Instant::now());
                    true
                }
            }
        };

        if should_poll && self.metadata.cancellation_requested(self.metadata_id).await? {
            self.token.cancel();
            return Err(WorkflowError::Cancelled);
        }

        Ok(())
    }

    /// Mark the start of a named step and check for cancellation.
    pub async fn enter_step(&self, step: &str) -> Result<(), WorkflowError> {
        self.check_cancelled().await?;
        self.metadata.update_progress(self.metadata_id, step).await?;
        Ok(())
    }

    /// Activate a dormant-dependent manifest so the next manager cycle
    /// enqueues it.
    pub fn activate_dormant(&self, manifest_id: Uuid) {
        self.activations.activate(manifest_id);
    }
}

/// Decide whether a manifest's last-successful-run marker may advance
/// after a workflow returned success.
///
/// The completion transition must have actually been recorded: a record
/// that already left `InProgress` (another node's startup recovery
/// failed it mid-run, say) stays in its recorded state, and advancing
/// the marker anyway would fire dependents off a run persisted as
/// failed.
fn should_advance_last_run(completion_recorded: bool, manifest: Option<&Manifest>) -> Option<Uuid> {
    manifest.filter(|_| completion_recorded).map(|m| m.id)
}

/// Trait every workflow implementation satisfies.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    /// The workflow kind this handler executes.
    fn kind(&self) -> &str;

    /// Run the workflow with the given input.
    async fn execute(
        &self,
        ctx: &WorkflowContext,
        input: Option<Value>,
    ) -> Result<Option<Value>, WorkflowError>;
}

/// Registry mapping workflow kinds to handlers, populated at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn WorkflowHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow handler.
    pub fn register(&mut self, handler: Arc<dyn WorkflowHandler>) {
        let kind = handler.kind().to_string();
        info!(kind, "Registered workflow handler");
        self.handlers.insert(kind, handler);
    }

    /// Look up the handler for a workflow kind.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn WorkflowHandler>> {
        self.handlers.get(kind).cloned()
    }

    /// Check if a handler is registered for a workflow kind.
    pub fn has(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// List the registered workflow kinds.
    pub fn kinds(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

/// Runs one claimed job: verifies the execution record is pending,
/// resolves the handler, executes it under a cancellation token, and
/// records the outcome.
pub struct WorkflowLauncher {
    metadata: MetadataRepository,
    manifests: ManifestRepository,
    registry: Arc<HandlerRegistry>,
    cancellations: Arc<CancellationRegistry>,
    activations: Arc<ActivationRegistry>,
    cancellation_poll: Duration,
}

impl WorkflowLauncher {
    /// Create a new launcher.
    pub fn new(
        metadata: MetadataRepository,
        manifests: ManifestRepository,
        registry: Arc<HandlerRegistry>,
        cancellations: Arc<CancellationRegistry>,
        activations: Arc<ActivationRegistry>,
        cancellation_poll: Duration,
    ) -> Self {
        Self {
            metadata,
            manifests,
            registry,
            cancellations,
            activations,
            cancellation_poll,
        }
    }

    async fn record_failure(
        &self,
        metadata_id: Uuid,
        step: Option<&str>,
        reason: &str,
        details: Option<&str>,
    ) -> AppResult<()> {
        self.metadata.fail(metadata_id, step, reason, details).await
    }
}

#[async_trait]
impl JobExecutor for WorkflowLauncher {
    async fn execute(&self, job: &ClaimedJob) -> AppResult<()> {
        // Pending-state check: duplicate deliveries and reclaimed rows for
        // already-finished executions stop here.
        let Some(metadata) = self.metadata.mark_in_progress(job.metadata_id).await? else {
            warn!(
                metadata_id = %job.metadata_id,
                "Skipping job: execution record is not pending"
            );
            return Ok(());
        };

        let manifest = match metadata.manifest_id {
            Some(manifest_id) => self.manifests.find_by_id(manifest_id).await?,
            None => None,
        };

        let kind = match (&manifest, &job.input_kind) {
            (Some(m), _) => m.workflow_kind.clone(),
            (None, Some(kind)) => kind.clone(),
            (None, None) => {
                self.record_failure(
                    metadata.id,
                    None,
                    "no workflow kind: record has neither manifest nor input kind",
                    None,
                )
                .await?;
                return Ok(());
            }
        };

        let Some(handler) = self.registry.get(&kind) else {
            self.record_failure(
                metadata.id,
                None,
                &format!("no workflow handler registered for kind '{kind}'"),
                None,
            )
            .await?;
            return Ok(());
        };

        let token = self.cancellations.register(metadata.id);
        let ctx = WorkflowContext {
            metadata_id: metadata.id,
            metadata: self.metadata.clone(),
            token,
            activations: Arc::clone(&self.activations),
            cancellation_poll: self.cancellation_poll,
            last_flag_poll: Mutex::new(None),
        };

        let input = job.input.clone().or_else(|| metadata.input.clone());
        let outcome = handler.execute(&ctx, input).await;
        self.cancellations.unregister(metadata.id);

        match outcome {
            Ok(output) => {
                let recorded = self.metadata.complete(metadata.id, output.as_ref()).await?;
                if let Some(manifest_id) = should_advance_last_run(recorded, manifest.as_ref()) {
                    self.manifests
                        .set_last_successful_run(manifest_id, Utc::now())
                        .await?;
                }
                if recorded {
                    info!(metadata_id = %metadata.id, kind, "Workflow completed");
                } else {
                    warn!(
                        metadata_id = %metadata.id,
                        kind,
                        "Workflow succeeded but its record had already left in-progress; success not recorded"
                    );
                }
            }
            Err(WorkflowError::Cancelled) => {
                self.record_failure(metadata.id, None, "cancelled by request", None)
                    .await?;
                info!(metadata_id = %metadata.id, kind, "Workflow cancelled");
            }
            Err(WorkflowError::Failed { step, reason }) => {
                self.record_failure(metadata.id, Some(&step), &reason, None)
                    .await?;
                warn!(metadata_id = %metadata.id, kind, step, reason, "Workflow failed");
            }
            Err(WorkflowError::Internal(err)) => {
                let details = format!("{err:?}");
                self.record_failure(metadata.id, None, &err.to_string(), Some(&details))
                    .await?;
                warn!(metadata_id = %metadata.id, kind, error = %err, "Workflow failed internally");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl WorkflowHandler for NoopHandler {
        fn kind(&self) -> &str {
            "noop"
        }

        async fn execute(
            &self,
            _ctx: &WorkflowContext,
            input: Option<Value>,
        ) -> Result<Option<Value>, WorkflowError> {
            Ok(input)
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(NoopHandler));

        assert!(registry.has("noop"));
        assert!(!registry.has("missing"));
        assert!(registry.get("noop").is_some());
        assert_eq!(registry.kinds(), vec!["noop".to_string()]);
    }

    #[test]
    fn test_registry_replaces_on_same_kind() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(NoopHandler));
        registry.register(Arc::new(NoopHandler));
        assert_eq!(registry.kinds().len(), 1);
    }

    fn manifest() -> Manifest {
        use conveyor_entity::manifest::schedule::ScheduleKind;

        Manifest {
            id: Uuid::new_v4(),
            external_id: "etl.sync".to_string(),
            name: "Sync".to_string(),
            workflow_kind: "sync".to_string(),
            input: None,
            schedule_kind: ScheduleKind::Interval,
            cron_expression: None,
            interval_seconds: Some(300),
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
    fn test_last_run_advances_only_when_completion_recorded() {
        let m = manifest();
        assert_eq!(should_advance_last_run(true, Some(&m)), Some(m.id));
        // The record left in-progress under our feet (e.g. failed by
        // another node's startup recovery): the manifest must not be
        // marked successful, or dependents would fire off a failed run.
        assert_eq!(should_advance_last_run(false, Some(&m)), None);
    }

    #[test]
    fn test_ad_hoc_runs_never_advance_a_manifest() {
        assert_eq!(should_advance_last_run(true, None), None);
        assert_eq!(should_advance_last_run(false, None), None);
    }
}
