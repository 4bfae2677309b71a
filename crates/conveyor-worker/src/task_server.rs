//! Task-server abstractions decoupling the scheduler from any specific
//! execution substrate.
//!
//! The dispatcher only needs "enqueue a unit of work for this execution
//! record"; the worker pool only needs "claim the next unit" and "remove
//! a finished unit". Implementations must guarantee at-least-once
//! invocation of the executor for each enqueued metadata id — the
//! Pending-state check in the executor absorbs duplicate deliveries.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use conveyor_core::result::AppResult;

/// A claimed unit of work handed to the executor.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    /// Task id assigned at enqueue time.
    pub task_id: Uuid,
    /// The execution record to carry out.
    pub metadata_id: Uuid,
    /// Input kind discriminator for ad-hoc executions.
    pub input_kind: Option<String>,
    /// Ad-hoc input payload, if any.
    pub input: Option<Value>,
}

/// Provider-agnostic "enqueue a unit of work" abstraction.
#[async_trait]
pub trait BackgroundTaskServer: Send + Sync {
    /// Enqueue execution of the given record. Returns the task id.
    async fn enqueue(&self, metadata_id: Uuid) -> AppResult<Uuid>;

    /// Enqueue execution with an explicit ad-hoc input. Returns the
    /// task id.
    async fn enqueue_with_input(
        &self,
        metadata_id: Uuid,
        input_kind: &str,
        input: Value,
    ) -> AppResult<Uuid>;

    /// Access the transactional enqueue path, when the implementation
    /// shares the scheduler's database. The dispatcher uses this to
    /// commit the execution record, the queue-row deletion, and the
    /// enqueue atomically.
    fn transactional(&self) -> Option<&dyn TransactionalTaskServer> {
        None
    }
}

/// Transactional enqueue extension for task servers backed by the same
/// relational store as the scheduler.
#[async_trait]
pub trait TransactionalTaskServer: Send + Sync {
    /// Enqueue inside the caller's transaction.
    async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        metadata_id: Uuid,
        input_kind: Option<&str>,
        input: Option<&Value>,
    ) -> AppResult<Uuid>;
}

/// The claim side of a task server, consumed by the worker pool.
#[async_trait]
pub trait ClaimQueue: Send + Sync {
    /// Atomically claim the next claimable unit of work, or `None` when
    /// the queue is empty. A claim that is never removed becomes
    /// claimable again once the visibility timeout elapses.
    async fn claim(&self) -> AppResult<Option<ClaimedJob>>;

    /// Remove a finished unit of work. Returns whether it was still
    /// present.
    async fn remove(&self, task_id: Uuid) -> AppResult<bool>;
}

/// Executes one claimed unit of work end to end.
///
/// Implementations record every execution outcome themselves; an `Err`
/// means only that the outcome could not be recorded.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Run the claimed job to completion, success or failure.
    async fn execute(&self, job: &ClaimedJob) -> AppResult<()>;
}
