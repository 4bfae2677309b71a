//! Built-in task server backed by the `background_job` table.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use conveyor_core::result::AppResult;
use conveyor_database::repositories::BackgroundJobRepository;

use crate::task_server::{
    BackgroundTaskServer, ClaimQueue, ClaimedJob, TransactionalTaskServer,
};

/// Task server persisting units of work as `background_job` rows, claimed
/// by the worker pool through the skip-locked visibility-timeout
/// protocol.
#[derive(Debug, Clone)]
pub struct PostgresTaskServer {
    jobs: BackgroundJobRepository,
    visibility_timeout_seconds: u64,
}

impl PostgresTaskServer {
    /// Create a new Postgres-backed task server.
    pub fn new(jobs: BackgroundJobRepository, visibility_timeout_seconds: u64) -> Self {
        Self {
            jobs,
            visibility_timeout_seconds,
        }
    }
}

#[async_trait]
impl BackgroundTaskServer for PostgresTaskServer {
    async fn enqueue(&self, metadata_id: Uuid) -> AppResult<Uuid> {
        let job = self.jobs.enqueue(metadata_id, None, None).await?;
        debug!(task_id = %job.id, %metadata_id, "Enqueued background job");
        Ok(job.id)
    }

    async fn enqueue_with_input(
        &self,
        metadata_id: Uuid,
        input_kind: &str,
        input: Value,
    ) -> AppResult<Uuid> {
        let job = self
            .jobs
            .enqueue(metadata_id, Some(input_kind), Some(&input))
            .await?;
        debug!(task_id = %job.id, %metadata_id, input_kind, "Enqueued ad-hoc background job");
        Ok(job.id)
    }

    fn transactional(&self) -> Option<&dyn TransactionalTaskServer> {
        Some(self)
    }
}

#[async_trait]
impl TransactionalTaskServer for PostgresTaskServer {
    async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        metadata_id: Uuid,
        input_kind: Option<&str>,
        input: Option<&Value>,
    ) -> AppResult<Uuid> {
        let job = self
            .jobs
            .enqueue_in_tx(tx, metadata_id, input_kind, input)
            .await?;
        Ok(job.id)
    }
}

#[async_trait]
impl ClaimQueue for PostgresTaskServer {
    async fn claim(&self) -> AppResult<Option<ClaimedJob>> {
        let claimed = self
            .jobs
            .claim_next(self.visibility_timeout_seconds)
            .await?;
        Ok(claimed.map(|job| ClaimedJob {
            task_id: job.id,
            metadata_id: job.metadata_id,
            input_kind: job.input_kind,
            input: job.input,
        }))
    }

    async fn remove(&self, task_id: Uuid) -> AppResult<bool> {
        self.jobs.delete(task_id).await
    }
}
