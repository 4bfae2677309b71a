//! In-memory task server, for tests and single-process embeddings.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use conveyor_core::result::AppResult;

use crate::task_server::{BackgroundTaskServer, ClaimQueue, ClaimedJob};

#[derive(Debug, Clone)]
struct MemJob {
    task_id: Uuid,
    metadata_id: Uuid,
    input_kind: Option<String>,
    input: Option<Value>,
    fetched_at: Option<Instant>,
}

/// Task server holding units of work in process memory.
///
/// Implements the same claim semantics as the Postgres server: oldest
/// claimable first, with stale claims (older than the visibility
/// timeout) becoming claimable again. The mutex plays the role the row
/// lock plays in Postgres.
#[derive(Debug)]
pub struct InMemoryTaskServer {
    jobs: Mutex<Vec<MemJob>>,
    visibility_timeout: Duration,
}

impl InMemoryTaskServer {
    /// Create an empty in-memory task server.
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            visibility_timeout,
        }
    }

    /// Number of queued units of work (claimed or not).
    pub fn len(&self) -> usize {
        self.jobs.lock().expect("task queue poisoned").len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, metadata_id: Uuid, input_kind: Option<String>, input: Option<Value>) -> Uuid {
        let task_id = Uuid::new_v4();
        self.jobs.lock().expect("task queue poisoned").push(MemJob {
            task_id,
            metadata_id,
            input_kind,
            input,
            fetched_at: None,
        });
        task_id
    }
}

#[async_trait]
impl BackgroundTaskServer for InMemoryTaskServer {
    async fn enqueue(&self, metadata_id: Uuid) -> AppResult<Uuid> {
        Ok(self.push(metadata_id, None, None))
    }

    async fn enqueue_with_input(
        &self,
        metadata_id: Uuid,
        input_kind: &str,
        input: Value,
    ) -> AppResult<Uuid> {
        Ok(self.push(metadata_id, Some(input_kind.to_string()), Some(input)))
    }
}

#[async_trait]
impl ClaimQueue for InMemoryTaskServer {
    async fn claim(&self) -> AppResult<Option<ClaimedJob>> {
        let now = Instant::now();
        let mut jobs = self.jobs.lock().expect("task queue poisoned");
        let claimable = jobs.iter_mut().find(|job| match job.fetched_at {
            None => true,
            Some(fetched) => now.duration_since(fetched) > self.visibility_timeout,
        });
        Ok(claimable.map(|job| {
            job.fetched_at = Some(now);
            ClaimedJob {
                task_id: job.task_id,
                metadata_id: job.metadata_id,
                input_kind: job.input_kind.clone(),
                input: job.input.clone(),
            }
        }))
    }

    async fn remove(&self, task_id: Uuid) -> AppResult<bool> {
        let mut jobs = self.jobs.lock().expect("task queue poisoned");
        let before = jobs.len();
        jobs.retain(|job| job.task_id != task_id);
        Ok(jobs.len() < before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_marks_row_invisible() {
        let server = InMemoryTaskServer::new(Duration::from_secs(60));
        let metadata_id = Uuid::new_v4();
        server.enqueue(metadata_id).await.expect("enqueue");

        let first = server.claim().await.expect("claim");
        assert_eq!(first.map(|j| j.metadata_id), Some(metadata_id));
        assert!(server.claim().await.expect("claim").is_none());
    }

    #[tokio::test]
    async fn test_stale_claim_is_reclaimable() {
        let server = InMemoryTaskServer::new(Duration::from_millis(10));
        server.enqueue(Uuid::new_v4()).await.expect("enqueue");

        let first = server.claim().await.expect("claim").expect("job");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = server.claim().await.expect("claim").expect("reclaim");
        assert_eq!(first.task_id, second.task_id);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let server = InMemoryTaskServer::new(Duration::from_secs(60));
        let task_id = server.enqueue(Uuid::new_v4()).await.expect("enqueue");

        assert!(server.remove(task_id).await.expect("remove"));
        assert!(!server.remove(task_id).await.expect("remove"));
        assert!(server.is_empty());
    }

    #[tokio::test]
    async fn test_claims_are_exclusive_under_contention() {
        use std::sync::Arc;

        let server = Arc::new(InMemoryTaskServer::new(Duration::from_secs(60)));
        let rows = 5;
        let workers = 16;
        for _ in 0..rows {
            server.enqueue(Uuid::new_v4()).await.expect("enqueue");
        }

        let mut handles = Vec::new();
        for _ in 0..workers {
            let server = Arc::clone(&server);
            handles.push(tokio::spawn(async move { server.claim().await.expect("claim") }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(job) = handle.await.expect("join") {
                claimed.push(job.task_id);
            }
        }

        claimed.sort();
        claimed.dedup();
        assert_eq!(claimed.len(), rows, "each row claimed exactly once");
    }
}
