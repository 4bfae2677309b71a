//! End-to-end worker pipeline over the in-memory task server: enqueue,
//! concurrent claim, execute, unconditional cleanup, and crash recovery
//! through the visibility timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use uuid::Uuid;

use conveyor_core::config::worker::WorkerConfig;
use conveyor_core::result::AppResult;
use conveyor_worker::{
    BackgroundTaskServer, CancellationRegistry, ClaimQueue, ClaimedJob, InMemoryTaskServer,
    JobExecutor, WorkerPool,
};

#[derive(Default)]
struct CountingExecutor {
    runs: DashMap<Uuid, usize>,
}

#[async_trait]
impl JobExecutor for CountingExecutor {
    async fn execute(&self, job: &ClaimedJob) -> AppResult<()> {
        *self.runs.entry(job.metadata_id).or_insert(0) += 1;
        Ok(())
    }
}

fn config(concurrency: usize) -> WorkerConfig {
    WorkerConfig {
        enabled: true,
        concurrency,
        poll_interval_seconds: 1,
        visibility_timeout_seconds: 60,
        shutdown_grace_seconds: 1,
        cancellation_poll_seconds: 1,
    }
}

async fn wait_empty(server: &InMemoryTaskServer) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !server.is_empty() {
        assert!(
            std::time::Instant::now() < deadline,
            "pipeline did not drain in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn pipeline_runs_every_enqueued_job_exactly_once() {
    let server = Arc::new(InMemoryTaskServer::new(Duration::from_secs(60)));
    let executor = Arc::new(CountingExecutor::default());

    let mut metadata_ids = Vec::new();
    for _ in 0..25 {
        let id = Uuid::new_v4();
        metadata_ids.push(id);
        server.enqueue(id).await.expect("enqueue");
    }

    let pool = WorkerPool::new(
        server.clone(),
        executor.clone(),
        Arc::new(CancellationRegistry::new()),
        config(8),
        "pipeline",
    );

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { pool.run(rx).await });

    wait_empty(&server).await;
    tx.send(true).expect("shutdown");
    handle.await.expect("join");

    assert_eq!(executor.runs.len(), 25);
    for id in metadata_ids {
        assert_eq!(*executor.runs.get(&id).expect("executed"), 1);
    }
}

#[tokio::test]
async fn abandoned_claim_is_recovered_after_visibility_timeout() {
    // Short visibility timeout so an abandoned claim expires quickly.
    let server = Arc::new(InMemoryTaskServer::new(Duration::from_millis(50)));
    let executor = Arc::new(CountingExecutor::default());

    let metadata_id = Uuid::new_v4();
    server.enqueue(metadata_id).await.expect("enqueue");

    // Simulate a worker that claimed the job and crashed before cleanup.
    let abandoned = server.claim().await.expect("claim").expect("job");
    assert_eq!(abandoned.metadata_id, metadata_id);

    // Not yet reclaimable.
    assert!(server.claim().await.expect("claim").is_none());

    tokio::time::sleep(Duration::from_millis(80)).await;

    let pool = WorkerPool::new(
        server.clone(),
        executor.clone(),
        Arc::new(CancellationRegistry::new()),
        config(2),
        "recovery",
    );

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { pool.run(rx).await });

    wait_empty(&server).await;
    tx.send(true).expect("shutdown");
    handle.await.expect("join");

    assert_eq!(*executor.runs.get(&metadata_id).expect("executed"), 1);
}

#[tokio::test]
async fn ad_hoc_input_travels_with_the_job() {
    let server = Arc::new(InMemoryTaskServer::new(Duration::from_secs(60)));
    let metadata_id = Uuid::new_v4();
    let input = serde_json::json!({"region": "eu-west", "full": true});

    server
        .enqueue_with_input(metadata_id, "report", input.clone())
        .await
        .expect("enqueue");

    let job = server.claim().await.expect("claim").expect("job");
    assert_eq!(job.metadata_id, metadata_id);
    assert_eq!(job.input_kind.as_deref(), Some("report"));
    assert_eq!(job.input, Some(input));
}
