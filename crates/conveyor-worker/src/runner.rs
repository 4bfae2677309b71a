//! Worker pool — claims units of work and executes them.
//!
//! Each claim is a single atomic statement against the task server; no
//! application-level lock exists. A worker that dies mid-execution simply
//! leaves its claim to expire: once the visibility timeout elapses the
//! row becomes claimable again, which is the only recovery mechanism.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::time;
use tracing::{error, info, trace, warn};

use conveyor_core::config::worker::WorkerConfig;

use crate::cancellation::CancellationRegistry;
use crate::task_server::{ClaimQueue, JobExecutor};

/// Pool of concurrent claim-execute-cleanup loops over a task server.
pub struct WorkerPool {
    queue: Arc<dyn ClaimQueue>,
    executor: Arc<dyn JobExecutor>,
    cancellations: Arc<CancellationRegistry>,
    config: WorkerConfig,
    name: String,
}

impl WorkerPool {
    /// Create a new worker pool.
    pub fn new(
        queue: Arc<dyn ClaimQueue>,
        executor: Arc<dyn JobExecutor>,
        cancellations: Arc<CancellationRegistry>,
        config: WorkerConfig,
        name: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            executor,
            cancellations,
            config,
            name: name.into(),
        }
    }

    /// Run the pool until the shutdown signal is received.
    ///
    /// On shutdown the pool stops claiming immediately, starts an
    /// independent timer that hard-cancels still-running executions after
    /// the grace period, and waits (bounded) for in-flight work to drain.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        info!(
            worker = %self.name,
            concurrency = self.config.concurrency,
            poll_interval = self.config.poll_interval_seconds,
            visibility_timeout = self.config.visibility_timeout_seconds,
            "Worker pool started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let poll_interval = Duration::from_secs(self.config.poll_interval_seconds);

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        info!(worker = %self.name, "Worker pool received shutdown signal");
                        break;
                    }
                }
                claimed = self.poll_and_execute(&semaphore) => {
                    if !claimed {
                        tokio::select! {
                            _ = cancel.changed() => {
                                if *cancel.borrow() {
                                    info!(worker = %self.name, "Worker pool shutting down");
                                    break;
                                }
                            }
                            _ = time::sleep(poll_interval) => {}
                        }
                    }
                }
            }
        }

        // Delayed hard-cancel decouples "stop accepting work" from
        // "cancel running work".
        let grace = Duration::from_secs(self.config.shutdown_grace_seconds);
        let cancellations = Arc::clone(&self.cancellations);
        tokio::spawn(async move {
            time::sleep(grace).await;
            if !cancellations.is_empty() {
                warn!("Shutdown grace period elapsed, cancelling in-flight executions");
                cancellations.cancel_all();
            }
        });

        info!(worker = %self.name, "Waiting for in-flight executions to finish");
        let max_permits = self.config.concurrency as u32;
        let _ = time::timeout(
            grace + Duration::from_secs(5),
            semaphore.acquire_many(max_permits),
        )
        .await;

        info!(worker = %self.name, "Worker pool shut down");
    }

    /// Claim one unit of work and spawn its execution. Returns whether a
    /// claim succeeded; the caller sleeps when it did not.
    async fn poll_and_execute(&self, semaphore: &Arc<Semaphore>) -> bool {
        let permit = match Arc::clone(semaphore).try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                trace!(worker = %self.name, "All execution slots occupied");
                return false;
            }
        };

        match self.queue.claim().await {
            Ok(Some(job)) => {
                let queue = Arc::clone(&self.queue);
                let executor = Arc::clone(&self.executor);
                let worker = self.name.clone();

                tokio::spawn(async move {
                    let _permit = permit;

                    trace!(
                        worker,
                        task_id = %job.task_id,
                        metadata_id = %job.metadata_id,
                        "Claimed background job"
                    );

                    if let Err(e) = executor.execute(&job).await {
                        // The executor records workflow outcomes itself;
                        // an error here means the outcome could not be
                        // persisted.
                        error!(
                            worker,
                            task_id = %job.task_id,
                            error = %e,
                            "Failed to record execution outcome"
                        );
                    }

                    // Cleanup is unconditional: the row must not double as
                    // an audit log. A failed delete self-heals through the
                    // visibility timeout.
                    match queue.remove(job.task_id).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(worker, task_id = %job.task_id, "Job row already removed")
                        }
                        Err(e) => warn!(
                            worker,
                            task_id = %job.task_id,
                            error = %e,
                            "Failed to delete job row; it will be reclaimed after the visibility timeout"
                        ),
                    }
                });
                true
            }
            Ok(None) => {
                drop(permit);
                trace!(worker = %self.name, "No claimable jobs");
                false
            }
            Err(e) => {
                drop(permit);
                error!(worker = %self.name, error = %e, "Failed to claim job");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use dashmap::DashSet;
    use uuid::Uuid;

    use conveyor_core::error::AppError;
    use conveyor_core::result::AppResult;

    use crate::memory::InMemoryTaskServer;
    use crate::task_server::{BackgroundTaskServer, ClaimedJob};

    #[derive(Default)]
    struct RecordingExecutor {
        executed: DashSet<Uuid>,
        duplicates: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl JobExecutor for RecordingExecutor {
        async fn execute(&self, job: &ClaimedJob) -> AppResult<()> {
            if !self.executed.insert(job.metadata_id) {
                self.duplicates.fetch_add(1, Ordering::SeqCst);
            }
            if self.fail {
                return Err(AppError::internal("simulated outcome-recording failure"));
            }
            Ok(())
        }
    }

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            enabled: true,
            concurrency: 4,
            poll_interval_seconds: 1,
            visibility_timeout_seconds: 60,
            shutdown_grace_seconds: 1,
            cancellation_poll_seconds: 1,
        }
    }

    async fn drain(server: &InMemoryTaskServer) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !server.is_empty() {
            assert!(std::time::Instant::now() < deadline, "queue did not drain");
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_pool_executes_each_job_once() {
        let server = Arc::new(InMemoryTaskServer::new(Duration::from_secs(60)));
        let executor = Arc::new(RecordingExecutor::default());
        let pool = WorkerPool::new(
            server.clone(),
            executor.clone(),
            Arc::new(CancellationRegistry::new()),
            test_config(),
            "test",
        );

        let mut expected = Vec::new();
        for _ in 0..10 {
            let metadata_id = Uuid::new_v4();
            expected.push(metadata_id);
            server.enqueue(metadata_id).await.expect("enqueue");
        }

        let (tx, rx) = watch::channel(false);
        let handle = {
            let server = server.clone();
            tokio::spawn(async move {
                let pool = pool;
                pool.run(rx).await;
                drop(server);
            })
        };

        drain(&server).await;
        tx.send(true).expect("signal shutdown");
        handle.await.expect("join pool");

        assert_eq!(executor.executed.len(), 10);
        assert_eq!(executor.duplicates.load(Ordering::SeqCst), 0);
        assert!(expected.iter().all(|id| executor.executed.contains(id)));
    }

    #[tokio::test]
    async fn test_cleanup_is_unconditional_on_executor_error() {
        let server = Arc::new(InMemoryTaskServer::new(Duration::from_secs(60)));
        let executor = Arc::new(RecordingExecutor {
            fail: true,
            ..Default::default()
        });
        let pool = WorkerPool::new(
            server.clone(),
            executor.clone(),
            Arc::new(CancellationRegistry::new()),
            test_config(),
            "test",
        );

        server.enqueue(Uuid::new_v4()).await.expect("enqueue");

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let pool = pool;
            pool.run(rx).await;
        });

        drain(&server).await;
        tx.send(true).expect("signal shutdown");
        handle.await.expect("join pool");

        assert_eq!(executor.executed.len(), 1);
        assert!(server.is_empty(), "row deleted despite executor error");
    }
}
