//! Conveyor Server — workflow scheduling and dispatch platform.
//!
//! Main entry point that wires the crates together: configuration,
//! database, startup recovery, the manifest-manager and job-dispatcher
//! poll loops, and the worker pool.

mod workflows;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt};

use conveyor_core::config::AppConfig;
use conveyor_core::error::AppError;
use conveyor_core::registry::{ActivationRegistry, ToggleRegistry};
use conveyor_database::DatabasePool;
use conveyor_database::repositories::{
    BackgroundJobRepository, DeadLetterRepository, GroupRepository, ManifestRepository,
    MetadataRepository, WorkQueueRepository,
};
use conveyor_scheduler::{DeadLetterService, JobDispatcher, ManifestManager, run_startup_recovery};
use conveyor_worker::executor::{HandlerRegistry, WorkflowLauncher};
use conveyor_worker::task_server::{BackgroundTaskServer, ClaimQueue, JobExecutor};
use conveyor_worker::{CancellationRegistry, PostgresTaskServer, WorkerPool};

#[tokio::main]
async fn main() {
    let env = std::env::var("CONVEYOR_ENV").unwrap_or_else(|_| "development".to_string());
    let config = match AppConfig::load(&env) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config);

    if let Err(e) = run(config).await {
        tracing::error!("Server error: {e}");
        std::process::exit(1);
    }
}

/// Initialize tracing/logging
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        _ => {
            fmt().pretty().with_env_filter(filter).with_target(true).init();
        }
    }
}

/// Main server run function
async fn run(config: AppConfig) -> Result<(), AppError> {
    tracing::info!("Starting Conveyor v{}", env!("CARGO_PKG_VERSION"));

    // ── Step 1: Database connection + migrations ─────────────────
    let db = Arc::new(DatabasePool::connect(&config.database).await?);
    conveyor_database::migration::run_migrations(db.pool()).await?;
    tracing::info!("Database migrations complete");

    // ── Step 2: Repositories ─────────────────────────────────────
    let pool = db.pool().clone();
    let manifests = ManifestRepository::new(pool.clone());
    let metadata = MetadataRepository::new(pool.clone());
    let groups = GroupRepository::new(pool.clone());
    let work_queue = WorkQueueRepository::new(pool.clone());
    let dead_letters = DeadLetterRepository::new(pool.clone());
    let background_jobs = BackgroundJobRepository::new(pool.clone());

    // ── Step 3: Registries and task server ───────────────────────
    let toggles = Arc::new(ToggleRegistry::new());
    let activations = Arc::new(ActivationRegistry::new());
    let cancellations = Arc::new(CancellationRegistry::new());

    let task_server = Arc::new(PostgresTaskServer::new(
        background_jobs,
        config.worker.visibility_timeout_seconds,
    ));
    let enqueue: Arc<dyn BackgroundTaskServer> = task_server.clone();
    let claim_queue: Arc<dyn ClaimQueue> = task_server.clone();

    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(workflows::HeartbeatWorkflow::new(Arc::clone(&db))));
    let handlers = Arc::new(handlers);

    // ── Step 4: Startup recovery, before any loop polls ──────────
    let seed_plan = workflows::builtin_seed_plan();
    run_startup_recovery(
        &pool,
        &metadata,
        &groups,
        &manifests,
        &seed_plan,
        &config.scheduler,
    )
    .await?;

    // ── Step 5: Services and poll loops ──────────────────────────
    let dead_letter_service = Arc::new(DeadLetterService::new(
        dead_letters,
        metadata.clone(),
        manifests.clone(),
        Arc::clone(&enqueue),
    ));

    let manager = Arc::new(ManifestManager::new(
        manifests.clone(),
        metadata.clone(),
        work_queue.clone(),
        Arc::clone(&dead_letter_service),
        Arc::clone(&toggles),
        Arc::clone(&activations),
        config.scheduler.clone(),
    ));

    let dispatcher = Arc::new(JobDispatcher::new(
        pool.clone(),
        work_queue,
        metadata.clone(),
        groups,
        Arc::clone(&enqueue),
        Arc::clone(&toggles),
        config.scheduler.clone(),
    ));

    let launcher: Arc<dyn JobExecutor> = Arc::new(WorkflowLauncher::new(
        metadata,
        manifests,
        handlers,
        Arc::clone(&cancellations),
        Arc::clone(&activations),
        Duration::from_secs(config.worker.cancellation_poll_seconds),
    ));

    // ── Step 6: Spawn everything under one shutdown channel ──────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    {
        let manager = Arc::clone(&manager);
        let cancel = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { manager.run(cancel).await }));
    }
    {
        let dispatcher = Arc::clone(&dispatcher);
        let cancel = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { dispatcher.run(cancel).await }));
    }

    if config.worker.enabled {
        let worker_name = format!("worker-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let worker_pool = WorkerPool::new(
            claim_queue,
            launcher,
            Arc::clone(&cancellations),
            config.worker.clone(),
            worker_name,
        );
        let cancel = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { worker_pool.run(cancel).await }));
    } else {
        tracing::info!("Worker pool disabled; this node only schedules");
    }

    if config.dead_letter.auto_purge {
        let service = Arc::clone(&dead_letter_service);
        let purge_config = config.dead_letter.clone();
        let purge_toggles = Arc::clone(&toggles);
        let cancel = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            service.run_auto_purge(purge_config, purge_toggles, cancel).await;
        }));
    }

    tracing::info!("Conveyor server running");

    // ── Step 7: Graceful shutdown ────────────────────────────────
    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown...");
    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(config.worker.shutdown_grace_seconds + 10);
    for handle in handles {
        let _ = tokio::time::timeout(grace, handle).await;
    }

    db.close().await;
    tracing::info!("Conveyor server shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
