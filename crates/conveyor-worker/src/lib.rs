//! # conveyor-worker
//!
//! The execution side of the scheduling core:
//! - A provider-agnostic [`BackgroundTaskServer`] enqueue abstraction,
//!   with Postgres-backed and in-memory implementations
//! - A worker pool that claims units of work through a visibility-timeout
//!   protocol and runs them through the workflow handler registry
//! - The in-process cancellation registry paired with the persisted
//!   cancellation flag

pub mod cancellation;
pub mod executor;
pub mod memory;
pub mod postgres;
pub mod runner;
pub mod task_server;

pub use cancellation::CancellationRegistry;
pub use executor::{HandlerRegistry, WorkflowContext, WorkflowError, WorkflowHandler, WorkflowLauncher};
pub use memory::InMemoryTaskServer;
pub use postgres::PostgresTaskServer;
pub use runner::WorkerPool;
pub use task_server::{BackgroundTaskServer, ClaimQueue, ClaimedJob, JobExecutor};
