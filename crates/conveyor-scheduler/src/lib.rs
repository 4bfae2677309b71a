//! # conveyor-scheduler
//!
//! The decision side of the scheduling core:
//! - A pure due-time evaluator for cron/interval manifests
//! - The manifest-manager poll loop (reap, determine, enqueue)
//! - The job-dispatcher poll loop (priority claim, transactional dispatch)
//! - The dead-letter service
//! - Startup recovery and the fluent seed plan

pub mod dead_letter;
pub mod dispatcher;
pub mod due;
pub mod manager;
pub mod recovery;
pub mod seed;

pub use dead_letter::{DeadLetterService, DeadLetterStatistics};
pub use dispatcher::JobDispatcher;
pub use manager::{Decision, ManifestManager, SkipReason, TickSummary};
pub use recovery::{RecoveryReport, run_startup_recovery};
pub use seed::{GroupSeed, ManifestSeed, ScheduleSpec, SeedPlan, SeedReport};
