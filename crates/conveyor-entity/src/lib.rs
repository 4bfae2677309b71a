//! # conveyor-entity
//!
//! Persisted data model for Conveyor: job definitions (manifests and
//! their groups), execution records (metadata), and the transient
//! work-queue / background-job staging rows, plus dead letters.

pub mod background_job;
pub mod dead_letter;
pub mod group;
pub mod manifest;
pub mod metadata;
pub mod queue;

pub use background_job::BackgroundJob;
pub use dead_letter::DeadLetter;
pub use group::ManifestGroup;
pub use manifest::model::Manifest;
pub use manifest::schedule::ScheduleKind;
pub use metadata::model::Metadata;
pub use metadata::state::WorkflowState;
pub use queue::WorkQueueEntry;
