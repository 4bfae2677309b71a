//! Repository implementations, one per persisted entity.

pub mod background_job;
pub mod dead_letter;
pub mod group;
pub mod manifest;
pub mod metadata;
pub mod work_queue;

pub use background_job::BackgroundJobRepository;
pub use dead_letter::DeadLetterRepository;
pub use group::GroupRepository;
pub use manifest::ManifestRepository;
pub use metadata::MetadataRepository;
pub use work_queue::WorkQueueRepository;
