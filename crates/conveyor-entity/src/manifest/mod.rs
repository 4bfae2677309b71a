//! Manifest entity: a persisted job definition.

pub mod model;
pub mod schedule;
