//! Metadata entity: one concrete execution attempt of a manifest.

pub mod model;
pub mod state;
