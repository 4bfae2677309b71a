//! # conveyor-core
//!
//! Core crate for Conveyor. Contains configuration schemas, shared
//! in-process registries (effect toggles, dormant-dependent activations),
//! and the unified error system.
//!
//! This crate has **no** internal dependencies on other Conveyor crates.

pub mod config;
pub mod error;
pub mod registry;
pub mod result;

pub use error::AppError;
pub use result::AppResult;
