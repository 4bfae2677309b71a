//! # conveyor-database
//!
//! PostgreSQL connection management and concrete repository
//! implementations for all Conveyor entities, including the skip-locked
//! claim queries that serialize work distribution.

pub mod connection;
pub mod migration;
pub mod repositories;

pub use connection::DatabasePool;
