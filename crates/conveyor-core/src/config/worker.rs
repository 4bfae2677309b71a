//! Worker pool configuration.

use serde::{Deserialize, Serialize};

/// Background job worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Whether the worker pool is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of concurrent job executions.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Interval in seconds between claim attempts when the queue is empty.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Seconds after which an unfinished claim becomes reclaimable.
    ///
    /// Must exceed the slowest expected legitimate execution; claims are
    /// only recovered through this timeout.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_seconds: u64,
    /// Grace period in seconds between "stop accepting work" and
    /// hard-cancelling in-flight executions on shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
    /// Interval in seconds at which executing workflows re-read the
    /// persisted cancellation flag. Worst-case cross-process cancellation
    /// latency is one step boundary plus this interval.
    #[serde(default = "default_cancellation_poll")]
    pub cancellation_poll_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: default_concurrency(),
            poll_interval_seconds: default_poll_interval(),
            visibility_timeout_seconds: default_visibility_timeout(),
            shutdown_grace_seconds: default_shutdown_grace(),
            cancellation_poll_seconds: default_cancellation_poll(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    5
}

fn default_visibility_timeout() -> u64 {
    1800
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_cancellation_poll() -> u64 {
    10
}
