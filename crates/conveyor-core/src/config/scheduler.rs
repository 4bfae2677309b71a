//! Scheduler poll-loop configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the manifest-manager and job-dispatcher poll loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between manifest-manager ticks (due evaluation + enqueue).
    #[serde(default = "default_manager_poll")]
    pub manager_poll_seconds: u64,
    /// Seconds between job-dispatcher ticks (work-queue claim + dispatch).
    #[serde(default = "default_dispatcher_poll")]
    pub dispatcher_poll_seconds: u64,
    /// Default retry budget for manifests that do not specify one.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: i32,
    /// Default per-execution timeout in seconds, for operator visibility.
    #[serde(default = "default_job_timeout")]
    pub default_timeout_seconds: i64,
    /// Base delay in seconds before a failed manifest is reconsidered.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    /// Multiplier applied to the retry delay per consecutive failure.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on the computed retry delay in seconds.
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_seconds: u64,
    /// Whether startup recovery fails orphaned in-progress executions.
    #[serde(default = "default_true")]
    pub recover_stuck_jobs: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            manager_poll_seconds: default_manager_poll(),
            dispatcher_poll_seconds: default_dispatcher_poll(),
            default_max_retries: default_max_retries(),
            default_timeout_seconds: default_job_timeout(),
            retry_delay_seconds: default_retry_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retry_delay_seconds: default_max_retry_delay(),
            recover_stuck_jobs: default_true(),
        }
    }
}

impl SchedulerConfig {
    /// Compute the backoff delay in seconds for the given consecutive
    /// failure count, capped at `max_retry_delay_seconds`.
    pub fn backoff_seconds(&self, failures: u32) -> u64 {
        if failures == 0 {
            return 0;
        }
        let delay =
            self.retry_delay_seconds as f64 * self.backoff_multiplier.powi(failures as i32 - 1);
        (delay as u64).min(self.max_retry_delay_seconds)
    }
}

fn default_manager_poll() -> u64 {
    30
}

fn default_dispatcher_poll() -> u64 {
    5
}

fn default_max_retries() -> i32 {
    3
}

fn default_job_timeout() -> i64 {
    3600
}

fn default_retry_delay() -> u64 {
    60
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_retry_delay() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_progression() {
        let config = SchedulerConfig::default();
        assert_eq!(config.backoff_seconds(0), 0);
        assert_eq!(config.backoff_seconds(1), 60);
        assert_eq!(config.backoff_seconds(2), 120);
        assert_eq!(config.backoff_seconds(3), 240);
    }

    #[test]
    fn test_backoff_capped() {
        let config = SchedulerConfig::default();
        assert_eq!(config.backoff_seconds(20), 3600);
    }
}
