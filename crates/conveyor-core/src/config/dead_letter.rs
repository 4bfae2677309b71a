//! Dead-letter retention configuration.

use serde::{Deserialize, Serialize};

/// Dead-letter retention and auto-purge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// Whether acknowledged dead letters are purged automatically.
    #[serde(default)]
    pub auto_purge: bool,
    /// Minimum age in days before a dead letter is eligible for purge.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Seconds between auto-purge sweeps, when enabled.
    #[serde(default = "default_purge_interval")]
    pub purge_interval_seconds: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            auto_purge: false,
            retention_days: default_retention_days(),
            purge_interval_seconds: default_purge_interval(),
        }
    }
}

fn default_retention_days() -> u32 {
    30
}

fn default_purge_interval() -> u64 {
    86400
}
