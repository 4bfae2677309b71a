//! Dead-letter entity: an execution that exhausted its retry budget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A record of a manifest whose executions exhausted the retry budget,
/// awaiting manual resolution.
///
/// Immutable once created except for the acknowledgement fields, and
/// retained for audit even after resolution.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeadLetter {
    /// Unique dead-letter identifier.
    pub id: Uuid,
    /// The manifest whose executions failed.
    pub manifest_id: Uuid,
    /// Why the manifest was dead-lettered.
    pub reason: String,
    /// When the dead letter was created.
    pub created_at: DateTime<Utc>,
    /// Whether an operator acknowledged the failure.
    pub acknowledged: bool,
    /// Operator note attached at acknowledgement.
    pub acknowledgement_note: Option<String>,
    /// When the dead letter was resolved (retried or acknowledged).
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DeadLetter {
    /// Check whether this dead letter still awaits operator intervention.
    pub fn awaits_intervention(&self) -> bool {
        self.resolved_at.is_none()
    }
}
