//! Workflow state enumeration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an execution record.
///
/// Valid transitions are `Pending → InProgress → {Completed, Failed}`
/// only; terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "workflow_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Dispatched but not yet picked up by a worker.
    Pending,
    /// Currently executing.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with a failure.
    Failed,
}

impl WorkflowState {
    /// Check if the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check whether a transition to `next` is allowed.
    pub fn can_transition_to(&self, next: WorkflowState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
        )
    }

    /// Return the state as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
