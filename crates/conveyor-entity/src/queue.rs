//! Work-queue entity: a staged "this manifest is due" decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A due manifest awaiting dispatch.
///
/// At most one live row exists per manifest; the dispatcher deletes the
/// row in the same transaction that creates the execution record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkQueueEntry {
    /// Unique entry identifier.
    pub id: Uuid,
    /// The manifest that is due.
    pub manifest_id: Uuid,
    /// When the decision was staged.
    pub enqueued_at: DateTime<Utc>,
    /// Dispatch priority, copied from the manifest at enqueue time.
    pub priority: i32,
}
