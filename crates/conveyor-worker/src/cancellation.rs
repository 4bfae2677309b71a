//! In-process cancellation registry.
//!
//! Maps execution-record ids to cancellation tokens so a cancel request
//! in the same process takes effect immediately. Cross-process requests
//! go through the persisted `cancellation_requested` flag instead and
//! are observed at the next step boundary.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Registry of cancellation handles for executions running in this
/// process.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: DashMap<Uuid, CancellationToken>,
}

impl CancellationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for an execution. Replaces any stale entry
    /// left by a previous attempt.
    pub fn register(&self, metadata_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.insert(metadata_id, token.clone());
        token
    }

    /// Remove the token for an execution once it finishes.
    pub fn unregister(&self, metadata_id: Uuid) {
        self.tokens.remove(&metadata_id);
    }

    /// Trigger cancellation for an execution running in this process.
    /// Returns whether a running execution was found.
    pub fn cancel(&self, metadata_id: Uuid) -> bool {
        match self.tokens.get(&metadata_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Trigger cancellation for every registered execution. Used by the
    /// delayed hard-cancel timer during shutdown.
    pub fn cancel_all(&self) {
        for entry in self.tokens.iter() {
            entry.value().cancel();
        }
    }

    /// Number of executions currently registered.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no executions are registered.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_registered_execution() {
        let registry = CancellationRegistry::new();
        let id = Uuid::new_v4();
        let token = registry.register(id);

        assert!(!token.is_cancelled());
        assert!(registry.cancel(id));
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_unknown_execution() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel(Uuid::new_v4()));
    }

    #[test]
    fn test_cancel_all() {
        let registry = CancellationRegistry::new();
        let tokens: Vec<_> = (0..3).map(|_| registry.register(Uuid::new_v4())).collect();

        registry.cancel_all();
        assert!(tokens.iter().all(|t| t.is_cancelled()));
    }

    #[test]
    fn test_unregister() {
        let registry = CancellationRegistry::new();
        let id = Uuid::new_v4();
        registry.register(id);
        registry.unregister(id);
        assert!(registry.is_empty());
        assert!(!registry.cancel(id));
    }
}
