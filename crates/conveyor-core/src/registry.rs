//! In-process registries shared between the poll loops and workers.
//!
//! Both registries are explicit objects created at startup and passed by
//! `Arc` to the components that need them. Neither participates in
//! correctness guarantees: toggles gate side effects, activations only
//! wake dormant dependents.

use dashmap::DashSet;
use uuid::Uuid;

/// Effect toggle registry.
///
/// Named side effects (enqueuing, dispatching, auto-purge) can be switched
/// off at runtime, e.g. while draining a deployment. Unknown names are
/// enabled by default.
#[derive(Debug, Default)]
pub struct ToggleRegistry {
    disabled: DashSet<String>,
}

/// Toggle name for the manifest-manager enqueue effect.
pub const TOGGLE_MANIFEST_MANAGER: &str = "manifest-manager";
/// Toggle name for the job-dispatcher claim effect.
pub const TOGGLE_JOB_DISPATCHER: &str = "job-dispatcher";
/// Toggle name for dead-letter auto-purge.
pub const TOGGLE_DEAD_LETTER_PURGE: &str = "dead-letter-purge";

impl ToggleRegistry {
    /// Create a registry with every effect enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable a named effect.
    pub fn enable(&self, name: &str) {
        self.disabled.remove(name);
    }

    /// Disable a named effect.
    pub fn disable(&self, name: &str) {
        self.disabled.insert(name.to_string());
    }

    /// Check whether a named effect is enabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        !self.disabled.contains(name)
    }
}

/// Activation registry for dormant-dependent manifests.
///
/// A dormant dependent never fires on its own; a running workflow activates
/// it by manifest id, and the next manifest-manager tick consumes the
/// activation. Activations are process-local and not persisted.
#[derive(Debug, Default)]
pub struct ActivationRegistry {
    activated: DashSet<Uuid>,
}

impl ActivationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an activation for a dormant-dependent manifest.
    pub fn activate(&self, manifest_id: Uuid) {
        self.activated.insert(manifest_id);
    }

    /// Check whether a manifest has a pending activation.
    pub fn is_activated(&self, manifest_id: Uuid) -> bool {
        self.activated.contains(&manifest_id)
    }

    /// Consume a pending activation, returning whether one was present.
    pub fn consume(&self, manifest_id: Uuid) -> bool {
        self.activated.remove(&manifest_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggles_enabled_by_default() {
        let toggles = ToggleRegistry::new();
        assert!(toggles.is_enabled(TOGGLE_MANIFEST_MANAGER));
        assert!(toggles.is_enabled("anything"));
    }

    #[test]
    fn test_toggle_disable_enable() {
        let toggles = ToggleRegistry::new();
        toggles.disable(TOGGLE_JOB_DISPATCHER);
        assert!(!toggles.is_enabled(TOGGLE_JOB_DISPATCHER));
        toggles.enable(TOGGLE_JOB_DISPATCHER);
        assert!(toggles.is_enabled(TOGGLE_JOB_DISPATCHER));
    }

    #[test]
    fn test_activation_consumed_once() {
        let activations = ActivationRegistry::new();
        let id = Uuid::new_v4();
        assert!(!activations.consume(id));
        activations.activate(id);
        assert!(activations.is_activated(id));
        assert!(activations.consume(id));
        assert!(!activations.consume(id));
    }
}
