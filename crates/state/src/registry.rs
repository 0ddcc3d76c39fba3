//! Process-wide mapping from build id to live state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, warn};

use crate::BuildState;

/// Exclusive owner of all in-flight [`BuildState`]s. States are registered
/// at submit time and dropped lazily once their log stream has drained.
#[derive(Default)]
pub struct Registry {
    builds: RwLock<HashMap<String, Arc<BuildState>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, state: Arc<BuildState>) {
        let mut builds = self.builds.write();
        if builds.contains_key(state.id()) {
            warn!(build = %state.id(), "registering over an existing build state");
        }
        builds.insert(state.id().to_string(), state);
    }

    /// Look up a build. A stored state whose internal id does not match the
    /// requested key is treated as a miss.
    pub fn get(&self, id: &str) -> Option<Arc<BuildState>> {
        let state = self.builds.read().get(id).cloned()?;
        if state.id() != id {
            error!(requested = id, stored = %state.id(), "registry id mismatch");
            return None;
        }
        Some(state)
    }

    pub fn delete(&self, id: &str) {
        self.builds.write().remove(id);
    }

    pub fn list_ids(&self) -> Vec<String> {
        self.builds.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("builds", &self.builds.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BuildShape;

    #[test]
    fn get_returns_registered_state() {
        let registry = Registry::new();
        let state = Arc::new(BuildState::new("b-1", BuildShape::default()));
        registry.register(state.clone());
        assert!(Arc::ptr_eq(&registry.get("b-1").unwrap(), &state));
        assert!(registry.get("b-2").is_none());
    }

    #[test]
    fn delete_removes_state() {
        let registry = Registry::new();
        registry.register(Arc::new(BuildState::new("b-1", BuildShape::default())));
        registry.delete("b-1");
        assert!(registry.get("b-1").is_none());
        assert!(registry.list_ids().is_empty());
    }

    #[test]
    fn list_ids_reports_live_builds() {
        let registry = Registry::new();
        registry.register(Arc::new(BuildState::new("b-1", BuildShape::default())));
        registry.register(Arc::new(BuildState::new("b-2", BuildShape::default())));
        let mut ids = registry.list_ids();
        ids.sort();
        assert_eq!(ids, ["b-1", "b-2"]);
    }
}
