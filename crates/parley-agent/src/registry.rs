//! Agent definitions in effect, swappable on config reload.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::info;

use parley_core::agent::AgentDefinition;
use parley_core::config::Config;

#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: RwLock<BTreeMap<String, AgentDefinition>>,
}

impl AgentRegistry {
    pub fn new(definitions: Vec<AgentDefinition>) -> Self {
        let registry = Self::default();
        registry.reload(definitions);
        registry
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.agent_definitions())
    }

    /// Replace every definition at once.
    pub fn reload(&self, definitions: Vec<AgentDefinition>) {
        let map: BTreeMap<String, AgentDefinition> =
            definitions.into_iter().map(|d| (d.key.clone(), d)).collect();
        info!(count = map.len(), "Agent definitions loaded");
        *self.write() = map;
    }

    pub fn get(&self, key: &str) -> Option<AgentDefinition> {
        self.read().get(key).cloned()
    }

    pub fn list(&self) -> Vec<AgentDefinition> {
        self.read().values().cloned().collect()
    }

    /// Definitions a delegating agent may hand work to.
    pub fn subagents(&self) -> Vec<AgentDefinition> {
        self.read().values().filter(|d| d.is_subagent).cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, AgentDefinition>> {
        self.agents.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, AgentDefinition>> {
        self.agents.write().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_reload_replaces() {
        let registry = AgentRegistry::from_config(&Config::default());
        assert!(registry.get("assistant").is_some());

        registry.reload(vec![AgentDefinition {
            key: "researcher".into(),
            is_subagent: true,
            ..AgentDefinition::default()
        }]);
        assert!(registry.get("assistant").is_none());
        assert_eq!(registry.subagents().len(), 1);
        assert_eq!(registry.list().len(), 1);
    }
}
