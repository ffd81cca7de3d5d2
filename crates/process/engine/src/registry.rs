//! Definition registry: stores and retrieves process definitions
//!
//! Definitions are validated on registration and immutable afterwards; to
//! change a process, register a new version under a new id. Instances hold
//! shared references into the registry's storage, so nested sub-processes
//! resolve their definitions here at spawn time.

use std::collections::BTreeMap;
use std::sync::Arc;

use process_types::{EngineError, EngineResult, ProcessDefinition, ProcessDefinitionId};

/// Registry of validated process definitions.
#[derive(Clone, Debug, Default)]
pub struct DefinitionRegistry {
    /// All registered definitions, keyed by id.
    definitions: BTreeMap<ProcessDefinitionId, Arc<ProcessDefinition>>,
    /// Name index, for latest-version lookup.
    by_name: BTreeMap<String, Vec<ProcessDefinitionId>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a definition. Rejects duplicate ids.
    pub fn register(&mut self, definition: ProcessDefinition) -> EngineResult<ProcessDefinitionId> {
        definition.validate()?;

        let id = definition.id.clone();
        if self.definitions.contains_key(&id) {
            return Err(EngineError::DuplicateDefinition(id));
        }

        let name = definition.name.clone();
        self.definitions.insert(id.clone(), Arc::new(definition));
        self.by_name.entry(name).or_default().push(id.clone());

        tracing::info!(definition_id = %id, "process definition registered");
        Ok(id)
    }

    /// Get a definition by id.
    pub fn get(&self, id: &ProcessDefinitionId) -> EngineResult<Arc<ProcessDefinition>> {
        self.definitions
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::DefinitionNotFound(id.clone()))
    }

    /// The most recently registered definition with this name.
    pub fn latest_by_name(&self, name: &str) -> Option<Arc<ProcessDefinition>> {
        self.by_name
            .get(name)
            .and_then(|ids| ids.last())
            .and_then(|id| self.definitions.get(id))
            .cloned()
    }

    /// All registered definitions.
    pub fn list(&self) -> Vec<&Arc<ProcessDefinition>> {
        self.definitions.values().collect()
    }

    pub fn count(&self) -> usize {
        self.definitions.len()
    }

    pub fn contains(&self, id: &ProcessDefinitionId) -> bool {
        self.definitions.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use process_types::{ProcessNode, Transition};

    fn valid_definition(id: &str, name: &str) -> ProcessDefinition {
        let mut def = ProcessDefinition::new(id, name);
        def.add_node(ProcessNode::start("start")).unwrap();
        def.add_node(ProcessNode::end("end")).unwrap();
        def.add_transition(Transition::new("start", "end")).unwrap();
        def
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = DefinitionRegistry::new();
        let id = registry.register(valid_definition("review", "Review")).unwrap();

        let retrieved = registry.get(&id).unwrap();
        assert_eq!(retrieved.name, "Review");
        assert_eq!(registry.count(), 1);
        assert!(registry.contains(&id));
    }

    #[test]
    fn test_register_invalid_definition() {
        let mut registry = DefinitionRegistry::new();
        let result = registry.register(ProcessDefinition::new("empty", "Empty"));
        assert!(result.is_err());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut registry = DefinitionRegistry::new();
        registry.register(valid_definition("review", "Review")).unwrap();
        let result = registry.register(valid_definition("review", "Review v2"));
        assert!(matches!(result, Err(EngineError::DuplicateDefinition(_))));
    }

    #[test]
    fn test_latest_by_name() {
        let mut registry = DefinitionRegistry::new();
        registry.register(valid_definition("review_v1", "Review")).unwrap();
        let id2 = registry.register(valid_definition("review_v2", "Review")).unwrap();

        let latest = registry.latest_by_name("Review").unwrap();
        assert_eq!(latest.id, id2);
        assert!(registry.latest_by_name("Nonexistent").is_none());
    }

    #[test]
    fn test_get_nonexistent() {
        let registry = DefinitionRegistry::new();
        let result = registry.get(&ProcessDefinitionId::new("missing"));
        assert!(matches!(result, Err(EngineError::DefinitionNotFound(_))));
    }

    #[test]
    fn test_list() {
        let mut registry = DefinitionRegistry::new();
        registry.register(valid_definition("a", "A")).unwrap();
        registry.register(valid_definition("b", "B")).unwrap();
        assert_eq!(registry.list().len(), 2);
    }
}
