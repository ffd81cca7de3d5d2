//! Snapshot and restore
//!
//! A snapshot captures the full instance state — every task across every
//! nested instance, the correlation store, the outbound queue — as JSON
//! built exclusively from ordered containers, so serializing the same
//! logical state twice yields byte-identical output. Definitions are stored
//! by id and re-linked from the registry on restore.

use std::collections::BTreeMap;

use process_types::{
    DataMap, EngineError, EngineResult, InstanceId, ProcessDefinitionId, TaskId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::OutboundMessage;
use crate::instance::ProcessInstance;
use crate::registry::DefinitionRegistry;
use crate::task::TaskInstance;

/// The serialized shape of one instance (nested recursively).
#[derive(Debug, Serialize, Deserialize)]
struct InstanceSnapshot {
    id: InstanceId,
    definition: ProcessDefinitionId,
    root: TaskId,
    owner: Option<TaskId>,
    next_seq: u64,
    data: DataMap,
    tasks: BTreeMap<TaskId, TaskInstance>,
    subprocesses: BTreeMap<TaskId, InstanceSnapshot>,
    correlations: BTreeMap<String, BTreeMap<String, Value>>,
    outbound: Vec<OutboundMessage>,
}

impl InstanceSnapshot {
    fn capture(instance: &ProcessInstance) -> Self {
        Self {
            id: instance.id,
            definition: instance.definition.id.clone(),
            root: instance.root,
            owner: instance.owner,
            next_seq: instance.next_seq,
            data: instance.data.clone(),
            tasks: instance.tasks.clone(),
            subprocesses: instance
                .subprocesses
                .iter()
                .map(|(owner, sub)| (*owner, Self::capture(sub)))
                .collect(),
            correlations: instance.correlations.clone(),
            outbound: instance.outbound.clone(),
        }
    }

    fn rebuild(self, definitions: &DefinitionRegistry) -> EngineResult<ProcessInstance> {
        let definition = definitions.get(&self.definition)?;
        let mut subprocesses = BTreeMap::new();
        for (owner, sub) in self.subprocesses {
            subprocesses.insert(owner, sub.rebuild(definitions)?);
        }
        if !self.tasks.contains_key(&self.root) {
            return Err(EngineError::Snapshot(format!(
                "root task {} missing from snapshot",
                self.root
            )));
        }
        Ok(ProcessInstance {
            id: self.id,
            definition,
            data: self.data,
            tasks: self.tasks,
            root: self.root,
            next_seq: self.next_seq,
            owner: self.owner,
            subprocesses,
            correlations: self.correlations,
            outbound: self.outbound,
        })
    }
}

impl ProcessInstance {
    /// Serialize the full hierarchy to a stable JSON string.
    pub fn snapshot(&self) -> EngineResult<String> {
        serde_json::to_string(&InstanceSnapshot::capture(self))
            .map_err(|e| EngineError::Snapshot(e.to_string()))
    }

    /// Rebuild an instance from a snapshot, re-linking definitions (for the
    /// outermost and every nested instance) from the registry.
    pub fn restore(state: &str, definitions: &DefinitionRegistry) -> EngineResult<ProcessInstance> {
        let snapshot: InstanceSnapshot =
            serde_json::from_str(state).map_err(|e| EngineError::Snapshot(e.to_string()))?;
        snapshot.rebuild(definitions)
    }
}
