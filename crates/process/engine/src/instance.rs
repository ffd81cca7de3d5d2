//! Process instances: the mutable runtime tree
//!
//! A [`ProcessInstance`] owns one tree of task instances mirroring the
//! traversal of its definition graph. The tree is an arena: tasks live in a
//! `BTreeMap` keyed by id, with parent/child links stored as ids so no task
//! is owned twice.
//!
//! Only the **outermost** instance of a nesting hierarchy populates the
//! sub-process table, the correlation store and the outbound message queue.
//! Cross-hierarchy lookups always resolve through the outermost instance;
//! nested instances never cache their own global indices, so resets cannot
//! leave stale duplicates behind.

use std::collections::BTreeMap;
use std::sync::Arc;

use process_types::{
    DataMap, EngineError, EngineResult, InstanceId, NodeId, ProcessDefinition, TaskId, TaskState,
};
use serde_json::Value;

use crate::events::OutboundMessage;
use crate::task::TaskInstance;

/// Which instance of a hierarchy a task lives in: the outermost (`None`) or
/// the sub-process owned by a task (`Some(owner)`).
pub(crate) type Scope = Option<TaskId>;

/// One running execution of a process definition.
#[derive(Clone, Debug)]
pub struct ProcessInstance {
    pub id: InstanceId,
    pub(crate) definition: Arc<ProcessDefinition>,
    /// Instance-level data, accumulated from completed task data.
    pub data: DataMap,
    pub(crate) tasks: BTreeMap<TaskId, TaskInstance>,
    pub(crate) root: TaskId,
    pub(crate) next_seq: u64,
    /// The owning task instance in the enclosing instance, if nested.
    pub(crate) owner: Option<TaskId>,
    /// Outermost only: every nested instance anywhere in the hierarchy,
    /// keyed by its owning task id.
    pub(crate) subprocesses: BTreeMap<TaskId, ProcessInstance>,
    /// Outermost only: correlation-key name -> property name -> bound value.
    pub(crate) correlations: BTreeMap<String, BTreeMap<String, Value>>,
    /// Outermost only: messages nothing internal consumed.
    pub(crate) outbound: Vec<OutboundMessage>,
}

impl ProcessInstance {
    /// Create an instance with its root task on the definition's start node.
    pub fn new(definition: Arc<ProcessDefinition>, data: DataMap) -> EngineResult<Self> {
        let start = definition
            .start_node()
            .ok_or(EngineError::NoStartNode)?
            .id
            .clone();

        let root_id = TaskId::generate();
        let mut tasks = BTreeMap::new();
        tasks.insert(
            root_id,
            TaskInstance::new(root_id, start, None, TaskState::Ready, data.clone(), 0),
        );

        Ok(Self {
            id: InstanceId::generate(),
            definition,
            data,
            tasks,
            root: root_id,
            next_seq: 1,
            owner: None,
            subprocesses: BTreeMap::new(),
            correlations: BTreeMap::new(),
            outbound: Vec::new(),
        })
    }

    // ── Local queries ────────────────────────────────────────────────

    pub fn definition(&self) -> &Arc<ProcessDefinition> {
        &self.definition
    }

    pub fn root(&self) -> TaskId {
        self.root
    }

    pub fn owner(&self) -> Option<TaskId> {
        self.owner
    }

    /// A task in this instance's own tree.
    pub fn task(&self, id: TaskId) -> Option<&TaskInstance> {
        self.tasks.get(&id)
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> Option<&mut TaskInstance> {
        self.tasks.get_mut(&id)
    }

    pub(crate) fn expect_task(&self, id: TaskId) -> EngineResult<&TaskInstance> {
        self.tasks.get(&id).ok_or(EngineError::TaskNotFound(id))
    }

    /// This instance's tasks in creation order.
    pub fn tasks_in_order(&self) -> Vec<&TaskInstance> {
        let mut tasks: Vec<_> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// No live task remains anywhere in this instance's own tree.
    pub fn is_completed(&self) -> bool {
        !self.tasks.values().any(|t| t.state.is_live())
    }

    /// The most recent live instance of a node, if one exists.
    pub(crate) fn live_instance_of_node(&self, node: &NodeId) -> Option<TaskId> {
        self.tasks
            .values()
            .filter(|t| &t.node == node && t.state.is_live())
            .max_by_key(|t| t.seq)
            .map(|t| t.id)
    }

    /// The most recent instance of a node in any state.
    pub(crate) fn latest_instance_of_node(&self, node: &NodeId) -> Option<&TaskInstance> {
        self.tasks
            .values()
            .filter(|t| &t.node == node)
            .max_by_key(|t| t.seq)
    }

    /// Whether this instance finished through an error end event. Such an
    /// instance never completes its owner normally; the error propagates
    /// through the event subsystem instead.
    pub(crate) fn error_ended(&self) -> bool {
        use process_types::{EventDefinition, NodeKind};
        self.tasks.values().any(|t| {
            t.state == TaskState::Completed
                && matches!(
                    self.definition.get_node(&t.node).map(|n| &n.kind),
                    Some(NodeKind::EndEvent {
                        event: Some(EventDefinition::Error { .. })
                    })
                )
        })
    }

    // ── Local mutation ───────────────────────────────────────────────

    /// Create a task in this instance's tree.
    pub(crate) fn alloc_task(
        &mut self,
        node: NodeId,
        parent: Option<TaskId>,
        state: TaskState,
        data: DataMap,
    ) -> TaskId {
        let id = TaskId::generate();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tasks
            .insert(id, TaskInstance::new(id, node, parent, state, data, seq));
        if let Some(parent_id) = parent {
            if let Some(parent_task) = self.tasks.get_mut(&parent_id) {
                parent_task.children.push(id);
            }
        }
        id
    }

    /// Merge a completed task's data into the instance data (copies, never
    /// aliases).
    pub(crate) fn merge_task_data(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get(&id) {
            let data = task.data.clone();
            self.data.extend(data);
        }
    }

    /// All descendants of a task (excluding the task itself), depth-first.
    pub(crate) fn descendants(&self, id: TaskId) -> Vec<TaskId> {
        let mut result = Vec::new();
        let mut queue: Vec<TaskId> = self
            .tasks
            .get(&id)
            .map(|t| t.children.clone())
            .unwrap_or_default();
        while let Some(current) = queue.pop() {
            if let Some(task) = self.tasks.get(&current) {
                queue.extend(task.children.iter().copied());
            }
            result.push(current);
        }
        result
    }

    /// Remove a task's descendants from the arena, returning the removed ids.
    pub(crate) fn prune_descendants(&mut self, id: TaskId) -> Vec<TaskId> {
        let removed = self.descendants(id);
        for task_id in &removed {
            self.tasks.remove(task_id);
        }
        if let Some(task) = self.tasks.get_mut(&id) {
            task.children.clear();
        }
        removed
    }

    // ── Cross-hierarchy resolution (outermost only) ──────────────────

    /// Every scope of the hierarchy: the outermost instance itself, then
    /// each registered sub-process.
    pub(crate) fn scopes(&self) -> Vec<Scope> {
        std::iter::once(None)
            .chain(self.subprocesses.keys().map(|k| Some(*k)))
            .collect()
    }

    pub(crate) fn scope(&self, scope: &Scope) -> Option<&ProcessInstance> {
        match scope {
            None => Some(self),
            Some(owner) => self.subprocesses.get(owner),
        }
    }

    pub(crate) fn scope_mut(&mut self, scope: &Scope) -> Option<&mut ProcessInstance> {
        match scope {
            None => Some(self),
            Some(owner) => self.subprocesses.get_mut(owner),
        }
    }

    /// Which instance of the hierarchy holds this task.
    pub(crate) fn locate(&self, id: TaskId) -> Option<Scope> {
        if self.tasks.contains_key(&id) {
            return Some(None);
        }
        self.subprocesses
            .iter()
            .find(|(_, sub)| sub.tasks.contains_key(&id))
            .map(|(owner, _)| Some(*owner))
    }

    /// A task anywhere in the hierarchy. Always resolves through the
    /// outermost instance's table.
    pub fn find_task(&self, id: TaskId) -> Option<&TaskInstance> {
        self.tasks
            .get(&id)
            .or_else(|| self.subprocesses.values().find_map(|sub| sub.tasks.get(&id)))
    }

    pub(crate) fn find_task_mut(&mut self, id: TaskId) -> Option<&mut TaskInstance> {
        if self.tasks.contains_key(&id) {
            return self.tasks.get_mut(&id);
        }
        self.subprocesses
            .values_mut()
            .find_map(|sub| sub.tasks.get_mut(&id))
    }

    /// The definition node behind a task, resolved through the task's own
    /// scope so nested instances consult their own definitions.
    pub fn node_of_task(&self, id: TaskId) -> Option<&process_types::ProcessNode> {
        let scope = self.locate(id)?;
        let inst = self.scope(&scope)?;
        inst.definition.get_node(&inst.task(id)?.node)
    }

    /// "task (process)" entries from the task up through every enclosing
    /// sub-process, innermost first.
    pub fn task_trace(&self, id: TaskId) -> Vec<String> {
        let mut trace = Vec::new();
        let Some(scope) = self.locate(id) else {
            return trace;
        };
        let mut current = Some((scope, id));
        while let Some((scope, task_id)) = current {
            let Some(inst) = self.scope(&scope) else { break };
            let name = inst
                .task(task_id)
                .and_then(|t| inst.definition.get_node(&t.node))
                .map(|n| n.name.clone())
                .unwrap_or_else(|| task_id.to_string());
            trace.push(format!("{} ({})", name, inst.definition.name));
            current = scope.and_then(|owner| self.locate(owner).map(|s| (s, owner)));
        }
        trace
    }

    // ── Outermost state accessors ────────────────────────────────────

    /// Messages no internal task consumed, surfaced for an external actor.
    pub fn outbound_messages(&self) -> &[OutboundMessage] {
        &self.outbound
    }

    /// A bound correlation value, if any.
    pub fn correlation_value(&self, key: &str, property: &str) -> Option<&Value> {
        self.correlations.get(key).and_then(|props| props.get(property))
    }

    /// Number of live nested instances in the hierarchy.
    pub fn subprocess_count(&self) -> usize {
        self.subprocesses.len()
    }

    pub(crate) fn subprocess_of(&self, owner: TaskId) -> Option<&ProcessInstance> {
        self.subprocesses.get(&owner)
    }

    // ── Summaries ────────────────────────────────────────────────────

    /// Tasks across the whole hierarchy, outermost first, each scope in
    /// creation order.
    pub fn summaries(&self, state_filter: Option<TaskState>) -> Vec<TaskSummary> {
        let mut result = Vec::new();
        self.collect_summaries(state_filter, 0, &mut result);
        for sub in self.subprocesses.values() {
            sub.collect_summaries(state_filter, 1, &mut result);
        }
        result
    }

    fn collect_summaries(
        &self,
        state_filter: Option<TaskState>,
        depth: usize,
        into: &mut Vec<TaskSummary>,
    ) {
        for task in self.tasks_in_order() {
            if state_filter.is_some_and(|s| s != task.state) {
                continue;
            }
            let node = self.definition.get_node(&task.node);
            into.push(TaskSummary {
                id: task.id,
                node: task.node.clone(),
                name: node.map(|n| n.name.clone()).unwrap_or_default(),
                state: task.state,
                lane: node.and_then(|n| n.lane.clone()),
                depth,
            });
        }
    }
}

/// A read-only view of one task, for callers and UIs.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskSummary {
    pub id: TaskId,
    pub node: NodeId,
    pub name: String,
    pub state: TaskState,
    pub lane: Option<String>,
    /// 0 for the outermost instance, 1 for nested sub-processes.
    pub depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use process_types::{ProcessNode, Transition};

    fn linear_definition() -> Arc<ProcessDefinition> {
        let mut def = ProcessDefinition::new("p", "Payment");
        def.add_node(ProcessNode::start("start")).unwrap();
        def.add_node(ProcessNode::task("charge", "Charge Card")).unwrap();
        def.add_node(ProcessNode::end("end")).unwrap();
        def.add_transition(Transition::new("start", "charge")).unwrap();
        def.add_transition(Transition::new("charge", "end")).unwrap();
        Arc::new(def)
    }

    #[test]
    fn test_new_instance_has_ready_root() {
        let instance = ProcessInstance::new(linear_definition(), DataMap::new()).unwrap();
        let root = instance.task(instance.root()).unwrap();
        assert_eq!(root.state, TaskState::Ready);
        assert_eq!(root.node, NodeId::new("start"));
        assert!(!instance.is_completed());
    }

    #[test]
    fn test_alloc_task_links_parent() {
        let mut instance = ProcessInstance::new(linear_definition(), DataMap::new()).unwrap();
        let root = instance.root();
        let child = instance.alloc_task(
            NodeId::new("charge"),
            Some(root),
            TaskState::Ready,
            DataMap::new(),
        );

        assert_eq!(instance.task(child).unwrap().parent, Some(root));
        assert_eq!(instance.task(root).unwrap().children, vec![child]);
        assert!(instance.task(child).unwrap().seq > instance.task(root).unwrap().seq);
    }

    #[test]
    fn test_descendants_and_prune() {
        let mut instance = ProcessInstance::new(linear_definition(), DataMap::new()).unwrap();
        let root = instance.root();
        let a = instance.alloc_task(NodeId::new("charge"), Some(root), TaskState::Ready, DataMap::new());
        let b = instance.alloc_task(NodeId::new("end"), Some(a), TaskState::Ready, DataMap::new());

        let descendants = instance.descendants(root);
        assert_eq!(descendants.len(), 2);
        assert!(descendants.contains(&a));
        assert!(descendants.contains(&b));

        let removed = instance.prune_descendants(a);
        assert_eq!(removed, vec![b]);
        assert!(instance.task(b).is_none());
        assert!(instance.task(a).unwrap().children.is_empty());
    }

    #[test]
    fn test_merge_task_data_copies() {
        let mut instance = ProcessInstance::new(linear_definition(), DataMap::new()).unwrap();
        let root = instance.root();
        instance
            .task_mut(root)
            .unwrap()
            .data
            .insert("amount".into(), serde_json::json!(12));

        instance.merge_task_data(root);
        assert_eq!(instance.data.get("amount"), Some(&serde_json::json!(12)));

        // Mutating the task afterwards must not affect the merged copy.
        instance
            .task_mut(root)
            .unwrap()
            .data
            .insert("amount".into(), serde_json::json!(99));
        assert_eq!(instance.data.get("amount"), Some(&serde_json::json!(12)));
    }

    #[test]
    fn test_find_task_searches_subprocesses() {
        let mut outer = ProcessInstance::new(linear_definition(), DataMap::new()).unwrap();
        let owner = outer.alloc_task(
            NodeId::new("charge"),
            Some(outer.root()),
            TaskState::Waiting,
            DataMap::new(),
        );

        let nested = ProcessInstance::new(linear_definition(), DataMap::new()).unwrap();
        let nested_root = nested.root();
        outer.subprocesses.insert(owner, nested);

        assert!(outer.find_task(nested_root).is_some());
        assert_eq!(outer.locate(nested_root), Some(Some(owner)));
        assert_eq!(outer.locate(owner), Some(None));
        assert_eq!(outer.scopes().len(), 2);
    }

    #[test]
    fn test_task_trace_is_innermost_first() {
        let mut outer = ProcessInstance::new(linear_definition(), DataMap::new()).unwrap();
        let owner = outer.alloc_task(
            NodeId::new("charge"),
            Some(outer.root()),
            TaskState::Waiting,
            DataMap::new(),
        );

        let mut def = ProcessDefinition::new("refund", "Refund");
        def.add_node(ProcessNode::start("start")).unwrap();
        def.add_node(ProcessNode::task("wire", "Wire Money")).unwrap();
        def.add_node(ProcessNode::end("end")).unwrap();
        def.add_transition(Transition::new("start", "wire")).unwrap();
        def.add_transition(Transition::new("wire", "end")).unwrap();

        let mut nested = ProcessInstance::new(Arc::new(def), DataMap::new()).unwrap();
        nested.owner = Some(owner);
        let wire = nested.alloc_task(
            NodeId::new("wire"),
            Some(nested.root()),
            TaskState::Ready,
            DataMap::new(),
        );
        outer.subprocesses.insert(owner, nested);

        let trace = outer.task_trace(wire);
        assert_eq!(trace, vec!["Wire Money (Refund)", "Charge Card (Payment)"]);
    }

    #[test]
    fn test_summaries_are_ordered_and_filtered() {
        let mut instance = ProcessInstance::new(linear_definition(), DataMap::new()).unwrap();
        let root = instance.root();
        instance.alloc_task(NodeId::new("charge"), Some(root), TaskState::Ready, DataMap::new());

        let all = instance.summaries(None);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].node, NodeId::new("start"));
        assert_eq!(all[1].node, NodeId::new("charge"));

        let ready = instance.summaries(Some(TaskState::Ready));
        assert_eq!(ready.len(), 2);
        let completed = instance.summaries(Some(TaskState::Completed));
        assert!(completed.is_empty());
    }
}
