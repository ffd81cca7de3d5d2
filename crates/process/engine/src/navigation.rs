//! Forward-looking navigation previews
//!
//! A preview walks the definition graph from the start node and predicts a
//! state for every node: the real instance state where one exists, `LIKELY`
//! where a live token can still plausibly arrive, `FUTURE` beyond that.
//! The walk is read-only; real instances are never touched.

use std::collections::BTreeSet;

use process_types::{NodeId, NodeKind, TaskState};

use crate::instance::{ProcessInstance, Scope};

/// One row of the UI breadcrumb/stepper tree.
#[derive(Clone, Debug, PartialEq)]
pub struct PreviewRow {
    pub node: NodeId,
    pub predicted_state: TaskState,
    /// Nesting level: gateway fan-outs and sub-processes indent their
    /// contents by one.
    pub indent: usize,
}

/// Read-only navigation and tree-rewind operations (see also `reset`).
#[derive(Clone, Debug, Default)]
pub struct Navigator;

impl Navigator {
    pub fn new() -> Self {
        Self
    }

    /// Predicted states for the whole hierarchy, in graph walk order.
    pub fn preview(&self, outermost: &ProcessInstance) -> Vec<PreviewRow> {
        let mut rows = Vec::new();
        self.walk_instance(outermost, &None, 0, &mut rows);
        rows
    }

    fn walk_instance(
        &self,
        outermost: &ProcessInstance,
        scope: &Scope,
        indent: usize,
        rows: &mut Vec<PreviewRow>,
    ) {
        let Some(inst) = outermost.scope(scope) else {
            return;
        };
        let def = &inst.definition;

        // Nodes a live token can still reach.
        let mut plausible = BTreeSet::new();
        for task in inst.tasks_in_order() {
            if task.state.is_live() {
                plausible.extend(def.reachable_from(&task.node));
            }
        }

        let Some(start) = def.start_node() else {
            return;
        };
        let mut visited = BTreeSet::new();
        self.walk_node(outermost, scope, &start.id, indent, &plausible, &mut visited, rows);
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_node(
        &self,
        outermost: &ProcessInstance,
        scope: &Scope,
        node_id: &NodeId,
        indent: usize,
        plausible: &BTreeSet<NodeId>,
        visited: &mut BTreeSet<NodeId>,
        rows: &mut Vec<PreviewRow>,
    ) {
        if !visited.insert(node_id.clone()) {
            return;
        }
        let Some(inst) = outermost.scope(scope) else {
            return;
        };
        let def = inst.definition.clone();

        let predicted_state = match inst.latest_instance_of_node(node_id) {
            Some(task) => task.state,
            None if plausible.contains(node_id) => TaskState::Likely,
            None => TaskState::Future,
        };
        rows.push(PreviewRow {
            node: node_id.clone(),
            predicted_state,
            indent,
        });

        match def.get_node(node_id).map(|n| &n.kind) {
            Some(NodeKind::SubProcess { .. }) => {
                // Descend into a live nested instance, if one exists.
                if let Some(owner) = inst
                    .latest_instance_of_node(node_id)
                    .map(|t| t.id)
                    .filter(|id| outermost.subprocess_of(*id).is_some())
                {
                    self.walk_instance(outermost, &Some(owner), indent + 1, rows);
                }
            }
            Some(NodeKind::BoundaryHost { wrapped, boundary }) => {
                self.walk_node(outermost, scope, wrapped, indent + 1, plausible, visited, rows);
                for node in boundary {
                    self.walk_node(outermost, scope, node, indent + 1, plausible, visited, rows);
                }
            }
            _ => {}
        }

        let outgoing = def.outgoing(node_id);
        let child_indent = indent + usize::from(outgoing.len() > 1);
        for transition in outgoing {
            self.walk_node(
                outermost,
                scope,
                &transition.target,
                child_indent,
                plausible,
                visited,
                rows,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ProcessRuntime;
    use process_expr::DataMap;
    use process_types::{ProcessDefinition, ProcessNode, Transition};

    fn staged() -> ProcessDefinition {
        let mut def = ProcessDefinition::new("staged", "Staged");
        def.add_node(ProcessNode::start("start")).unwrap();
        def.add_node(ProcessNode::user_task("draft", "Draft")).unwrap();
        def.add_node(ProcessNode::user_task("review", "Review")).unwrap();
        def.add_node(ProcessNode::end("end")).unwrap();
        def.add_transition(Transition::new("start", "draft")).unwrap();
        def.add_transition(Transition::new("draft", "review")).unwrap();
        def.add_transition(Transition::new("review", "end")).unwrap();
        def
    }

    fn state_of(rows: &[PreviewRow], node: &str) -> TaskState {
        rows.iter()
            .find(|r| r.node == NodeId::new(node))
            .map(|r| r.predicted_state)
            .unwrap()
    }

    #[test]
    fn test_preview_mixes_real_and_speculative_states() {
        let mut runtime = ProcessRuntime::new();
        runtime.register(staged()).unwrap();
        let id = runtime.start("staged", DataMap::new()).unwrap();
        runtime.advance(id, None).unwrap();

        let rows = runtime.preview(id).unwrap();
        assert_eq!(state_of(&rows, "start"), TaskState::Completed);
        assert_eq!(state_of(&rows, "draft"), TaskState::Ready);
        // Not yet instantiated, but a live token can still get there.
        assert_eq!(state_of(&rows, "review"), TaskState::Likely);
        assert_eq!(state_of(&rows, "end"), TaskState::Likely);
    }

    #[test]
    fn test_preview_is_future_without_live_tokens() {
        let mut runtime = ProcessRuntime::new();
        runtime.register(staged()).unwrap();
        let id = runtime.start("staged", DataMap::new()).unwrap();
        runtime.advance(id, None).unwrap();
        runtime.cancel(id).unwrap();

        let rows = runtime.preview(id).unwrap();
        assert_eq!(state_of(&rows, "draft"), TaskState::Cancelled);
        assert_eq!(state_of(&rows, "review"), TaskState::Future);
    }

    #[test]
    fn test_preview_does_not_mutate() {
        let mut runtime = ProcessRuntime::new();
        runtime.register(staged()).unwrap();
        let id = runtime.start("staged", DataMap::new()).unwrap();
        runtime.advance(id, None).unwrap();

        let before = runtime.snapshot(id).unwrap();
        runtime.preview(id).unwrap();
        assert_eq!(runtime.snapshot(id).unwrap(), before);
    }

    #[test]
    fn test_gateway_fanout_indents() {
        let mut def = ProcessDefinition::new("fan", "Fan");
        def.add_node(ProcessNode::start("start")).unwrap();
        def.add_node(ProcessNode::parallel("fork")).unwrap();
        def.add_node(ProcessNode::user_task("a", "A")).unwrap();
        def.add_node(ProcessNode::user_task("b", "B")).unwrap();
        def.add_node(ProcessNode::parallel("join")).unwrap();
        def.add_node(ProcessNode::end("end")).unwrap();
        def.add_transition(Transition::new("start", "fork")).unwrap();
        def.add_transition(Transition::new("fork", "a")).unwrap();
        def.add_transition(Transition::new("fork", "b")).unwrap();
        def.add_transition(Transition::new("a", "join")).unwrap();
        def.add_transition(Transition::new("b", "join")).unwrap();
        def.add_transition(Transition::new("join", "end")).unwrap();

        let mut runtime = ProcessRuntime::new();
        runtime.register(def).unwrap();
        let id = runtime.start("fan", DataMap::new()).unwrap();

        let rows = runtime.preview(id).unwrap();
        let indent_of = |node: &str| {
            rows.iter()
                .find(|r| r.node == NodeId::new(node))
                .map(|r| r.indent)
                .unwrap()
        };
        assert_eq!(indent_of("start"), 0);
        assert_eq!(indent_of("fork"), 0);
        assert_eq!(indent_of("a"), 1);
        assert_eq!(indent_of("b"), 1);
        // Every node appears exactly once.
        assert_eq!(rows.len(), 6);
    }
}
