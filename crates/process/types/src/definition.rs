//! Process definitions: the static node graph
//!
//! A [`ProcessDefinition`] is a directed graph of typed nodes connected by
//! guarded transitions. Definitions are produced by a front-end compiler or
//! built through this API, validated once, and treated as immutable by the
//! engine afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{EngineError, EngineResult};
use crate::event::EventDefinition;

// ── Identifiers ──────────────────────────────────────────────────────

/// Unique identifier for a process definition.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessDefinitionId(pub String);

impl ProcessDefinitionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ProcessDefinitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProcessDefinitionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Unique identifier for a node within one definition.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ── Transitions ──────────────────────────────────────────────────────

/// A directed, optionally-guarded transition between two nodes.
///
/// Declaration order is significant: exclusive gateways evaluate guards in
/// the order transitions were added.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub source: NodeId,
    pub target: NodeId,
    /// Guard expression; `None` means the transition is always taken.
    pub guard: Option<String>,
    /// The fallback taken when no guarded sibling matches. Default
    /// transitions carry no guard.
    pub is_default: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
}

impl Transition {
    /// An unguarded transition.
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            guard: None,
            is_default: false,
            label: String::new(),
        }
    }

    /// A transition taken only when `guard` evaluates to true.
    pub fn guarded(
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        guard: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            guard: Some(guard.into()),
            is_default: false,
            label: String::new(),
        }
    }

    /// The default flow out of a gateway.
    pub fn default_flow(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            guard: None,
            is_default: true,
            label: String::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

// ── Data mappings ────────────────────────────────────────────────────

/// How data crosses a sub-process boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DataMapping {
    /// Copy the whole data map.
    #[default]
    All,
    /// Copy a named subset, renaming each variable on the way through.
    Named(Vec<DataBinding>),
}

impl DataMapping {
    pub fn named<S: Into<String>, T: Into<String>>(
        pairs: impl IntoIterator<Item = (S, T)>,
    ) -> Self {
        Self::Named(
            pairs
                .into_iter()
                .map(|(source, target)| DataBinding {
                    source: source.into(),
                    target: target.into(),
                })
                .collect(),
        )
    }
}

/// One variable copied across a sub-process boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBinding {
    /// Variable name on the side the data comes from.
    pub source: String,
    /// Variable name on the side the data lands on.
    pub target: String,
}

// ── Node kinds ───────────────────────────────────────────────────────

/// The flavor of work a plain task node performs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TaskKind {
    /// Completed by the step engine without external input.
    #[default]
    Automatic,
    /// Requires an external actor; excluded from automatic stepping.
    User,
    /// Runs a script through the evaluator and merges side effects back.
    Script { script: String },
    /// Invokes a registered decision table and stores the outcome under
    /// `result`.
    Rule { rule: String, result: String },
}

/// The closed set of node kinds the engine dispatches over.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// The entry point of a definition.
    StartEvent { event: Option<EventDefinition> },
    /// A terminal node; plain ends just finish the token, event-carrying
    /// ends (terminate, error, escalation, message, signal) act on the way
    /// out.
    EndEvent { event: Option<EventDefinition> },
    /// A unit of work.
    Task { kind: TaskKind },
    /// Takes the first outgoing transition whose guard matches, else the
    /// default.
    ExclusiveGateway,
    /// Forks all outgoing transitions; joins wait for every incoming branch.
    ParallelGateway,
    /// Forks the guard-true subset; joins wait for every still-reachable
    /// incoming branch.
    InclusiveGateway,
    /// Arms one catching event per outgoing transition; the first to fire
    /// wins and the rest are cancelled.
    EventGateway,
    /// Blocks until its event is delivered.
    CatchEvent { event: EventDefinition },
    /// Emits its event, then continues.
    ThrowEvent { event: EventDefinition },
    /// Runs a nested process instance. A `trigger` marks an event-started
    /// sub-process: never reached by sequence flow, instantiated by the
    /// event subsystem when a matching event arrives.
    SubProcess {
        definition: ProcessDefinitionId,
        inputs: DataMapping,
        outputs: DataMapping,
        trigger: Option<EventDefinition>,
    },
    /// Wrapper hosting a task with attached boundary events. The wrapped
    /// node and the boundary catch nodes are instantiated as children of
    /// the host; the host carries the normal outgoing flow, each boundary
    /// node carries its handler flow.
    BoundaryHost {
        wrapped: NodeId,
        boundary: Vec<NodeId>,
    },
}

// ── Process node ─────────────────────────────────────────────────────

/// A typed vertex in the process graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessNode {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    /// Display lane; only behaviorally relevant as a ready-user-task filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ProcessNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: NodeId::new(id),
            name: name.into(),
            kind,
            lane: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, "Start", NodeKind::StartEvent { event: None })
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, "End", NodeKind::EndEvent { event: None })
    }

    pub fn end_with(id: impl Into<String>, event: EventDefinition) -> Self {
        Self::new(id, "End", NodeKind::EndEvent { event: Some(event) })
    }

    pub fn task(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(
            id,
            name,
            NodeKind::Task {
                kind: TaskKind::Automatic,
            },
        )
    }

    pub fn user_task(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, NodeKind::Task { kind: TaskKind::User })
    }

    pub fn script_task(
        id: impl Into<String>,
        name: impl Into<String>,
        script: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            name,
            NodeKind::Task {
                kind: TaskKind::Script {
                    script: script.into(),
                },
            },
        )
    }

    pub fn rule_task(
        id: impl Into<String>,
        name: impl Into<String>,
        rule: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            name,
            NodeKind::Task {
                kind: TaskKind::Rule {
                    rule: rule.into(),
                    result: result.into(),
                },
            },
        )
    }

    pub fn exclusive(id: impl Into<String>) -> Self {
        Self::new(id, "Exclusive", NodeKind::ExclusiveGateway)
    }

    pub fn parallel(id: impl Into<String>) -> Self {
        Self::new(id, "Parallel", NodeKind::ParallelGateway)
    }

    pub fn inclusive(id: impl Into<String>) -> Self {
        Self::new(id, "Inclusive", NodeKind::InclusiveGateway)
    }

    pub fn event_gateway(id: impl Into<String>) -> Self {
        Self::new(id, "Event Gateway", NodeKind::EventGateway)
    }

    pub fn catch_event(
        id: impl Into<String>,
        name: impl Into<String>,
        event: EventDefinition,
    ) -> Self {
        Self::new(id, name, NodeKind::CatchEvent { event })
    }

    pub fn throw_event(
        id: impl Into<String>,
        name: impl Into<String>,
        event: EventDefinition,
    ) -> Self {
        Self::new(id, name, NodeKind::ThrowEvent { event })
    }

    pub fn sub_process(
        id: impl Into<String>,
        name: impl Into<String>,
        definition: impl Into<ProcessDefinitionId>,
    ) -> Self {
        Self::new(
            id,
            name,
            NodeKind::SubProcess {
                definition: definition.into(),
                inputs: DataMapping::All,
                outputs: DataMapping::All,
                trigger: None,
            },
        )
    }

    pub fn boundary_host(
        id: impl Into<String>,
        wrapped: impl Into<String>,
        boundary: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::new(
            id,
            "Boundary Host",
            NodeKind::BoundaryHost {
                wrapped: NodeId::new(wrapped),
                boundary: boundary.into_iter().map(NodeId::new).collect(),
            },
        )
    }

    /// Input mapping for a sub-process node; no effect on other kinds.
    pub fn with_inputs(mut self, mapping: DataMapping) -> Self {
        if let NodeKind::SubProcess { inputs, .. } = &mut self.kind {
            *inputs = mapping;
        }
        self
    }

    /// Output mapping for a sub-process node; no effect on other kinds.
    pub fn with_outputs(mut self, mapping: DataMapping) -> Self {
        if let NodeKind::SubProcess { outputs, .. } = &mut self.kind {
            *outputs = mapping;
        }
        self
    }

    /// Start trigger for an event-started sub-process; no effect on other
    /// kinds.
    pub fn with_trigger(mut self, event: EventDefinition) -> Self {
        if let NodeKind::SubProcess { trigger, .. } = &mut self.kind {
            *trigger = Some(event);
        }
        self
    }

    pub fn with_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = Some(lane.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether the step engine may execute this node without external input.
    pub fn is_automatic(&self) -> bool {
        !matches!(
            self.kind,
            NodeKind::Task {
                kind: TaskKind::User
            }
        )
    }

    /// The event definition a catching instance of this node waits for.
    pub fn catch_definition(&self) -> Option<&EventDefinition> {
        match &self.kind {
            NodeKind::CatchEvent { event } => Some(event),
            _ => None,
        }
    }
}

// ── Process definition ───────────────────────────────────────────────

/// The immutable blueprint a process instance executes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: ProcessDefinitionId,
    pub name: String,
    pub version: u32,
    pub nodes: Vec<ProcessNode>,
    pub transitions: Vec<Transition>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ProcessDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ProcessDefinitionId::new(id),
            name: name.into(),
            version: 1,
            nodes: Vec::new(),
            transitions: Vec::new(),
            created_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn add_node(&mut self, node: ProcessNode) -> EngineResult<()> {
        if self.nodes.iter().any(|n| n.id == node.id) {
            return Err(EngineError::DuplicateNodeId(node.id));
        }
        self.nodes.push(node);
        Ok(())
    }

    pub fn add_transition(&mut self, transition: Transition) -> EngineResult<()> {
        if self.get_node(&transition.source).is_none() {
            return Err(EngineError::NodeNotFound(transition.source));
        }
        if self.get_node(&transition.target).is_none() {
            return Err(EngineError::NodeNotFound(transition.target));
        }
        if self
            .transitions
            .iter()
            .any(|t| t.source == transition.source && t.target == transition.target)
        {
            return Err(EngineError::DuplicateTransition {
                from: transition.source,
                to: transition.target,
            });
        }
        self.transitions.push(transition);
        Ok(())
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&ProcessNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// The single start event of this definition.
    pub fn start_node(&self) -> Option<&ProcessNode> {
        self.nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::StartEvent { .. }))
    }

    /// Outgoing transitions from a node, in declaration order.
    pub fn outgoing(&self, node_id: &NodeId) -> Vec<&Transition> {
        self.transitions
            .iter()
            .filter(|t| &t.source == node_id)
            .collect()
    }

    /// Incoming transitions to a node, in declaration order.
    pub fn incoming(&self, node_id: &NodeId) -> Vec<&Transition> {
        self.transitions
            .iter()
            .filter(|t| &t.target == node_id)
            .collect()
    }

    /// Event-started sub-process nodes, consulted by the event subsystem.
    pub fn triggered_sub_processes(&self) -> Vec<&ProcessNode> {
        self.nodes
            .iter()
            .filter(|n| {
                matches!(
                    n.kind,
                    NodeKind::SubProcess {
                        trigger: Some(_),
                        ..
                    }
                )
            })
            .collect()
    }

    /// Validate the graph for structural correctness.
    pub fn validate(&self) -> EngineResult<()> {
        if self.nodes.is_empty() {
            return Err(EngineError::Validation(
                "definition must have at least one node".into(),
            ));
        }

        let start_count = self
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::StartEvent { .. }))
            .count();
        if start_count == 0 {
            return Err(EngineError::NoStartNode);
        }
        if start_count > 1 {
            return Err(EngineError::Validation(
                "definition must have exactly one start node".into(),
            ));
        }

        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if !seen.insert(&node.id) {
                return Err(EngineError::DuplicateNodeId(node.id.clone()));
            }
        }

        for transition in &self.transitions {
            if self.get_node(&transition.source).is_none() {
                return Err(EngineError::NodeNotFound(transition.source.clone()));
            }
            if self.get_node(&transition.target).is_none() {
                return Err(EngineError::NodeNotFound(transition.target.clone()));
            }
            if transition.is_default && transition.guard.is_some() {
                return Err(EngineError::Validation(format!(
                    "default flow {} -> {} must not carry a guard",
                    transition.source, transition.target
                )));
            }
        }

        for node in &self.nodes {
            self.validate_node(node)?;
        }

        self.validate_reachability()?;

        Ok(())
    }

    fn validate_node(&self, node: &ProcessNode) -> EngineResult<()> {
        let outgoing = self.outgoing(&node.id);
        let defaults = outgoing.iter().filter(|t| t.is_default).count();
        if defaults > 1 {
            return Err(EngineError::Validation(format!(
                "node '{}' declares more than one default flow",
                node.id
            )));
        }

        match &node.kind {
            NodeKind::ExclusiveGateway => {
                // A gateway whose outgoing flows are all guarded needs a
                // fallback, otherwise an unmatched token has nowhere to go.
                if !outgoing.is_empty()
                    && defaults == 0
                    && outgoing.iter().all(|t| t.guard.is_some())
                {
                    return Err(EngineError::Validation(format!(
                        "exclusive gateway '{}' has only guarded flows and no default",
                        node.id
                    )));
                }
            }
            NodeKind::EventGateway => {
                for transition in &outgoing {
                    let target = self
                        .get_node(&transition.target)
                        .ok_or_else(|| EngineError::NodeNotFound(transition.target.clone()))?;
                    if target.catch_definition().is_none() {
                        return Err(EngineError::Validation(format!(
                            "event gateway '{}' target '{}' is not a catching event",
                            node.id, target.id
                        )));
                    }
                }
            }
            NodeKind::BoundaryHost { wrapped, boundary } => {
                let wrapped_node = self
                    .get_node(wrapped)
                    .ok_or_else(|| EngineError::NodeNotFound(wrapped.clone()))?;
                if !self.incoming(&wrapped_node.id).is_empty()
                    || !self.outgoing(&wrapped_node.id).is_empty()
                {
                    return Err(EngineError::Validation(format!(
                        "wrapped node '{}' must not carry sequence flows; the host does",
                        wrapped_node.id
                    )));
                }
                for boundary_id in boundary {
                    let boundary_node = self
                        .get_node(boundary_id)
                        .ok_or_else(|| EngineError::NodeNotFound(boundary_id.clone()))?;
                    if boundary_node.catch_definition().is_none() {
                        return Err(EngineError::Validation(format!(
                            "boundary node '{}' is not a catching event",
                            boundary_id
                        )));
                    }
                    if !self.incoming(boundary_id).is_empty() {
                        return Err(EngineError::Validation(format!(
                            "boundary node '{}' must not have incoming flows",
                            boundary_id
                        )));
                    }
                }
            }
            NodeKind::SubProcess {
                trigger: Some(_), ..
            } => {
                if !self.incoming(&node.id).is_empty() {
                    return Err(EngineError::Validation(format!(
                        "event-started sub-process '{}' must not have incoming flows",
                        node.id
                    )));
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn validate_reachability(&self) -> EngineResult<()> {
        let start = match self.start_node() {
            Some(node) => node,
            None => return Err(EngineError::NoStartNode),
        };
        let reachable = self.reachable_from(&start.id);

        for node in &self.nodes {
            if reachable.contains(&node.id) {
                continue;
            }
            // Event-started sub-processes are armed by events, not flows.
            if matches!(
                node.kind,
                NodeKind::SubProcess {
                    trigger: Some(_),
                    ..
                }
            ) {
                continue;
            }
            return Err(EngineError::Validation(format!(
                "node '{}' is not reachable from the start node",
                node.id
            )));
        }
        Ok(())
    }

    /// Nodes reachable from `start` via transitions and boundary-host
    /// child links.
    pub fn reachable_from(&self, start: &NodeId) -> BTreeSet<NodeId> {
        let mut visited = BTreeSet::new();
        let mut queue = vec![start.clone()];

        while let Some(current) = queue.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            for transition in self.outgoing(&current) {
                queue.push(transition.target.clone());
            }
            if let Some(node) = self.get_node(&current) {
                if let NodeKind::BoundaryHost { wrapped, boundary } = &node.kind {
                    queue.push(wrapped.clone());
                    queue.extend(boundary.iter().cloned());
                }
            }
        }

        visited
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }
}
