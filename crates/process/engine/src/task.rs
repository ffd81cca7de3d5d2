//! Task instances: runtime occurrences of nodes
//!
//! A task instance tracks one traversal of one node. Instances are owned by
//! their parent through the instance tree arena; terminal instances stay in
//! the tree as history, only resets delete them.

use chrono::{DateTime, Utc};
use process_types::{DataMap, NodeId, TaskId, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Auxiliary bookkeeping carried by a task instance.
///
/// Not visible to evaluators: expressions only ever see [`TaskInstance::data`]
/// merged over the instance data.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InternalData {
    /// Children have been spawned (boundary hosts, event gateways,
    /// sub-process owners).
    pub spawned: bool,
    /// The awaited event has been delivered, or the nested instance has
    /// completed.
    pub event_fired: bool,
    /// Payload stored by the event subsystem when the event resolved.
    pub event_payload: Option<DataMap>,
    /// Deadline computed when a timer catch was armed.
    pub timer_due: Option<DateTime<Utc>>,
    /// Source nodes whose branches have arrived at this join.
    pub arrivals: BTreeSet<NodeId>,
    /// Members of a parallel-multiple catch that have fired so far.
    pub fired_members: BTreeSet<usize>,
    /// A boundary event fired on this host; the normal flow is not taken.
    pub interrupted: bool,
}

/// A runtime occurrence of a node within one process instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    /// Globally unique across the whole nesting hierarchy.
    pub id: TaskId,
    /// The node this instance traverses.
    pub node: NodeId,
    pub state: TaskState,
    /// Owning parent; `None` only for the tree root.
    pub parent: Option<TaskId>,
    /// Owned children, in creation order.
    pub children: Vec<TaskId>,
    /// Instance-local data; independent per task until merged into the
    /// instance data on completion.
    pub data: DataMap,
    pub internal: InternalData,
    /// Creation order within the owning instance; drives round ordering.
    pub seq: u64,
}

impl TaskInstance {
    pub fn new(
        id: TaskId,
        node: NodeId,
        parent: Option<TaskId>,
        state: TaskState,
        data: DataMap,
        seq: u64,
    ) -> Self {
        Self {
            id,
            node,
            state,
            parent,
            children: Vec::new(),
            data,
            internal: InternalData::default(),
            seq,
        }
    }

    /// Move to `next` along a legal state-machine edge.
    ///
    /// Reset and cancel are the only operations allowed to bypass this; they
    /// assign the state directly.
    pub fn transition(&mut self, next: TaskState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal task transition {} -> {} at node {}",
            self.state,
            next,
            self.node
        );
        tracing::trace!(task = %self.id, node = %self.node, from = %self.state, to = %next, "task transition");
        self.state = next;
    }
}
