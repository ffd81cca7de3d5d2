//! Tree rewind and cancellation
//!
//! `reset_to` discards a task's descendants and recreates the task fresh,
//! with two hierarchy-wide obligations: sub-process table entries owned by
//! discarded tasks are removed transitively (a leaked entry would resurface
//! after an unrelated reset), and every enclosing sub-process owner along
//! the chain is put back to `WAITING` so the nested instance resumes.
//! Boundary-event wrappers redirect the reset to themselves so attached
//! events are re-armed, then re-run the originally requested node.

use std::collections::BTreeSet;

use process_types::{DataMap, EngineError, EngineResult, NodeKind, TaskId, TaskState};

use crate::instance::ProcessInstance;
use crate::navigation::Navigator;
use crate::stepper::{cancel_all_live, RunContext, StepEngine};
use crate::task::InternalData;

impl Navigator {
    /// Rewind the token to a task instance, discarding everything that ran
    /// after it. The target is recreated `READY`, optionally seeded with
    /// `data`.
    pub fn reset_to(
        &self,
        outermost: &mut ProcessInstance,
        ctx: &RunContext,
        task_id: TaskId,
        data: Option<DataMap>,
    ) -> EngineResult<()> {
        let scope = outermost
            .locate(task_id)
            .ok_or(EngineError::TaskNotFound(task_id))?;

        // Boundary wrappers absorb the reset so their attached events are
        // re-armed; the originally requested node runs again afterwards.
        let (target, rerun_node) = {
            let inst = outermost.scope(&scope).expect("scope exists");
            let task = inst.expect_task(task_id)?;
            let host_parent = task.parent.filter(|parent| {
                matches!(
                    inst.task(*parent)
                        .and_then(|p| inst.definition.get_node(&p.node))
                        .map(|n| &n.kind),
                    Some(NodeKind::BoundaryHost { .. })
                )
            });
            match host_parent {
                Some(host) => (host, Some(task.node.clone())),
                None => (task_id, None),
            }
        };

        tracing::info!(task = %task_id, target = %target, "resetting instance tree");

        // Discard the target's descendants and recreate it fresh.
        let mut discarded: BTreeSet<TaskId> = BTreeSet::new();
        {
            let inst = outermost.scope_mut(&scope).expect("scope exists");
            discarded.extend(inst.prune_descendants(target));
            let task = inst.task_mut(target).expect("target exists");
            // Resets bypass the monotonic transition table on purpose.
            task.state = TaskState::Ready;
            task.internal = InternalData::default();
            if let Some(seed) = data {
                task.data = seed;
            }
        }
        // The target itself starts over, so a nested instance it owned is
        // stale as well.
        discarded.insert(target);

        // Walk the ownership chain: everything downstream of an enclosing
        // owner ran after the target, and the owner must resume waiting on
        // its (now rewound) nested instance.
        let mut owner_walk = scope;
        while let Some(owner) = owner_walk {
            let owner_scope = outermost
                .locate(owner)
                .ok_or(EngineError::TaskNotFound(owner))?;
            let inst = outermost.scope_mut(&owner_scope).expect("scope exists");
            discarded.extend(inst.prune_descendants(owner));
            let task = inst.task_mut(owner).expect("owner exists");
            task.state = TaskState::Waiting;
            task.internal.event_fired = false;
            task.internal.interrupted = false;
            owner_walk = owner_scope;
        }

        remove_discarded_subprocesses(outermost, discarded);

        // Land the token exactly where requested.
        if let Some(original) = rerun_node {
            let stepper = StepEngine::new();
            stepper.run_single(outermost, ctx, target)?;
            let landed = outermost
                .scope(&scope)
                .and_then(|inst| {
                    let host = inst.task(target)?;
                    host.children
                        .iter()
                        .filter_map(|c| inst.task(*c))
                        .find(|c| c.node == original && c.state == TaskState::Ready)
                        .map(|c| c.id)
                });
            if let Some(child) = landed {
                let automatic = outermost
                    .scope(&scope)
                    .and_then(|inst| inst.definition.get_node(&original))
                    .map(|n| n.is_automatic())
                    .unwrap_or(false);
                if automatic {
                    stepper.run_single(outermost, ctx, child)?;
                }
            }
        }

        Ok(())
    }

    /// Cancel the whole tree: every live task in the hierarchy becomes
    /// `CANCELLED`, recursing into sub-processes owned by newly-cancelled
    /// tasks. Returns the full cancelled set.
    pub fn cancel(&self, outermost: &mut ProcessInstance) -> Vec<TaskId> {
        let local = cancel_all_live(outermost, None);
        let mut all = local.clone();
        let mut pending = local;
        while let Some(owner) = pending.pop() {
            if let Some(sub) = outermost.subprocesses.get_mut(&owner) {
                let newly = cancel_all_live(sub, None);
                all.extend(newly.iter().copied());
                pending.extend(newly);
            }
        }
        tracing::info!(count = all.len(), "instance tree cancelled");
        all
    }
}

/// Cancel the nested instances owned by these (already cancelled) tasks,
/// recursing through ownership via the flat outermost table.
pub(crate) fn cancel_nested_of(outermost: &mut ProcessInstance, owners: &[TaskId]) {
    let mut pending: Vec<TaskId> = owners.to_vec();
    while let Some(owner) = pending.pop() {
        if let Some(sub) = outermost.subprocesses.get_mut(&owner) {
            let newly = cancel_all_live(sub, None);
            pending.extend(newly);
        }
    }
}

/// Drop sub-process table entries owned by discarded tasks, transitively:
/// tasks living inside a removed nested instance are discarded too.
fn remove_discarded_subprocesses(outermost: &mut ProcessInstance, mut discarded: BTreeSet<TaskId>) {
    loop {
        let stale: Vec<TaskId> = outermost
            .subprocesses
            .keys()
            .filter(|owner| discarded.contains(owner))
            .copied()
            .collect();
        if stale.is_empty() {
            return;
        }
        for owner in stale {
            if let Some(sub) = outermost.subprocesses.remove(&owner) {
                tracing::debug!(owner = %owner, nested = %sub.id, "discarded sub-process entry");
                discarded.extend(sub.tasks.keys().copied());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::ProcessInstance;
    use process_types::{NodeId, ProcessDefinition, ProcessNode, Transition};
    use std::sync::Arc;

    fn instance() -> ProcessInstance {
        let mut def = ProcessDefinition::new("p", "P");
        def.add_node(ProcessNode::start("start")).unwrap();
        def.add_node(ProcessNode::task("a", "A")).unwrap();
        def.add_node(ProcessNode::end("end")).unwrap();
        def.add_transition(Transition::new("start", "a")).unwrap();
        def.add_transition(Transition::new("a", "end")).unwrap();
        ProcessInstance::new(Arc::new(def), DataMap::new()).unwrap()
    }

    #[test]
    fn test_remove_discarded_is_transitive() {
        let mut outer = instance();
        let owner_a = outer.alloc_task(
            NodeId::new("a"),
            Some(outer.root()),
            TaskState::Waiting,
            DataMap::new(),
        );

        // owner_a owns sub1; a task inside sub1 owns sub2.
        let mut sub1 = instance();
        let inner_owner = sub1.alloc_task(
            NodeId::new("a"),
            Some(sub1.root()),
            TaskState::Waiting,
            DataMap::new(),
        );
        let sub2 = instance();
        outer.subprocesses.insert(owner_a, sub1);
        outer.subprocesses.insert(inner_owner, sub2);

        let discarded: BTreeSet<TaskId> = [owner_a].into_iter().collect();
        remove_discarded_subprocesses(&mut outer, discarded);

        assert_eq!(outer.subprocess_count(), 0);
    }

    #[test]
    fn test_cancel_nested_of_recurses() {
        let mut outer = instance();
        let owner = outer.alloc_task(
            NodeId::new("a"),
            Some(outer.root()),
            TaskState::Waiting,
            DataMap::new(),
        );
        let mut sub = instance();
        let inner_owner = sub.alloc_task(
            NodeId::new("a"),
            Some(sub.root()),
            TaskState::Waiting,
            DataMap::new(),
        );
        let sub2 = instance();
        outer.subprocesses.insert(owner, sub);
        outer.subprocesses.insert(inner_owner, sub2);

        cancel_nested_of(&mut outer, &[owner]);

        let sub = outer.subprocess_of(owner).unwrap();
        assert!(sub.tasks.values().all(|t| !t.state.is_live()));
        let sub2 = outer.subprocess_of(inner_owner).unwrap();
        assert!(sub2.tasks.values().all(|t| !t.state.is_live()));
    }
}
