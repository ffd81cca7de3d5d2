//! Sub-process lifecycle: spawning nested instances and copying data back
//!
//! When a sub-process owner task first becomes ready, a nested instance is
//! created from the registry definition, registered in the **outermost**
//! instance's table keyed by the owning task id, and seeded per the node's
//! input mapping. When the nested instance reaches completion, the output
//! mapping copies its final data back and the owner leaves `WAITING`.

use process_types::{DataBinding, DataMap, EngineError, EngineResult, NodeKind, TaskId, TaskState};

use crate::instance::{ProcessInstance, Scope};
use crate::stepper::{fail_task, RunContext};

/// Create and register the nested instance for a sub-process owner task.
pub(crate) fn spawn(
    outermost: &mut ProcessInstance,
    ctx: &RunContext,
    scope: &Scope,
    owner: TaskId,
) -> EngineResult<()> {
    let (definition_id, inputs, owner_node, owner_data) = {
        let inst = outermost
            .scope(scope)
            .ok_or(EngineError::TaskNotFound(owner))?;
        let task = inst.expect_task(owner)?;
        let node = inst
            .definition
            .get_node(&task.node)
            .ok_or_else(|| EngineError::NodeNotFound(task.node.clone()))?;
        let NodeKind::SubProcess {
            definition, inputs, ..
        } = &node.kind
        else {
            return Err(EngineError::Validation(format!(
                "node '{}' is not a sub-process",
                task.node
            )));
        };
        (
            definition.clone(),
            inputs.clone(),
            task.node.clone(),
            task.data.clone(),
        )
    };

    let definition = ctx.definitions.get(&definition_id)?;
    let child_data = match &inputs {
        process_types::DataMapping::All => owner_data,
        process_types::DataMapping::Named(bindings) => {
            map_named(bindings, &owner_data, |binding| EngineError::MissingDataInput {
                node: owner_node.clone(),
                variable: binding.target.clone(),
            })?
        }
    };

    let mut nested = ProcessInstance::new(definition, child_data)?;
    nested.owner = Some(owner);
    tracing::debug!(
        owner = %owner,
        definition = %definition_id,
        nested = %nested.id,
        "sub-process instance started"
    );
    outermost.subprocesses.insert(owner, nested);
    Ok(())
}

/// Promote owner tasks whose nested instance has finished: copy outputs per
/// the node's mapping and move the owner back to `READY`.
pub(crate) fn sweep_completions(
    outermost: &mut ProcessInstance,
    _ctx: &RunContext,
) -> EngineResult<()> {
    let finished: Vec<TaskId> = outermost
        .subprocesses
        .iter()
        .filter(|(_, sub)| sub.is_completed() && !sub.error_ended())
        .map(|(owner, _)| *owner)
        .collect();

    for owner in finished {
        let Some(owner_scope) = outermost.locate(owner) else {
            continue;
        };
        let still_waiting = outermost
            .scope(&owner_scope)
            .and_then(|inst| inst.task(owner))
            .map(|t| t.state == TaskState::Waiting && !t.internal.event_fired)
            .unwrap_or(false);
        if !still_waiting {
            continue;
        }

        let nested_data = outermost
            .subprocesses
            .get(&owner)
            .map(|sub| sub.data.clone())
            .unwrap_or_default();

        match copy_outputs(outermost, &owner_scope, owner, &nested_data) {
            Ok(outputs) => {
                let inst = outermost
                    .scope_mut(&owner_scope)
                    .expect("owner scope exists");
                let task = inst.task_mut(owner).expect("owner task exists");
                task.data.extend(outputs);
                task.internal.event_fired = true;
                task.transition(TaskState::Ready);
            }
            Err(err) => {
                fail_task(outermost, owner);
                let trace = outermost.task_trace(owner);
                return Err(err.in_trace(trace));
            }
        }
    }
    Ok(())
}

fn copy_outputs(
    outermost: &ProcessInstance,
    owner_scope: &Scope,
    owner: TaskId,
    nested_data: &DataMap,
) -> EngineResult<DataMap> {
    let inst = outermost
        .scope(owner_scope)
        .ok_or(EngineError::TaskNotFound(owner))?;
    let task = inst.expect_task(owner)?;
    let node = inst
        .definition
        .get_node(&task.node)
        .ok_or_else(|| EngineError::NodeNotFound(task.node.clone()))?;
    let NodeKind::SubProcess { outputs, .. } = &node.kind else {
        return Err(EngineError::Validation(format!(
            "node '{}' is not a sub-process",
            task.node
        )));
    };

    match outputs {
        process_types::DataMapping::All => Ok(nested_data.clone()),
        process_types::DataMapping::Named(bindings) => {
            map_named(bindings, nested_data, |binding| EngineError::MissingDataOutput {
                node: task.node.clone(),
                variable: binding.source.clone(),
            })
        }
    }
}

/// Copy a named subset, renaming source -> target, failing with the
/// caller-supplied error on the first absent variable.
fn map_named(
    bindings: &[DataBinding],
    from: &DataMap,
    missing: impl Fn(&DataBinding) -> EngineError,
) -> EngineResult<DataMap> {
    let mut out = DataMap::new();
    for binding in bindings {
        let value = from.get(&binding.source).ok_or_else(|| missing(binding))?;
        out.insert(binding.target.clone(), value.clone());
    }
    Ok(out)
}
