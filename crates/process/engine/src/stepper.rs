//! Step engine: the advance / refresh-waiting execution loop
//!
//! `advance` repeatedly collects `READY` tasks whose nodes are automatic and
//! executes their node-specific behavior until a fixed point (or a caller
//! supplied stop node). Node behavior runs against one instance of the
//! hierarchy at a time and returns [`Effect`]s — sub-process spawns, event
//! throws, nested cancellations — that are applied afterwards at the
//! outermost level, so no two instances are ever borrowed mutably at once.
//!
//! Timers and external events are never polled here: `refresh_waiting` is
//! the caller's re-entry point after sleeping or delivering an event.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use process_expr::{closest_match, Evaluator, RuleEvaluator, RuleOutcome};
use process_types::{
    CaughtEvent, DataMap, EngineError, EngineResult, EventDefinition, NodeId, NodeKind, TaskId,
    TaskKind, TaskState, Transition,
};
use serde_json::Value;

use crate::events::EventRouter;
use crate::instance::{ProcessInstance, Scope};
use crate::registry::DefinitionRegistry;
use crate::{reset, subprocess};

/// Shared services node behavior runs against.
///
/// The evaluator is resolved once at the outermost runtime and passed down
/// by reference so every nested instance, however deep, uses the same one.
pub struct RunContext<'a> {
    pub definitions: &'a DefinitionRegistry,
    pub evaluator: &'a Arc<dyn Evaluator>,
    pub rules: &'a BTreeMap<String, Arc<dyn RuleEvaluator>>,
}

/// A deferred mutation that must be applied at the outermost instance.
#[derive(Debug)]
pub(crate) enum Effect {
    /// A sub-process node became ready; create and register the nested
    /// instance for its owner task.
    SpawnSubprocess { scope: Scope, owner: TaskId },
    /// An event left a task; route it through the event subsystem.
    Throw {
        scope: Scope,
        thrower: TaskId,
        event: CaughtEvent,
    },
    /// These tasks were cancelled; cancel any nested instances they own.
    CancelSubprocesses { owners: Vec<TaskId> },
}

/// Executes automatically-runnable tasks until a fixed point.
#[derive(Clone, Debug, Default)]
pub struct StepEngine;

impl StepEngine {
    pub fn new() -> Self {
        Self
    }

    /// Run all automatic `READY` tasks to a fixed point.
    ///
    /// When `stop_at` is given, execution stops right after an instance of
    /// that node runs. Returns the last executed task, if any. Calling
    /// `advance` again at the fixed point performs no mutation.
    pub fn advance(
        &self,
        outermost: &mut ProcessInstance,
        ctx: &RunContext,
        stop_at: Option<&NodeId>,
    ) -> EngineResult<Option<TaskId>> {
        let mut last = None;
        loop {
            self.refresh_structural(outermost, ctx)?;
            let round = collect_ready_automatic(outermost);
            if round.is_empty() {
                break;
            }
            for (scope, task_id) in round {
                // An earlier execution in this round may have cancelled or
                // consumed this task (boundary interrupts, event gateways).
                let Some(node_id) = ready_node(outermost, &scope, task_id) else {
                    continue;
                };
                self.execute(outermost, ctx, &scope, task_id)?;
                last = Some(task_id);
                if stop_at == Some(&node_id) {
                    return Ok(last);
                }
            }
        }
        Ok(last)
    }

    /// Re-evaluate every `WAITING` task's readiness predicate, including
    /// timer deadlines, and promote satisfied tasks to `READY`.
    pub fn refresh_waiting(
        &self,
        outermost: &mut ProcessInstance,
        ctx: &RunContext,
    ) -> EngineResult<()> {
        self.refresh_structural(outermost, ctx)?;
        let now = Utc::now();
        for scope in outermost.scopes() {
            let Some(inst) = outermost.scope_mut(&scope) else {
                continue;
            };
            let waiting: Vec<TaskId> = inst
                .tasks
                .values()
                .filter(|t| t.state == TaskState::Waiting)
                .map(|t| t.id)
                .collect();
            for task_id in waiting {
                if catch_is_due(inst, task_id, now) {
                    let task = inst.task_mut(task_id).expect("waiting task exists");
                    task.internal.event_fired = true;
                    task.transition(TaskState::Ready);
                }
            }
        }
        Ok(())
    }

    /// Execute one `READY` task, automatic or not (used for user tasks and
    /// reset landings).
    pub(crate) fn run_single(
        &self,
        outermost: &mut ProcessInstance,
        ctx: &RunContext,
        task_id: TaskId,
    ) -> EngineResult<()> {
        let scope = outermost
            .locate(task_id)
            .ok_or(EngineError::TaskNotFound(task_id))?;
        let state = outermost
            .find_task(task_id)
            .map(|t| t.state)
            .ok_or(EngineError::TaskNotFound(task_id))?;
        if state != TaskState::Ready {
            return Err(EngineError::TaskNotReady {
                task: task_id,
                state,
            });
        }
        self.execute(outermost, ctx, &scope, task_id)
    }

    // ── Execution ────────────────────────────────────────────────────

    fn execute(
        &self,
        outermost: &mut ProcessInstance,
        ctx: &RunContext,
        scope: &Scope,
        task_id: TaskId,
    ) -> EngineResult<()> {
        let outcome = {
            let inst = outermost
                .scope_mut(scope)
                .ok_or(EngineError::TaskNotFound(task_id))?;
            on_ready(inst, ctx, scope, task_id)
        };

        match outcome {
            Ok(effects) => {
                for effect in effects {
                    self.apply_effect(outermost, ctx, effect)?;
                }
                Ok(())
            }
            Err(err) => {
                fail_task(outermost, task_id);
                let trace = outermost.task_trace(task_id);
                tracing::warn!(task = %task_id, error = %err, "task execution failed");
                Err(err.in_trace(trace))
            }
        }
    }

    pub(crate) fn apply_effect(
        &self,
        outermost: &mut ProcessInstance,
        ctx: &RunContext,
        effect: Effect,
    ) -> EngineResult<()> {
        match effect {
            Effect::SpawnSubprocess { scope, owner } => {
                if let Err(err) = subprocess::spawn(outermost, ctx, &scope, owner) {
                    fail_task(outermost, owner);
                    let trace = outermost.task_trace(owner);
                    return Err(err.in_trace(trace));
                }
                Ok(())
            }
            Effect::Throw {
                scope,
                thrower,
                event,
            } => EventRouter::new().throw_from(outermost, ctx, &scope, thrower, event),
            Effect::CancelSubprocesses { owners } => {
                reset::cancel_nested_of(outermost, &owners);
                Ok(())
            }
        }
    }

    // ── Structural refresh ───────────────────────────────────────────

    /// Promote `WAITING` tasks whose condition is internal to the tree:
    /// satisfied joins, finished nested instances, boundary hosts whose
    /// wrapped task ended, event gateways whose winner completed. Event and
    /// timer catches are only promoted through `refresh_waiting` / event
    /// delivery.
    fn refresh_structural(
        &self,
        outermost: &mut ProcessInstance,
        ctx: &RunContext,
    ) -> EngineResult<()> {
        subprocess::sweep_completions(outermost, ctx)?;
        for scope in outermost.scopes() {
            let Some(inst) = outermost.scope_mut(&scope) else {
                continue;
            };
            let waiting: Vec<TaskId> = inst
                .tasks
                .values()
                .filter(|t| t.state == TaskState::Waiting)
                .map(|t| t.id)
                .collect();
            for task_id in waiting {
                if structurally_ready(inst, task_id) {
                    inst.task_mut(task_id)
                        .expect("waiting task exists")
                        .transition(TaskState::Ready);
                }
            }
        }
        Ok(())
    }
}

/// Mark a task `ERROR`. Errors can surface while the task is `READY` or
/// after it moved to `WAITING` (failed sub-process spawn), so this assigns
/// directly rather than going through the transition table.
pub(crate) fn fail_task(outermost: &mut ProcessInstance, task_id: TaskId) {
    if let Some(task) = outermost.find_task_mut(task_id) {
        if !task.state.is_terminal() {
            task.state = TaskState::Error;
        }
    }
}

fn ready_node(outermost: &ProcessInstance, scope: &Scope, task_id: TaskId) -> Option<NodeId> {
    let inst = outermost.scope(scope)?;
    let task = inst.task(task_id)?;
    (task.state == TaskState::Ready).then(|| task.node.clone())
}

/// `READY` tasks whose node does not require external input, grouped per
/// scope (outermost first), in creation order within each scope.
fn collect_ready_automatic(outermost: &ProcessInstance) -> Vec<(Scope, TaskId)> {
    let mut round = Vec::new();
    for scope in outermost.scopes() {
        let Some(inst) = outermost.scope(&scope) else {
            continue;
        };
        let mut ready: Vec<&crate::task::TaskInstance> = inst
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Ready)
            .filter(|t| {
                inst.definition
                    .get_node(&t.node)
                    .map(|n| n.is_automatic())
                    .unwrap_or(false)
            })
            .collect();
        ready.sort_by_key(|t| t.seq);
        round.extend(ready.into_iter().map(|t| (scope, t.id)));
    }
    round
}

// ── Node behavior (on ready) ─────────────────────────────────────────

/// Node-specific behavior when a task becomes `READY`, dispatched
/// exhaustively over the node kind.
fn on_ready(
    inst: &mut ProcessInstance,
    ctx: &RunContext,
    scope: &Scope,
    task_id: TaskId,
) -> EngineResult<Vec<Effect>> {
    let def = inst.definition.clone();
    let (node_id, task_data, spawned, interrupted, event_payload) = {
        let task = inst.expect_task(task_id)?;
        (
            task.node.clone(),
            task.data.clone(),
            task.internal.spawned,
            task.internal.interrupted,
            task.internal.event_payload.clone(),
        )
    };
    let node = def
        .get_node(&node_id)
        .ok_or_else(|| EngineError::NodeNotFound(node_id.clone()))?;
    let mut effects = Vec::new();

    match &node.kind {
        NodeKind::StartEvent { .. } => {
            complete_and_flow_all(inst, ctx, task_id)?;
        }

        NodeKind::EndEvent { event: None } => {
            complete_task(inst, task_id);
        }

        NodeKind::EndEvent {
            event: Some(EventDefinition::Terminate),
        } => {
            complete_task(inst, task_id);
            let cancelled = cancel_all_live(inst, Some(task_id));
            effects.push(Effect::CancelSubprocesses { owners: cancelled });
        }

        NodeKind::EndEvent { event: Some(event) } => {
            complete_task(inst, task_id);
            // An error end terminates its instance abnormally: remaining
            // live work is cancelled and the owner resumes only through a
            // boundary catch, never through normal completion.
            if matches!(event, EventDefinition::Error { .. }) {
                let cancelled = cancel_all_live(inst, Some(task_id));
                if !cancelled.is_empty() {
                    effects.push(Effect::CancelSubprocesses { owners: cancelled });
                }
            }
            effects.push(Effect::Throw {
                scope: *scope,
                thrower: task_id,
                event: CaughtEvent::with_payload(event.clone(), task_data),
            });
        }

        NodeKind::Task { kind } => match kind {
            TaskKind::Automatic | TaskKind::User => {
                complete_and_flow_all(inst, ctx, task_id)?;
            }
            TaskKind::Script { script } => {
                let mut script_ctx = eval_context(&inst.data, &task_data);
                ctx.evaluator
                    .execute(script, &mut script_ctx)
                    .map_err(|e| wrap_expression(&node_id, script, e, &script_ctx))?;
                inst.task_mut(task_id).expect("task exists").data = script_ctx;
                complete_and_flow_all(inst, ctx, task_id)?;
            }
            TaskKind::Rule { rule, result } => {
                let evaluator = ctx
                    .rules
                    .get(rule)
                    .ok_or_else(|| EngineError::RuleNotFound { name: rule.clone() })?;
                let decide_ctx = eval_context(&inst.data, &task_data);
                let outcome = evaluator
                    .decide(&decide_ctx)
                    .map_err(|e| wrap_expression(&node_id, rule, e, &decide_ctx))?;
                let value = match outcome {
                    RuleOutcome::Single(row) => Value::Object(row.into_iter().collect()),
                    RuleOutcome::Collect(rows) => Value::Array(
                        rows.into_iter()
                            .map(|row| Value::Object(row.into_iter().collect()))
                            .collect(),
                    ),
                };
                inst.task_mut(task_id)
                    .expect("task exists")
                    .data
                    .insert(result.clone(), value);
                complete_and_flow_all(inst, ctx, task_id)?;
            }
        },

        NodeKind::ExclusiveGateway => {
            let outgoing: Vec<Transition> = def.outgoing(&node_id).into_iter().cloned().collect();
            let guard_ctx = eval_context(&inst.data, &task_data);
            let mut chosen = None;
            for transition in outgoing.iter().filter(|t| !t.is_default) {
                let taken = match &transition.guard {
                    None => true,
                    Some(guard) => eval_guard(ctx, &node_id, guard, &guard_ctx)?,
                };
                if taken {
                    chosen = Some(transition.target.clone());
                    break;
                }
            }
            if chosen.is_none() {
                chosen = outgoing
                    .iter()
                    .find(|t| t.is_default)
                    .map(|t| t.target.clone());
            }
            let target = chosen.ok_or(EngineError::Guarding {
                node: node_id.clone(),
            })?;
            complete_task(inst, task_id);
            spawn_target(inst, ctx, task_id, &target)?;
        }

        NodeKind::ParallelGateway => {
            complete_and_flow_all(inst, ctx, task_id)?;
        }

        NodeKind::InclusiveGateway => {
            let outgoing: Vec<Transition> = def.outgoing(&node_id).into_iter().cloned().collect();
            let guard_ctx = eval_context(&inst.data, &task_data);
            let mut selected = Vec::new();
            for transition in outgoing.iter().filter(|t| !t.is_default) {
                let taken = match &transition.guard {
                    None => true,
                    Some(guard) => eval_guard(ctx, &node_id, guard, &guard_ctx)?,
                };
                if taken {
                    selected.push(transition.target.clone());
                }
            }
            if selected.is_empty() {
                selected.extend(
                    outgoing
                        .iter()
                        .filter(|t| t.is_default)
                        .map(|t| t.target.clone()),
                );
            }
            if selected.is_empty() && !outgoing.is_empty() {
                return Err(EngineError::Guarding {
                    node: node_id.clone(),
                });
            }
            complete_task(inst, task_id);
            for target in selected {
                spawn_target(inst, ctx, task_id, &target)?;
            }
        }

        NodeKind::EventGateway => {
            if !spawned {
                let targets: Vec<NodeId> = def
                    .outgoing(&node_id)
                    .into_iter()
                    .map(|t| t.target.clone())
                    .collect();
                let task = inst.task_mut(task_id).expect("task exists");
                task.internal.spawned = true;
                task.transition(TaskState::Waiting);
                for target in targets {
                    spawn_waiting_catch(inst, ctx, task_id, &target)?;
                }
            } else {
                // A winning branch completed; the gateway is history.
                complete_task(inst, task_id);
            }
        }

        NodeKind::CatchEvent { .. } => {
            if let Some(payload) = event_payload {
                inst.task_mut(task_id)
                    .expect("task exists")
                    .data
                    .extend(payload);
            }
            fire_boundary_interrupt(inst, task_id, &mut effects);
            complete_and_flow_all(inst, ctx, task_id)?;
        }

        NodeKind::ThrowEvent { event } => {
            effects.push(Effect::Throw {
                scope: *scope,
                thrower: task_id,
                event: CaughtEvent::with_payload(event.clone(), task_data),
            });
            complete_and_flow_all(inst, ctx, task_id)?;
        }

        NodeKind::SubProcess { .. } => {
            if !spawned {
                let task = inst.task_mut(task_id).expect("task exists");
                task.internal.spawned = true;
                // From here on the flag tracks nested-instance completion,
                // not the start trigger that may have armed this owner.
                task.internal.event_fired = false;
                task.transition(TaskState::Waiting);
                effects.push(Effect::SpawnSubprocess {
                    scope: *scope,
                    owner: task_id,
                });
            } else {
                // Nested instance finished and outputs were copied back.
                complete_and_flow_all(inst, ctx, task_id)?;
            }
        }

        NodeKind::BoundaryHost { wrapped, boundary } => {
            if !spawned {
                let wrapped = wrapped.clone();
                let boundary: Vec<NodeId> = boundary.clone();
                let task = inst.task_mut(task_id).expect("task exists");
                task.internal.spawned = true;
                task.transition(TaskState::Waiting);
                spawn_host_child(inst, ctx, task_id, &wrapped)?;
                for node in &boundary {
                    spawn_waiting_catch(inst, ctx, task_id, node)?;
                }
            } else if interrupted {
                // A boundary event took over; the normal flow is not run.
                complete_task(inst, task_id);
            } else {
                let cancelled = cancel_live_children(inst, task_id, None);
                if !cancelled.is_empty() {
                    effects.push(Effect::CancelSubprocesses { owners: cancelled });
                }
                complete_and_flow_all(inst, ctx, task_id)?;
            }
        }
    }

    Ok(effects)
}

// ── Completion and flow ──────────────────────────────────────────────

/// Complete a task and merge its data into the instance data.
pub(crate) fn complete_task(inst: &mut ProcessInstance, task_id: TaskId) {
    if let Some(task) = inst.task_mut(task_id) {
        task.transition(TaskState::Completed);
    }
    inst.merge_task_data(task_id);
}

/// Complete a task and take every outgoing transition.
fn complete_and_flow_all(
    inst: &mut ProcessInstance,
    ctx: &RunContext,
    task_id: TaskId,
) -> EngineResult<()> {
    let def = inst.definition.clone();
    let node_id = inst.expect_task(task_id)?.node.clone();
    complete_task(inst, task_id);
    let targets: Vec<NodeId> = def
        .outgoing(&node_id)
        .into_iter()
        .map(|t| t.target.clone())
        .collect();
    for target in targets {
        spawn_target(inst, ctx, task_id, &target)?;
    }
    Ok(())
}

/// Instantiate the target of a taken transition under its predecessor.
///
/// Joins are single instances per node occurrence: the first arriving
/// branch creates the waiting instance, later branches record into it.
fn spawn_target(
    inst: &mut ProcessInstance,
    ctx: &RunContext,
    creator: TaskId,
    target: &NodeId,
) -> EngineResult<()> {
    let def = inst.definition.clone();
    let node = def
        .get_node(target)
        .ok_or_else(|| EngineError::NodeNotFound(target.clone()))?;
    let (creator_node, creator_data) = {
        let task = inst.expect_task(creator)?;
        (task.node.clone(), task.data.clone())
    };

    let is_join = matches!(
        node.kind,
        NodeKind::ParallelGateway | NodeKind::InclusiveGateway
    ) && def.incoming(target).len() > 1;

    if is_join {
        let join_id = match inst.live_instance_of_node(target) {
            Some(existing) => {
                let join = inst.task_mut(existing).expect("join exists");
                join.data.extend(creator_data);
                join.internal.arrivals.insert(creator_node);
                existing
            }
            None => {
                let id = inst.alloc_task(
                    target.clone(),
                    Some(creator),
                    TaskState::Waiting,
                    creator_data,
                );
                inst.task_mut(id)
                    .expect("join exists")
                    .internal
                    .arrivals
                    .insert(creator_node);
                id
            }
        };
        if join_is_satisfied(inst, join_id) {
            inst.task_mut(join_id)
                .expect("join exists")
                .transition(TaskState::Ready);
        }
        return Ok(());
    }

    if matches!(node.kind, NodeKind::CatchEvent { .. }) {
        return spawn_waiting_catch(inst, ctx, creator, target);
    }

    inst.alloc_task(target.clone(), Some(creator), TaskState::Ready, creator_data);
    Ok(())
}

/// Create a waiting catch-event instance and arm its timer, if it has one.
fn spawn_waiting_catch(
    inst: &mut ProcessInstance,
    ctx: &RunContext,
    parent: TaskId,
    target: &NodeId,
) -> EngineResult<()> {
    let parent_data = inst.expect_task(parent)?.data.clone();
    let id = inst.alloc_task(target.clone(), Some(parent), TaskState::Waiting, parent_data);
    arm_catch(inst, ctx, id)
}

/// Create the wrapped child of a boundary host in its natural initial state.
fn spawn_host_child(
    inst: &mut ProcessInstance,
    ctx: &RunContext,
    host: TaskId,
    wrapped: &NodeId,
) -> EngineResult<()> {
    let def = inst.definition.clone();
    let node = def
        .get_node(wrapped)
        .ok_or_else(|| EngineError::NodeNotFound(wrapped.clone()))?;
    if matches!(node.kind, NodeKind::CatchEvent { .. }) {
        return spawn_waiting_catch(inst, ctx, host, wrapped);
    }
    let host_data = inst.expect_task(host)?.data.clone();
    inst.alloc_task(wrapped.clone(), Some(host), TaskState::Ready, host_data);
    Ok(())
}

/// Compute a timer catch's deadline when it is armed. Timers are polled via
/// `refresh_waiting`, so the deadline must be fixed up front.
fn arm_catch(inst: &mut ProcessInstance, ctx: &RunContext, task_id: TaskId) -> EngineResult<()> {
    let def = inst.definition.clone();
    let (node_id, task_data) = {
        let task = inst.expect_task(task_id)?;
        (task.node.clone(), task.data.clone())
    };
    let Some(NodeKind::CatchEvent {
        event: EventDefinition::Timer { expression },
    }) = def.get_node(&node_id).map(|n| &n.kind)
    else {
        return Ok(());
    };

    let timer_ctx = eval_context(&inst.data, &task_data);
    let value = ctx
        .evaluator
        .evaluate(expression, &timer_ctx)
        .map_err(|e| wrap_expression(&node_id, expression, e, &timer_ctx))?;
    let due = timer_due(&value, Utc::now()).map_err(|e| wrap_expression(&node_id, expression, e, &timer_ctx))?;
    inst.task_mut(task_id).expect("task exists").internal.timer_due = Some(due);
    Ok(())
}

/// Resolve a timer expression result to a deadline: seconds from now, an
/// ISO-8601 `PT…` duration, or an RFC 3339 date-time.
fn timer_due(value: &Value, now: DateTime<Utc>) -> Result<DateTime<Utc>, process_expr::ExpressionError> {
    match value {
        Value::Number(n) => {
            let seconds = n.as_f64().unwrap_or(0.0);
            Ok(now + Duration::milliseconds((seconds * 1000.0) as i64))
        }
        Value::String(s) => {
            if let Ok(instant) = DateTime::parse_from_rfc3339(s) {
                return Ok(instant.with_timezone(&Utc));
            }
            parse_iso_duration(s)
                .map(|d| now + d)
                .ok_or_else(|| process_expr::ExpressionError::Runtime {
                    message: format!("'{s}' is neither an RFC 3339 date-time nor an ISO-8601 duration"),
                })
        }
        other => Err(process_expr::ExpressionError::Runtime {
            message: format!("timer expression evaluated to {other}, expected seconds or a date"),
        }),
    }
}

/// A small ISO-8601 duration subset: `PnDTnHnMnS` with any part omitted.
fn parse_iso_duration(text: &str) -> Option<Duration> {
    let rest = text.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, t),
        None => (rest, ""),
    };

    let mut total = Duration::zero();
    let mut number = String::new();
    for ch in date_part.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            number.push(ch);
        } else if ch == 'D' {
            total = total + Duration::days(number.parse::<f64>().ok()? as i64);
            number.clear();
        } else {
            return None;
        }
    }
    if !number.is_empty() {
        return None;
    }
    for ch in time_part.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            number.push(ch);
        } else {
            let amount: f64 = number.parse().ok()?;
            number.clear();
            total = total
                + match ch {
                    'H' => Duration::milliseconds((amount * 3_600_000.0) as i64),
                    'M' => Duration::milliseconds((amount * 60_000.0) as i64),
                    'S' => Duration::milliseconds((amount * 1000.0) as i64),
                    _ => return None,
                };
        }
    }
    if !number.is_empty() {
        return None;
    }
    Some(total)
}

// ── Waiting predicates ───────────────────────────────────────────────

/// Whether a waiting task's condition is satisfied by the tree itself
/// (joins, boundary hosts, event gateways). Event and timer catches are
/// excluded; they resolve through delivery or `refresh_waiting`.
fn structurally_ready(inst: &ProcessInstance, task_id: TaskId) -> bool {
    let Some(task) = inst.task(task_id) else {
        return false;
    };
    let Some(node) = inst.definition.get_node(&task.node) else {
        return false;
    };
    match &node.kind {
        NodeKind::ParallelGateway | NodeKind::InclusiveGateway => join_is_satisfied(inst, task_id),
        NodeKind::BoundaryHost { wrapped, .. } => {
            task.internal.spawned
                && (task.internal.interrupted
                    || child_of_node_completed(inst, task, wrapped))
        }
        NodeKind::EventGateway => {
            task.internal.spawned
                && task
                    .children
                    .iter()
                    .filter_map(|c| inst.task(*c))
                    .any(|c| c.state == TaskState::Completed)
        }
        _ => false,
    }
}

fn child_of_node_completed(
    inst: &ProcessInstance,
    task: &crate::task::TaskInstance,
    node: &NodeId,
) -> bool {
    task.children
        .iter()
        .filter_map(|c| inst.task(*c))
        .any(|c| &c.node == node && c.state == TaskState::Completed)
}

/// Whether an event or timer catch has everything it was waiting for.
fn catch_is_due(inst: &ProcessInstance, task_id: TaskId, now: DateTime<Utc>) -> bool {
    let Some(task) = inst.task(task_id) else {
        return false;
    };
    let Some(NodeKind::CatchEvent { event }) =
        inst.definition.get_node(&task.node).map(|n| &n.kind)
    else {
        return false;
    };
    if task.internal.event_fired {
        return true;
    }
    match event {
        EventDefinition::Timer { .. } => task
            .internal
            .timer_due
            .is_some_and(|due| due <= now),
        EventDefinition::ParallelMultiple { events } => {
            !events.is_empty() && task.internal.fired_members.len() == events.len()
        }
        _ => false,
    }
}

/// Join readiness. Parallel joins wait for every incoming branch; inclusive
/// joins exclude branches no live token can still reach.
pub(crate) fn join_is_satisfied(inst: &ProcessInstance, join_id: TaskId) -> bool {
    let Some(join) = inst.task(join_id) else {
        return false;
    };
    let def = &inst.definition;
    let Some(node) = def.get_node(&join.node) else {
        return false;
    };
    let incoming = def.incoming(&join.node);

    match node.kind {
        NodeKind::ParallelGateway => incoming
            .iter()
            .all(|t| join.internal.arrivals.contains(&t.source)),
        NodeKind::InclusiveGateway => {
            !join.internal.arrivals.is_empty()
                && incoming.iter().all(|t| {
                    join.internal.arrivals.contains(&t.source)
                        || !branch_still_reachable(inst, &t.source, join_id)
                })
        }
        _ => true,
    }
}

/// Whether any live token could still complete the branch ending in
/// `source`. Branches pruned by upstream exclusive choices have no live
/// token that reaches them.
fn branch_still_reachable(inst: &ProcessInstance, source: &NodeId, join_id: TaskId) -> bool {
    let def = &inst.definition;
    inst.tasks
        .values()
        .filter(|t| t.id != join_id && t.state.is_live())
        .any(|t| &t.node == source || def.reachable_from(&t.node).contains(source))
}

// ── Cancellation helpers ─────────────────────────────────────────────

/// Cancel every live task in this instance, optionally sparing one.
/// Returns the cancelled ids (for nested-instance propagation).
pub(crate) fn cancel_all_live(inst: &mut ProcessInstance, except: Option<TaskId>) -> Vec<TaskId> {
    let ids: Vec<TaskId> = inst
        .tasks
        .values()
        .filter(|t| t.state.is_live() && Some(t.id) != except)
        .map(|t| t.id)
        .collect();
    for id in &ids {
        if let Some(task) = inst.task_mut(*id) {
            task.state = TaskState::Cancelled;
        }
    }
    ids
}

/// Cancel a task's live children (and their descendants), optionally
/// sparing one child subtree.
pub(crate) fn cancel_live_children(
    inst: &mut ProcessInstance,
    parent: TaskId,
    except: Option<TaskId>,
) -> Vec<TaskId> {
    let children: Vec<TaskId> = inst
        .task(parent)
        .map(|t| t.children.clone())
        .unwrap_or_default();
    let mut cancelled = Vec::new();
    for child in children {
        if Some(child) == except {
            continue;
        }
        let mut subtree = vec![child];
        subtree.extend(inst.descendants(child));
        for id in subtree {
            if let Some(task) = inst.task_mut(id) {
                if task.state.is_live() {
                    task.state = TaskState::Cancelled;
                    cancelled.push(id);
                }
            }
        }
    }
    cancelled
}

/// When a resolved boundary event executes, interrupt its host: cancel the
/// wrapped task's subtree and the losing boundary siblings, and mark the
/// host so its normal flow is not taken.
fn fire_boundary_interrupt(
    inst: &mut ProcessInstance,
    catch_id: TaskId,
    effects: &mut Vec<Effect>,
) {
    let Some(parent_id) = inst.task(catch_id).and_then(|t| t.parent) else {
        return;
    };
    let is_host = matches!(
        inst.task(parent_id)
            .and_then(|t| inst.definition.get_node(&t.node))
            .map(|n| &n.kind),
        Some(NodeKind::BoundaryHost { .. })
    );
    if !is_host {
        return;
    }

    let cancelled = cancel_live_children(inst, parent_id, Some(catch_id));
    if !cancelled.is_empty() {
        effects.push(Effect::CancelSubprocesses { owners: cancelled });
    }
    if let Some(host) = inst.task_mut(parent_id) {
        host.internal.interrupted = true;
    }
}

// ── Expression helpers ───────────────────────────────────────────────

/// Evaluation context for one task: instance data with task data layered on
/// top, copied fresh for every call.
pub(crate) fn eval_context(instance_data: &DataMap, task_data: &DataMap) -> DataMap {
    let mut merged = instance_data.clone();
    merged.extend(task_data.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Wrap an evaluator failure with the task identity, the offending
/// expression text and a nearest-name suggestion for undefined references.
pub(crate) fn wrap_expression(
    node: &NodeId,
    expression: &str,
    source: process_expr::ExpressionError,
    context: &DataMap,
) -> EngineError {
    let suggestion = source
        .undefined_name()
        .and_then(|name| closest_match(name, context.keys().map(String::as_str)));
    EngineError::Expression {
        node: node.clone(),
        expression: expression.to_string(),
        source,
        suggestion,
    }
}

fn eval_guard(
    ctx: &RunContext,
    node: &NodeId,
    guard: &str,
    data: &DataMap,
) -> EngineResult<bool> {
    match ctx.evaluator.evaluate(guard, data) {
        Ok(Value::Bool(b)) => Ok(b),
        Ok(other) => Err(EngineError::Expression {
            node: node.clone(),
            expression: guard.to_string(),
            source: process_expr::ExpressionError::Runtime {
                message: format!("guard evaluated to {other}, expected a boolean"),
            },
            suggestion: None,
        }),
        Err(e) => Err(wrap_expression(node, guard, e, data)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_iso_duration() {
        assert_eq!(parse_iso_duration("PT30S"), Some(Duration::seconds(30)));
        assert_eq!(parse_iso_duration("PT2M"), Some(Duration::minutes(2)));
        assert_eq!(
            parse_iso_duration("P1DT1H"),
            Some(Duration::days(1) + Duration::hours(1))
        );
        assert_eq!(parse_iso_duration("PT1.5S"), Some(Duration::milliseconds(1500)));
        assert_eq!(parse_iso_duration("30S"), None);
        assert_eq!(parse_iso_duration("PT30X"), None);
        assert_eq!(parse_iso_duration("PT30"), None);
    }

    #[test]
    fn test_timer_due_from_number() {
        let now = Utc::now();
        let due = timer_due(&serde_json::json!(90), now).unwrap();
        assert_eq!(due, now + Duration::seconds(90));
    }

    #[test]
    fn test_timer_due_from_rfc3339() {
        let now = Utc::now();
        let due = timer_due(&serde_json::json!("2030-01-02T03:04:05Z"), now).unwrap();
        assert_eq!(due.to_rfc3339(), "2030-01-02T03:04:05+00:00");
    }

    #[test]
    fn test_timer_due_from_duration_string() {
        let now = Utc::now();
        let due = timer_due(&serde_json::json!("PT45S"), now).unwrap();
        assert_eq!(due, now + Duration::seconds(45));
    }

    #[test]
    fn test_timer_due_rejects_other_values() {
        assert!(timer_due(&serde_json::json!(true), Utc::now()).is_err());
        assert!(timer_due(&serde_json::json!("not a duration"), Utc::now()).is_err());
    }

    #[test]
    fn test_eval_context_layers_task_data() {
        let mut instance_data = DataMap::new();
        instance_data.insert("a".into(), serde_json::json!(1));
        instance_data.insert("b".into(), serde_json::json!(1));
        let mut task_data = DataMap::new();
        task_data.insert("b".into(), serde_json::json!(2));

        let merged = eval_context(&instance_data, &task_data);
        assert_eq!(merged.get("a"), Some(&serde_json::json!(1)));
        assert_eq!(merged.get("b"), Some(&serde_json::json!(2)));
    }
}
