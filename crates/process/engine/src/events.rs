//! Event catching, throwing and message correlation
//!
//! `catch` is the single funnel every event goes through: it arms
//! event-started sub-processes, gathers **every** matching waiting catch
//! task across the whole hierarchy before resolving any of them (so
//! boundary events racing on one event each get their chance), resolves
//! the collected set, refreshes waiting tasks, and surfaces unconsumed
//! messages on the outbound queue.
//!
//! External messages go through `catch_external_message`, which is atomic:
//! correlation properties are computed and validated against the store in
//! full before any instance is touched.

use std::collections::BTreeMap;

use process_expr::DataMap;
use process_types::{
    CaughtEvent, CorrelationProperty, EngineError, EngineResult, EventDefinition, NodeId,
    NodeKind, TaskId, TaskState,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::instance::{ProcessInstance, Scope};
use crate::stepper::{cancel_live_children, fail_task, wrap_expression, RunContext, StepEngine};

/// Correlation bindings: key name -> property name -> value.
pub type CorrelationSet = BTreeMap<String, BTreeMap<String, Value>>;

/// A message no internal task consumed, surfaced for an external actor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub name: String,
    pub payload: Option<DataMap>,
}

/// Delivers events to the correct waiting tasks across the hierarchy.
#[derive(Clone, Debug, Default)]
pub struct EventRouter;

impl EventRouter {
    pub fn new() -> Self {
        Self
    }

    /// Deliver an event occurrence to the hierarchy.
    ///
    /// Returns the resolved task instances. A message event that neither
    /// started a sub-process nor resolved a waiter lands on the outbound
    /// queue.
    pub fn catch(
        &self,
        outermost: &mut ProcessInstance,
        ctx: &RunContext,
        event: &CaughtEvent,
        correlations: Option<&CorrelationSet>,
    ) -> EngineResult<Vec<TaskId>> {
        let (_, resolved) = self.catch_inner(outermost, ctx, event, correlations)?;
        Ok(resolved)
    }

    fn catch_inner(
        &self,
        outermost: &mut ProcessInstance,
        ctx: &RunContext,
        event: &CaughtEvent,
        correlations: Option<&CorrelationSet>,
    ) -> EngineResult<(usize, Vec<TaskId>)> {
        let started = self.start_triggered(outermost, event)?;
        if started > 0 {
            if let Some(bindings) = correlations {
                merge_correlation_set(outermost, bindings)?;
            }
        }

        // Gather every match before resolving any of them.
        let candidates = self.collect_waiters(outermost, event, correlations);
        let mut resolved = Vec::new();
        for (scope, task_id) in candidates {
            if self.resolve(outermost, &scope, task_id, event) {
                resolved.push(task_id);
            }
        }

        StepEngine::new().refresh_waiting(outermost, ctx)?;

        if resolved.is_empty() && started == 0 {
            if let EventDefinition::Message { name, .. } = &event.definition {
                tracing::debug!(message = %name, "message not consumed internally; queued outbound");
                outermost.outbound.push(OutboundMessage {
                    name: name.clone(),
                    payload: event.payload.clone(),
                });
            }
        }
        Ok((started, resolved))
    }

    /// Deliver an external message by exact name.
    ///
    /// Exactly one waiting task may match; its conversation is resolved from
    /// the message definition's correlation properties and validated against
    /// the store before anything is mutated.
    pub fn catch_external_message(
        &self,
        outermost: &mut ProcessInstance,
        ctx: &RunContext,
        name: &str,
        payload: DataMap,
    ) -> EngineResult<TaskId> {
        let candidates = self.message_waiters(outermost, name);
        if candidates.is_empty() {
            return Err(EngineError::NoMatchingWaiter {
                message: name.to_string(),
            });
        }
        if candidates.len() > 1 {
            return Err(EngineError::AmbiguousMessageTarget {
                message: name.to_string(),
                count: candidates.len(),
            });
        }
        let (scope, task_id, node_id, properties) = candidates.into_iter().next().expect("one candidate");

        let computed = compute_correlations(ctx, &node_id, &properties, &payload)?;
        if computed.is_empty() {
            return Err(EngineError::UnresolvedConversation {
                message: name.to_string(),
            });
        }
        validate_bindings(&outermost.correlations, &computed)?;
        bind_correlations(outermost, computed);

        let event = CaughtEvent::with_payload(
            EventDefinition::Message {
                name: name.to_string(),
                properties,
            },
            payload,
        );
        self.resolve(outermost, &scope, task_id, &event);
        StepEngine::new().refresh_waiting(outermost, ctx)?;
        tracing::info!(message = %name, task = %task_id, "external message delivered");
        Ok(task_id)
    }

    /// Whether this hierarchy has exactly one waiter for the message and the
    /// payload's correlation properties agree with its store. Used for
    /// routing a message across several live instances without mutating any.
    pub(crate) fn would_accept(
        &self,
        outermost: &ProcessInstance,
        ctx: &RunContext,
        name: &str,
        payload: &DataMap,
    ) -> bool {
        let mut candidates = self.message_waiters(outermost, name);
        if candidates.len() != 1 {
            return false;
        }
        let (_, _, node_id, properties) = candidates.remove(0);
        match compute_correlations(ctx, &node_id, &properties, payload) {
            Ok(computed) if !computed.is_empty() => {
                validate_bindings(&outermost.correlations, &computed).is_ok()
            }
            _ => false,
        }
    }

    /// Route a thrown event: bind message correlations from the payload
    /// snapshot, deliver through `catch`, and escalate unhandled errors to
    /// the owning task.
    pub(crate) fn throw_from(
        &self,
        outermost: &mut ProcessInstance,
        ctx: &RunContext,
        scope: &Scope,
        thrower: TaskId,
        event: CaughtEvent,
    ) -> EngineResult<()> {
        if let EventDefinition::Message { properties, .. } = &event.definition {
            if !properties.is_empty() {
                let payload = event.payload.clone().unwrap_or_default();
                let node_id = outermost
                    .find_task(thrower)
                    .map(|t| t.node.clone())
                    .unwrap_or_else(|| NodeId::new("unknown"));
                let computed = compute_correlations(ctx, &node_id, properties, &payload)?;
                validate_bindings(&outermost.correlations, &computed)?;
                bind_correlations(outermost, computed);
            }
        }

        let (started, resolved) = self.catch_inner(outermost, ctx, &event, None)?;

        if started == 0 && resolved.is_empty() {
            match &event.definition {
                EventDefinition::Error { code } => {
                    // Nothing caught the error: the owning task of the
                    // throwing instance fails; at the outermost level the
                    // failure surfaces directly.
                    let failed = scope.unwrap_or(thrower);
                    if scope.is_some() {
                        fail_task(outermost, failed);
                    }
                    let trace = outermost.task_trace(failed);
                    return Err(EngineError::UnhandledError { code: code.clone() }.in_trace(trace));
                }
                EventDefinition::Escalation { code } => {
                    tracing::debug!(?code, "escalation had no catcher; dropped");
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────────

    /// Arm event-started sub-processes whose trigger matches. An existing
    /// live owner suppresses a second start, except a parallel-multiple
    /// trigger still accumulating, which the event is delivered into.
    fn start_triggered(
        &self,
        outermost: &mut ProcessInstance,
        event: &CaughtEvent,
    ) -> EngineResult<usize> {
        let mut work: Vec<(Scope, NodeId, EventDefinition)> = Vec::new();
        for scope in outermost.scopes() {
            let Some(inst) = outermost.scope(&scope) else {
                continue;
            };
            for node in inst.definition.triggered_sub_processes() {
                if let NodeKind::SubProcess {
                    trigger: Some(trigger),
                    ..
                } = &node.kind
                {
                    if trigger.matches(&event.definition) {
                        work.push((scope, node.id.clone(), trigger.clone()));
                    }
                }
            }
        }

        let mut started = 0;
        for (scope, node_id, trigger) in work {
            let Some(inst) = outermost.scope_mut(&scope) else {
                continue;
            };
            match inst.live_instance_of_node(&node_id) {
                Some(existing) => {
                    if let EventDefinition::ParallelMultiple { events } = &trigger {
                        let member = trigger.matching_member(&event.definition);
                        let task = inst.task_mut(existing).expect("live task exists");
                        if task.state == TaskState::Waiting {
                            if let Some(idx) = member {
                                task.internal.fired_members.insert(idx);
                            }
                            if let Some(payload) = &event.payload {
                                task.data.extend(payload.clone());
                            }
                            if task.internal.fired_members.len() == events.len() {
                                task.internal.event_fired = true;
                                task.transition(TaskState::Ready);
                            }
                            started += 1;
                        }
                    }
                }
                None => {
                    let root = inst.root();
                    let seed = inst.data.clone();
                    let id = inst.alloc_task(node_id.clone(), Some(root), TaskState::Waiting, seed);
                    let member = trigger.matching_member(&event.definition);
                    let accumulating = matches!(&trigger, EventDefinition::ParallelMultiple { events } if events.len() > 1);
                    let task = inst.task_mut(id).expect("task exists");
                    if let Some(payload) = &event.payload {
                        task.data.extend(payload.clone());
                    }
                    if let Some(idx) = member {
                        task.internal.fired_members.insert(idx);
                    }
                    if !accumulating {
                        task.internal.event_fired = true;
                        task.transition(TaskState::Ready);
                    }
                    tracing::debug!(node = %node_id, "event-started sub-process armed");
                    started += 1;
                }
            }
        }
        Ok(started)
    }

    /// Every waiting catch task matching the event, in scope and creation
    /// order. Collection happens before any resolution.
    fn collect_waiters(
        &self,
        outermost: &ProcessInstance,
        event: &CaughtEvent,
        correlations: Option<&CorrelationSet>,
    ) -> Vec<(Scope, TaskId)> {
        if let Some(claimed) = correlations {
            if !claims_compatible(&outermost.correlations, claimed) {
                return Vec::new();
            }
        }
        let mut found = Vec::new();
        for scope in outermost.scopes() {
            let Some(inst) = outermost.scope(&scope) else {
                continue;
            };
            for task in inst.tasks_in_order() {
                if task.state != TaskState::Waiting {
                    continue;
                }
                let Some(catcher) = inst
                    .definition
                    .get_node(&task.node)
                    .and_then(|n| n.catch_definition())
                else {
                    continue;
                };
                if catcher.matches(&event.definition) {
                    found.push((scope, task.id));
                }
            }
        }
        found
    }

    /// Resolve one collected waiter: store the payload, mark it runnable,
    /// and settle event-gateway races (first resolution wins).
    fn resolve(
        &self,
        outermost: &mut ProcessInstance,
        scope: &Scope,
        task_id: TaskId,
        event: &CaughtEvent,
    ) -> bool {
        let Some(inst) = outermost.scope_mut(scope) else {
            return false;
        };
        let def = inst.definition.clone();
        let Some(task) = inst.task(task_id) else {
            return false;
        };
        if task.state != TaskState::Waiting {
            // A sibling resolution in the same delivery already settled it.
            return false;
        }
        let node_id = task.node.clone();
        let Some(catcher) = def.get_node(&node_id).and_then(|n| n.catch_definition()) else {
            return false;
        };

        if let EventDefinition::ParallelMultiple { events } = catcher {
            let member = catcher.matching_member(&event.definition);
            let task = inst.task_mut(task_id).expect("waiting task exists");
            if let Some(idx) = member {
                task.internal.fired_members.insert(idx);
            }
            if let Some(payload) = &event.payload {
                task.internal
                    .event_payload
                    .get_or_insert_with(DataMap::new)
                    .extend(payload.clone());
            }
            if task.internal.fired_members.len() < events.len() {
                // Delivered, but the composite is still accumulating.
                return true;
            }
        }

        let parent = {
            let task = inst.task_mut(task_id).expect("waiting task exists");
            task.internal.event_fired = true;
            if let Some(payload) = &event.payload {
                task.internal
                    .event_payload
                    .get_or_insert_with(DataMap::new)
                    .extend(payload.clone());
            }
            task.transition(TaskState::Ready);
            task.parent
        };
        tracing::debug!(task = %task_id, node = %node_id, "waiting task resolved by event");

        if let Some(parent_id) = parent {
            let parent_is_gateway = matches!(
                inst.task(parent_id)
                    .and_then(|t| def.get_node(&t.node))
                    .map(|n| &n.kind),
                Some(NodeKind::EventGateway)
            );
            if parent_is_gateway {
                cancel_live_children(inst, parent_id, Some(task_id));
            }
        }
        true
    }

    /// Waiting tasks catching exactly this message name.
    #[allow(clippy::type_complexity)]
    fn message_waiters(
        &self,
        outermost: &ProcessInstance,
        name: &str,
    ) -> Vec<(Scope, TaskId, NodeId, Vec<CorrelationProperty>)> {
        let mut found = Vec::new();
        for scope in outermost.scopes() {
            let Some(inst) = outermost.scope(&scope) else {
                continue;
            };
            for task in inst.tasks_in_order() {
                if task.state != TaskState::Waiting {
                    continue;
                }
                let Some(EventDefinition::Message {
                    name: catcher_name,
                    properties,
                }) = inst
                    .definition
                    .get_node(&task.node)
                    .and_then(|n| n.catch_definition())
                else {
                    continue;
                };
                if catcher_name == name {
                    found.push((scope, task.id, task.node.clone(), properties.clone()));
                }
            }
        }
        found
    }
}

// ── Correlation helpers ──────────────────────────────────────────────

/// Evaluate each retrieval expression against the payload, producing
/// (key, property, value) bindings to validate and store.
fn compute_correlations(
    ctx: &RunContext,
    node: &NodeId,
    properties: &[CorrelationProperty],
    payload: &DataMap,
) -> EngineResult<Vec<(String, String, Value)>> {
    let mut computed = Vec::new();
    for property in properties {
        let value = ctx
            .evaluator
            .evaluate(&property.retrieval, payload)
            .map_err(|e| wrap_expression(node, &property.retrieval, e, payload))?;
        for key in &property.keys {
            computed.push((key.clone(), property.name.clone(), value.clone()));
        }
    }
    Ok(computed)
}

/// Bindings are append-only per conversation: a bound (key, property) pair
/// must be reproduced exactly by any later claim.
fn validate_bindings(
    store: &CorrelationSet,
    computed: &[(String, String, Value)],
) -> EngineResult<()> {
    for (key, property, value) in computed {
        if let Some(bound) = store.get(key).and_then(|props| props.get(property)) {
            if bound != value {
                return Err(EngineError::CorrelationMismatch {
                    key: key.clone(),
                    property: property.clone(),
                    expected: bound.clone(),
                    actual: value.clone(),
                });
            }
        }
    }
    Ok(())
}

fn bind_correlations(outermost: &mut ProcessInstance, computed: Vec<(String, String, Value)>) {
    for (key, property, value) in computed {
        outermost
            .correlations
            .entry(key)
            .or_default()
            .insert(property, value);
    }
}

/// Merge a caller-supplied correlation set, validating against existing
/// bindings first.
fn merge_correlation_set(
    outermost: &mut ProcessInstance,
    bindings: &CorrelationSet,
) -> EngineResult<()> {
    let flat: Vec<(String, String, Value)> = bindings
        .iter()
        .flat_map(|(key, props)| {
            props
                .iter()
                .map(|(prop, value)| (key.clone(), prop.clone(), value.clone()))
        })
        .collect();
    validate_bindings(&outermost.correlations, &flat)?;
    bind_correlations(outermost, flat);
    Ok(())
}

/// Whether an event's claimed correlations agree with the store. Used to
/// gate delivery, not to mutate.
fn claims_compatible(store: &CorrelationSet, claimed: &CorrelationSet) -> bool {
    claimed.iter().all(|(key, props)| {
        props.iter().all(|(prop, value)| {
            store
                .get(key)
                .and_then(|bound| bound.get(prop))
                .map(|bound| bound == value)
                .unwrap_or(true)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(entries: &[(&str, &str, Value)]) -> CorrelationSet {
        let mut out = CorrelationSet::new();
        for (key, prop, value) in entries {
            out.entry(key.to_string())
                .or_default()
                .insert(prop.to_string(), value.clone());
        }
        out
    }

    #[test]
    fn test_validate_bindings_detects_mismatch() {
        let store = set(&[("order", "order_id", json!("A"))]);
        let ok = vec![("order".into(), "order_id".into(), json!("A"))];
        assert!(validate_bindings(&store, &ok).is_ok());

        let bad = vec![("order".into(), "order_id".into(), json!("B"))];
        let err = validate_bindings(&store, &bad).unwrap_err();
        assert!(matches!(err, EngineError::CorrelationMismatch { .. }));
    }

    #[test]
    fn test_unbound_pairs_are_new_bindings() {
        let store = CorrelationSet::new();
        let fresh = vec![("order".into(), "order_id".into(), json!("A"))];
        assert!(validate_bindings(&store, &fresh).is_ok());
    }

    #[test]
    fn test_claims_compatible() {
        let store = set(&[("order", "order_id", json!("A"))]);
        assert!(claims_compatible(&store, &set(&[("order", "order_id", json!("A"))])));
        assert!(!claims_compatible(&store, &set(&[("order", "order_id", json!("B"))])));
        // Unbound keys are always compatible.
        assert!(claims_compatible(&store, &set(&[("ticket", "id", json!(7))])));
    }
}
