//! The caller-facing runtime facade
//!
//! [`ProcessRuntime`] hosts definitions and live outermost instances and
//! exposes the query/control surface: advancing, event delivery, task
//! completion, resets, cancellation, previews and snapshots. It composes
//! the specialized subsystems rather than reimplementing them.
//!
//! The expression evaluator is resolved once here and shared across every
//! instance and every nesting level; evaluator-level state is therefore
//! process-hierarchy-wide, as sub-processes expect.

use std::collections::BTreeMap;
use std::sync::Arc;

use process_expr::{DefaultEvaluator, Evaluator, RuleEvaluator};
use process_types::{
    CaughtEvent, DataMap, EngineError, EngineResult, InstanceId, NodeId, NodeKind,
    ProcessDefinition, ProcessDefinitionId, TaskId, TaskKind, TaskState,
};

use crate::events::{CorrelationSet, EventRouter};
use crate::instance::{ProcessInstance, TaskSummary};
use crate::navigation::{Navigator, PreviewRow};
use crate::registry::DefinitionRegistry;
use crate::stepper::{RunContext, StepEngine};

/// Hosts definitions and live process instances.
pub struct ProcessRuntime {
    definitions: DefinitionRegistry,
    evaluator: Arc<dyn Evaluator>,
    rules: BTreeMap<String, Arc<dyn RuleEvaluator>>,
    instances: BTreeMap<InstanceId, ProcessInstance>,
    stepper: StepEngine,
    events: EventRouter,
    navigator: Navigator,
}

impl ProcessRuntime {
    /// A runtime with the built-in `evalexpr`-backed evaluator.
    pub fn new() -> Self {
        Self::with_evaluator(Arc::new(DefaultEvaluator::new()))
    }

    /// A runtime with a caller-supplied evaluator service.
    pub fn with_evaluator(evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            definitions: DefinitionRegistry::new(),
            evaluator,
            rules: BTreeMap::new(),
            instances: BTreeMap::new(),
            stepper: StepEngine::new(),
            events: EventRouter::new(),
            navigator: Navigator::new(),
        }
    }

    // ── Definitions and services ─────────────────────────────────────

    pub fn register(&mut self, definition: ProcessDefinition) -> EngineResult<ProcessDefinitionId> {
        self.definitions.register(definition)
    }

    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.definitions
    }

    /// Register a decision-table evaluator under the name rule tasks use.
    pub fn register_rule(&mut self, name: impl Into<String>, evaluator: Arc<dyn RuleEvaluator>) {
        self.rules.insert(name.into(), evaluator);
    }

    // ── Instance lifecycle ───────────────────────────────────────────

    /// Create an instance with its root task ready on the start node. The
    /// caller drives execution through [`advance`](Self::advance).
    pub fn start(
        &mut self,
        definition: impl Into<ProcessDefinitionId>,
        data: DataMap,
    ) -> EngineResult<InstanceId> {
        let definition = self.definitions.get(&definition.into())?;
        let instance = ProcessInstance::new(definition, data)?;
        let id = instance.id;
        tracing::info!(instance = %id, definition = %instance.definition().id, "process instance started");
        self.instances.insert(id, instance);
        Ok(id)
    }

    pub fn instance(&self, id: InstanceId) -> EngineResult<&ProcessInstance> {
        self.instances
            .get(&id)
            .ok_or(EngineError::InstanceNotFound(id))
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    // ── Execution ────────────────────────────────────────────────────

    /// Step automatic tasks to a fixed point, or until an instance of
    /// `stop_at` executes. Returns the last executed task.
    pub fn advance(
        &mut self,
        id: InstanceId,
        stop_at: Option<&NodeId>,
    ) -> EngineResult<Option<TaskId>> {
        let ctx = RunContext {
            definitions: &self.definitions,
            evaluator: &self.evaluator,
            rules: &self.rules,
        };
        let instance = self
            .instances
            .get_mut(&id)
            .ok_or(EngineError::InstanceNotFound(id))?;
        self.stepper.advance(instance, &ctx, stop_at)
    }

    /// Re-evaluate waiting tasks (timers included) and promote the
    /// satisfied ones. Timers are polled, not interrupt-driven; call this
    /// from your event loop.
    pub fn refresh_waiting(&mut self, id: InstanceId) -> EngineResult<()> {
        let ctx = RunContext {
            definitions: &self.definitions,
            evaluator: &self.evaluator,
            rules: &self.rules,
        };
        let instance = self
            .instances
            .get_mut(&id)
            .ok_or(EngineError::InstanceNotFound(id))?;
        self.stepper.refresh_waiting(instance, &ctx)
    }

    /// Execute one ready task, merging `data` into it first. The entry
    /// point for completing user tasks.
    pub fn run_task(
        &mut self,
        id: InstanceId,
        task: TaskId,
        data: Option<DataMap>,
    ) -> EngineResult<()> {
        let ctx = RunContext {
            definitions: &self.definitions,
            evaluator: &self.evaluator,
            rules: &self.rules,
        };
        let instance = self
            .instances
            .get_mut(&id)
            .ok_or(EngineError::InstanceNotFound(id))?;
        if let Some(extra) = data {
            let target = instance
                .find_task_mut(task)
                .ok_or(EngineError::TaskNotFound(task))?;
            if target.state != TaskState::Ready {
                return Err(EngineError::TaskNotReady {
                    task,
                    state: target.state,
                });
            }
            target.data.extend(extra);
        }
        self.stepper.run_single(instance, &ctx, task)
    }

    // ── Events ───────────────────────────────────────────────────────

    /// Deliver an event to the instance hierarchy.
    pub fn catch(
        &mut self,
        id: InstanceId,
        event: CaughtEvent,
        correlations: Option<CorrelationSet>,
    ) -> EngineResult<Vec<TaskId>> {
        let ctx = RunContext {
            definitions: &self.definitions,
            evaluator: &self.evaluator,
            rules: &self.rules,
        };
        let instance = self
            .instances
            .get_mut(&id)
            .ok_or(EngineError::InstanceNotFound(id))?;
        self.events
            .catch(instance, &ctx, &event, correlations.as_ref())
    }

    /// Deliver an external message to one instance, validating its
    /// conversation atomically.
    pub fn catch_external_message(
        &mut self,
        id: InstanceId,
        name: &str,
        payload: DataMap,
    ) -> EngineResult<TaskId> {
        let ctx = RunContext {
            definitions: &self.definitions,
            evaluator: &self.evaluator,
            rules: &self.rules,
        };
        let instance = self
            .instances
            .get_mut(&id)
            .ok_or(EngineError::InstanceNotFound(id))?;
        self.events
            .catch_external_message(instance, &ctx, name, payload)
    }

    /// Route an external message to the unique live instance whose
    /// conversation it belongs to.
    pub fn route_external_message(
        &mut self,
        name: &str,
        payload: DataMap,
    ) -> EngineResult<(InstanceId, TaskId)> {
        let ctx = RunContext {
            definitions: &self.definitions,
            evaluator: &self.evaluator,
            rules: &self.rules,
        };
        let matching: Vec<InstanceId> = self
            .instances
            .iter()
            .filter(|(_, instance)| self.events.would_accept(instance, &ctx, name, &payload))
            .map(|(id, _)| *id)
            .collect();

        match matching.as_slice() {
            [] => Err(EngineError::NoMatchingWaiter {
                message: name.to_string(),
            }),
            [id] => {
                let id = *id;
                let task = self.catch_external_message(id, name, payload)?;
                Ok((id, task))
            }
            many => Err(EngineError::AmbiguousMessageTarget {
                message: name.to_string(),
                count: many.len(),
            }),
        }
    }

    // ── Navigation and control ───────────────────────────────────────

    /// Rewind the token to a task instance, discarding downstream state.
    pub fn reset_to(
        &mut self,
        id: InstanceId,
        task: TaskId,
        data: Option<DataMap>,
    ) -> EngineResult<()> {
        let ctx = RunContext {
            definitions: &self.definitions,
            evaluator: &self.evaluator,
            rules: &self.rules,
        };
        let instance = self
            .instances
            .get_mut(&id)
            .ok_or(EngineError::InstanceNotFound(id))?;
        self.navigator.reset_to(instance, &ctx, task, data)
    }

    /// Cancel an instance tree, recursing into owned sub-processes.
    /// Returns every newly-cancelled task.
    pub fn cancel(&mut self, id: InstanceId) -> EngineResult<Vec<TaskId>> {
        let instance = self
            .instances
            .get_mut(&id)
            .ok_or(EngineError::InstanceNotFound(id))?;
        Ok(self.navigator.cancel(instance))
    }

    pub fn is_completed(&self, id: InstanceId) -> EngineResult<bool> {
        Ok(self.instance(id)?.is_completed())
    }

    /// Tasks across the hierarchy, optionally filtered by state.
    pub fn tasks(
        &self,
        id: InstanceId,
        state_filter: Option<TaskState>,
    ) -> EngineResult<Vec<TaskSummary>> {
        Ok(self.instance(id)?.summaries(state_filter))
    }

    /// Ready user tasks, optionally restricted to one lane.
    pub fn ready_user_tasks(
        &self,
        id: InstanceId,
        lane: Option<&str>,
    ) -> EngineResult<Vec<TaskSummary>> {
        let instance = self.instance(id)?;
        Ok(instance
            .summaries(Some(TaskState::Ready))
            .into_iter()
            .filter(|summary| {
                matches!(
                    instance.node_of_task(summary.id).map(|n| &n.kind),
                    Some(NodeKind::Task {
                        kind: TaskKind::User
                    })
                )
            })
            .filter(|summary| lane.is_none() || summary.lane.as_deref() == lane)
            .collect())
    }

    /// The UI breadcrumb/stepper tree, with speculative states.
    pub fn preview(&self, id: InstanceId) -> EngineResult<Vec<PreviewRow>> {
        Ok(self.navigator.preview(self.instance(id)?))
    }

    // ── Persistence ──────────────────────────────────────────────────

    pub fn snapshot(&self, id: InstanceId) -> EngineResult<String> {
        self.instance(id)?.snapshot()
    }

    /// Restore an instance from a snapshot and host it.
    pub fn restore(&mut self, state: &str) -> EngineResult<InstanceId> {
        let instance = ProcessInstance::restore(state, &self.definitions)?;
        let id = instance.id;
        tracing::info!(instance = %id, "process instance restored from snapshot");
        self.instances.insert(id, instance);
        Ok(id)
    }
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}
