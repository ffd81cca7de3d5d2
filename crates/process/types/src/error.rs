//! Error taxonomy for the process engine

use process_expr::ExpressionError;
use serde_json::Value;

use crate::definition::{NodeId, ProcessDefinitionId};
use crate::state::{InstanceId, TaskId, TaskState};

/// Errors raised by the engine and its subsystems.
///
/// Failures during automatic execution are wrapped in [`TaskFailed`]
/// carrying the task trace (innermost enclosing instance first) so callers
/// always learn which task, in which process context, went wrong.
///
/// [`TaskFailed`]: EngineError::TaskFailed
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no outgoing transition matched at gateway '{node}' and no default flow is declared")]
    Guarding { node: NodeId },

    #[error("sub-process '{node}' is missing declared data input '{variable}'")]
    MissingDataInput { node: NodeId, variable: String },

    #[error("sub-process '{node}' is missing declared data output '{variable}'")]
    MissingDataOutput { node: NodeId, variable: String },

    #[error(
        "expression '{expression}' failed at node '{node}': {source}{}",
        .suggestion.as_deref().map(|s| format!(" (did you mean '{s}'?)")).unwrap_or_default()
    )]
    Expression {
        node: NodeId,
        expression: String,
        #[source]
        source: ExpressionError,
        suggestion: Option<String>,
    },

    #[error("no rule evaluator registered under '{name}'")]
    RuleNotFound { name: String },

    #[error(
        "payload does not match expected correlation: key '{key}' property '{property}' is bound to {expected}, payload implies {actual}"
    )]
    CorrelationMismatch {
        key: String,
        property: String,
        expected: Value,
        actual: Value,
    },

    #[error("message '{message}' cannot be resolved to a conversation: no correlation keys declared")]
    UnresolvedConversation { message: String },

    #[error("unhandled error event{}", .code.as_deref().map(|c| format!(" '{c}'")).unwrap_or_default())]
    UnhandledError { code: Option<String> },

    #[error("not waiting on message '{message}'")]
    NoMatchingWaiter { message: String },

    #[error("message '{message}' matches {count} waiting tasks; messages are one-to-one")]
    AmbiguousMessageTarget { message: String, count: usize },

    #[error("task failed: {}", .trace.join(" <- "))]
    TaskFailed {
        /// "task (process)" entries, innermost first.
        trace: Vec<String>,
        #[source]
        source: Box<EngineError>,
    },

    #[error("process definition not found: {0}")]
    DefinitionNotFound(ProcessDefinitionId),

    #[error("process definition already registered: {0}")]
    DuplicateDefinition(ProcessDefinitionId),

    #[error("process instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("task instance not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task {task} is {state}, not READY")]
    TaskNotReady { task: TaskId, state: TaskState },

    #[error("process instance already finished")]
    AlreadyFinished,

    #[error("no start node defined")]
    NoStartNode,

    #[error("duplicate node id: {0}")]
    DuplicateNodeId(NodeId),

    #[error("duplicate transition: {from} -> {to}")]
    DuplicateTransition { from: NodeId, to: NodeId },

    #[error("definition validation failed: {0}")]
    Validation(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Wrap a failure with the task trace of the failing instance.
    pub fn in_trace(self, trace: Vec<String>) -> Self {
        match self {
            // Already wrapped further in; keep the innermost trace.
            Self::TaskFailed { .. } => self,
            other => Self::TaskFailed {
                trace,
                source: Box::new(other),
            },
        }
    }
}
