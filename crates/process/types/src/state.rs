//! Runtime identifiers and the task state machine

use serde::{Deserialize, Serialize};

// ── Identifiers ──────────────────────────────────────────────────────

/// Unique identifier for a task instance.
///
/// Task ids are unique across the *entire* nesting hierarchy of a process
/// instance, not just within one instance, so they can be used as keys in
/// the outermost instance's sub-process table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub uuid::Uuid);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a process instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub uuid::Uuid);

impl InstanceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Task State ───────────────────────────────────────────────────────

/// The lifecycle state of a task instance.
///
/// `Future` and `Likely` are speculative states used by navigation
/// previews; a real instance enters the tree as `Ready` or `Waiting`.
/// State changes are monotonic except for explicit reset and cancel
/// operations, which bypass the transition table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TaskState {
    /// Not yet reachable; preview only.
    #[default]
    Future,
    /// Reachable along at least one currently-plausible path; preview only.
    Likely,
    /// Reached, blocked on an external condition (event, timer, nested
    /// instance completion, join arrivals).
    Waiting,
    /// Eligible for immediate execution.
    Ready,
    /// Execution finished normally. Terminal.
    Completed,
    /// Pruned by a gateway-merge loser or an explicit cancel. Terminal.
    Cancelled,
    /// Execution raised an unrecoverable failure. Terminal.
    Error,
}

impl TaskState {
    /// Terminal states never transition again; a loop-back creates a new
    /// sibling instance instead of reviving an old one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error)
    }

    /// A live task still participates in execution or waiting.
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// Speculative states only appear in navigation previews.
    pub fn is_speculative(&self) -> bool {
        matches!(self, Self::Future | Self::Likely)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Future, Likely) => true,
            (Future | Likely, Ready) => true,
            (Ready, Waiting) => true,
            (Waiting, Ready) => true,
            (Ready, Completed) => true,
            (Ready, Error) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = match self {
            Self::Future => "FUTURE",
            Self::Likely => "LIKELY",
            Self::Waiting => "WAITING",
            Self::Ready => "READY",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Error => "ERROR",
        };
        write!(f, "{token}")
    }
}
