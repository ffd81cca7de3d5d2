//! Event definitions and correlation
//!
//! Catching and throwing nodes carry an [`EventDefinition`] describing what
//! they wait for or emit. Messages additionally carry
//! [`CorrelationProperty`] descriptors: expressions evaluated against the
//! message payload whose results route the message to the one conversation
//! it belongs to.

use process_expr::DataMap;
use serde::{Deserialize, Serialize};

// ── Correlation ──────────────────────────────────────────────────────

/// A property extracted from a message payload for conversation routing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationProperty {
    /// Property name, unique within the message definition.
    pub name: String,
    /// Retrieval expression, evaluated against the message payload.
    pub retrieval: String,
    /// The correlation keys this property participates in.
    pub keys: Vec<String>,
}

impl CorrelationProperty {
    pub fn new(
        name: impl Into<String>,
        retrieval: impl Into<String>,
        keys: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            retrieval: retrieval.into(),
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

// ── Event Definition ─────────────────────────────────────────────────

/// What an event node waits for or emits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EventDefinition {
    /// A named message, optionally routed by correlation properties.
    Message {
        name: String,
        properties: Vec<CorrelationProperty>,
    },
    /// A timer; the expression yields seconds, an ISO-8601 duration
    /// (`PT30S`) or an RFC 3339 date-time.
    Timer { expression: String },
    /// A broadcast signal, matched by name.
    Signal { name: String },
    /// A transaction-cancel event.
    Cancel,
    /// An error event; `None` catches any error code.
    Error { code: Option<String> },
    /// An escalation event; `None` catches any escalation code.
    Escalation { code: Option<String> },
    /// Terminates every live task of the enclosing instance.
    Terminate,
    /// Composite: satisfied by any of its members.
    Multiple { events: Vec<EventDefinition> },
    /// Composite: satisfied only once every member has fired.
    ParallelMultiple { events: Vec<EventDefinition> },
}

impl EventDefinition {
    pub fn message(name: impl Into<String>) -> Self {
        Self::Message {
            name: name.into(),
            properties: Vec::new(),
        }
    }

    pub fn message_with(
        name: impl Into<String>,
        properties: impl IntoIterator<Item = CorrelationProperty>,
    ) -> Self {
        Self::Message {
            name: name.into(),
            properties: properties.into_iter().collect(),
        }
    }

    pub fn timer(expression: impl Into<String>) -> Self {
        Self::Timer {
            expression: expression.into(),
        }
    }

    pub fn signal(name: impl Into<String>) -> Self {
        Self::Signal { name: name.into() }
    }

    pub fn error(code: Option<&str>) -> Self {
        Self::Error {
            code: code.map(str::to_string),
        }
    }

    pub fn escalation(code: Option<&str>) -> Self {
        Self::Escalation {
            code: code.map(str::to_string),
        }
    }

    pub fn any_of(events: impl IntoIterator<Item = EventDefinition>) -> Self {
        Self::Multiple {
            events: events.into_iter().collect(),
        }
    }

    pub fn all_of(events: impl IntoIterator<Item = EventDefinition>) -> Self {
        Self::ParallelMultiple {
            events: events.into_iter().collect(),
        }
    }

    /// The message or signal name, if this definition carries one.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Message { name, .. } | Self::Signal { name } => Some(name),
            _ => None,
        }
    }

    /// Correlation properties declared on this definition.
    pub fn correlation_properties(&self) -> &[CorrelationProperty] {
        match self {
            Self::Message { properties, .. } => properties,
            _ => &[],
        }
    }

    /// Whether a catcher with this definition is satisfied by `caught`.
    ///
    /// Messages and signals match by name, errors and escalations by code
    /// (a catcher without a code catches any), cancel and terminate by
    /// kind. Composite catchers delegate to their members; accumulation
    /// for `ParallelMultiple` is the engine's concern, matching here only
    /// answers "is this occurrence relevant".
    pub fn matches(&self, caught: &EventDefinition) -> bool {
        match (self, caught) {
            (Self::Multiple { events } | Self::ParallelMultiple { events }, _) => {
                events.iter().any(|e| e.matches(caught))
            }
            (_, Self::Multiple { events } | Self::ParallelMultiple { events }) => {
                events.iter().any(|e| self.matches(e))
            }
            (Self::Message { name: a, .. }, Self::Message { name: b, .. }) => a == b,
            (Self::Signal { name: a }, Self::Signal { name: b }) => a == b,
            (Self::Timer { expression: a }, Self::Timer { expression: b }) => a == b,
            (Self::Cancel, Self::Cancel) => true,
            (Self::Terminate, Self::Terminate) => true,
            (Self::Error { code: catcher }, Self::Error { code: thrown }) => {
                catcher.is_none() || catcher == thrown
            }
            (Self::Escalation { code: catcher }, Self::Escalation { code: thrown }) => {
                catcher.is_none() || catcher == thrown
            }
            _ => false,
        }
    }

    /// Index of the first member matched by `caught`, for composite
    /// accumulation bookkeeping.
    pub fn matching_member(&self, caught: &EventDefinition) -> Option<usize> {
        match self {
            Self::Multiple { events } | Self::ParallelMultiple { events } => {
                events.iter().position(|e| e.matches(caught))
            }
            _ => None,
        }
    }
}

// ── Caught Event ─────────────────────────────────────────────────────

/// One occurrence of an event travelling through the engine.
///
/// The payload is always a snapshot taken when the event was thrown; it is
/// never an alias of live instance data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaughtEvent {
    pub definition: EventDefinition,
    pub payload: Option<DataMap>,
}

impl CaughtEvent {
    pub fn new(definition: EventDefinition) -> Self {
        Self {
            definition,
            payload: None,
        }
    }

    pub fn with_payload(definition: EventDefinition, payload: DataMap) -> Self {
        Self {
            definition,
            payload: Some(payload),
        }
    }
}
