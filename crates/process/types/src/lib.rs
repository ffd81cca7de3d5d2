//! Static process model for the Riverbed runtime
//!
//! A process is a directed graph of typed nodes connected by guarded
//! transitions. This crate defines that graph ([`ProcessDefinition`],
//! [`ProcessNode`], [`Transition`]), the event model used by catching and
//! throwing nodes ([`EventDefinition`], [`CorrelationProperty`]), the runtime
//! task state machine ([`TaskState`]) and the engine error taxonomy
//! ([`EngineError`]).
//!
//! Definitions are immutable once validated. To modify a process, build and
//! register a new version.

#![deny(unsafe_code)]

pub mod definition;
pub mod error;
pub mod event;
pub mod state;

pub use definition::{
    DataBinding, DataMapping, NodeId, NodeKind, ProcessDefinition, ProcessDefinitionId,
    ProcessNode, TaskKind, Transition,
};
pub use error::{EngineError, EngineResult};
pub use event::{CaughtEvent, CorrelationProperty, EventDefinition};
pub use state::{InstanceId, TaskId, TaskState};

pub use process_expr::DataMap;
