//! Riverbed execution engine
//!
//! The engine advances live process instances over an immutable
//! [`ProcessDefinition`](process_types::ProcessDefinition) graph: it owns the
//! runtime task tree, steps automatically-runnable tasks to a fixed point,
//! branches and joins at gateways, instantiates nested sub-processes, and
//! delivers correlated events to waiting tasks anywhere in the nesting
//! hierarchy.
//!
//! # Architecture
//!
//! [`ProcessRuntime`] is the caller-facing facade. It composes:
//!
//! - [`DefinitionRegistry`] — stores validated process definitions
//! - [`StepEngine`] — the `advance` / `refresh_waiting` execution loop
//! - [`EventRouter`] — event catching, throwing and message correlation
//! - [`Navigator`] — forward previews, resets and cancellation
//!
//! The engine is single-threaded and cooperative: "parallel" gateway
//! branches are multiple live tasks in one tree, suspension points are
//! exactly the transitions into `WAITING`, and timers are polled through
//! `refresh_waiting` rather than delivered by interrupts. Callers drive the
//! loop from their own timer/network layer.
//!
//! # Example
//!
//! ```rust
//! use process_engine::ProcessRuntime;
//! use process_types::{DataMap, ProcessDefinition, ProcessNode, Transition};
//!
//! let mut def = ProcessDefinition::new("hello", "Hello");
//! def.add_node(ProcessNode::start("start")).unwrap();
//! def.add_node(ProcessNode::task("work", "Work")).unwrap();
//! def.add_node(ProcessNode::end("end")).unwrap();
//! def.add_transition(Transition::new("start", "work")).unwrap();
//! def.add_transition(Transition::new("work", "end")).unwrap();
//!
//! let mut runtime = ProcessRuntime::new();
//! runtime.register(def).unwrap();
//!
//! let id = runtime.start("hello", DataMap::new()).unwrap();
//! runtime.advance(id, None).unwrap();
//! assert!(runtime.is_completed(id).unwrap());
//! ```

#![deny(unsafe_code)]

pub mod events;
pub mod instance;
pub mod navigation;
pub mod registry;
pub mod reset;
pub mod runtime;
pub mod snapshot;
pub mod stepper;
pub mod subprocess;
pub mod task;

pub use events::{CorrelationSet, EventRouter, OutboundMessage};
pub use instance::{ProcessInstance, TaskSummary};
pub use navigation::{Navigator, PreviewRow};
pub use registry::DefinitionRegistry;
pub use runtime::ProcessRuntime;
pub use stepper::{RunContext, StepEngine};
pub use task::TaskInstance;
