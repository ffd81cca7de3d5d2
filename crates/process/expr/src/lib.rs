//! Evaluator boundary for the Riverbed process runtime
//!
//! The engine treats expression evaluation as an external service: guards,
//! data retrieval expressions, timer expressions and script tasks all go
//! through the [`Evaluator`] trait, and decision tables through
//! [`RuleEvaluator`]. This crate defines those boundaries plus a default
//! implementation backed by the `evalexpr` crate so the runtime is usable
//! out of the box.
//!
//! Values cross the boundary as copies: an evaluator never holds references
//! into live instance data, and script side effects are merged back only
//! when execution succeeds.

#![deny(unsafe_code)]

pub mod error;
pub mod evaluate;
pub mod rules;
pub mod suggest;

pub use error::ExpressionError;
pub use evaluate::{DataMap, DefaultEvaluator, Evaluator};
pub use rules::{RuleEvaluator, RuleOutcome};
pub use suggest::closest_match;
