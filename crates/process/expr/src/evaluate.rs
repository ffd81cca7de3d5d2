//! Expression and script evaluation
//!
//! The [`Evaluator`] trait is the contract the engine programs against.
//! [`DefaultEvaluator`] implements it with the `evalexpr` crate: data
//! context values are copied into an evalexpr context, the expression is
//! compiled and evaluated, and results are copied back out as JSON values.

use std::collections::BTreeMap;

use evalexpr::{
    build_operator_tree, ContextWithMutableVariables, DefaultNumericTypes, EvalexprError,
    HashMapContext, IterateVariablesContext, Node as EvalNode,
};
use serde_json::Value;

use crate::error::ExpressionError;

/// Variable bindings passed across the evaluator boundary.
///
/// A `BTreeMap` keeps iteration and serialization order stable, which the
/// engine relies on for reproducible snapshots.
pub type DataMap = BTreeMap<String, Value>;

/// An expression/script evaluation service.
///
/// Implementations must be total for any string they accept: a failure is
/// reported as an [`ExpressionError`], never a panic. The context is copied
/// in and out around each call; implementations never alias caller data.
pub trait Evaluator: Send + Sync {
    /// Evaluate a single expression against the context and return its value.
    fn evaluate(&self, expression: &str, context: &DataMap) -> Result<Value, ExpressionError>;

    /// Run a script for its side effects.
    ///
    /// Variables assigned by the script are merged back into `context` only
    /// when the whole script succeeds; a failing script leaves the context
    /// untouched.
    fn execute(&self, script: &str, context: &mut DataMap) -> Result<(), ExpressionError>;
}

/// The built-in evaluator, backed by `evalexpr`.
///
/// Scalar context values (strings, integers, floats, booleans) are visible
/// to expressions; arrays and objects are not mapped into the expression
/// scope. Scripts use evalexpr's `;`-chained statement form with in-context
/// assignment (`a = b + 1; done = true`).
#[derive(Debug, Default, Clone)]
pub struct DefaultEvaluator;

impl DefaultEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn compile(expression: &str) -> Result<EvalNode, ExpressionError> {
        build_operator_tree(expression).map_err(|e| ExpressionError::Syntax {
            message: e.to_string(),
            line: None,
            column: None,
        })
    }
}

impl Evaluator for DefaultEvaluator {
    fn evaluate(&self, expression: &str, context: &DataMap) -> Result<Value, ExpressionError> {
        let tree = Self::compile(expression)?;
        let eval_ctx = build_eval_context(context);
        let value = tree
            .eval_with_context(&eval_ctx)
            .map_err(map_eval_error)?;
        Ok(from_eval_value(value))
    }

    fn execute(&self, script: &str, context: &mut DataMap) -> Result<(), ExpressionError> {
        let tree = Self::compile(script)?;
        let mut eval_ctx = build_eval_context(context);
        tree.eval_with_context_mut(&mut eval_ctx)
            .map_err(map_eval_error)?;

        // Merge back only after the whole script succeeded.
        for (name, value) in eval_ctx.iter_variables() {
            context.insert(name, from_eval_value(value));
        }
        Ok(())
    }
}

fn build_eval_context(context: &DataMap) -> HashMapContext<DefaultNumericTypes> {
    let mut eval_ctx = HashMapContext::<DefaultNumericTypes>::new();
    for (key, value) in context {
        let eval_val = match value {
            Value::String(s) => Some(evalexpr::Value::String(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(evalexpr::Value::Int(i))
                } else {
                    n.as_f64().map(evalexpr::Value::Float)
                }
            }
            Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
            _ => None,
        };
        if let Some(ev) = eval_val {
            let _ = eval_ctx.set_value(key.clone(), ev);
        }
    }
    eval_ctx
}

fn from_eval_value(value: evalexpr::Value<DefaultNumericTypes>) -> Value {
    match value {
        evalexpr::Value::String(s) => Value::String(s),
        evalexpr::Value::Int(i) => serde_json::json!(i),
        evalexpr::Value::Float(f) => serde_json::json!(f),
        evalexpr::Value::Boolean(b) => Value::Bool(b),
        evalexpr::Value::Tuple(items) => {
            Value::Array(items.into_iter().map(from_eval_value).collect())
        }
        evalexpr::Value::Empty => Value::Null,
    }
}

fn map_eval_error(err: EvalexprError<DefaultNumericTypes>) -> ExpressionError {
    match err {
        EvalexprError::VariableIdentifierNotFound(name) => {
            ExpressionError::UndefinedVariable { name }
        }
        other => ExpressionError::Runtime {
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(pairs: &[(&str, Value)]) -> DataMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_evaluate_arithmetic() {
        let ctx = context(&[("amount", json!(40)), ("fee", json!(2))]);
        let value = DefaultEvaluator::new().evaluate("amount + fee", &ctx).unwrap();
        assert_eq!(value, json!(42));
    }

    #[test]
    fn test_evaluate_guard_expression() {
        let ctx = context(&[("approved", json!(true)), ("score", json!(81))]);
        let eval = DefaultEvaluator::new();

        assert_eq!(eval.evaluate("approved && score > 80", &ctx).unwrap(), json!(true));
        assert_eq!(eval.evaluate("score < 50", &ctx).unwrap(), json!(false));
    }

    #[test]
    fn test_evaluate_string_comparison() {
        let ctx = context(&[("status", json!("open"))]);
        let value = DefaultEvaluator::new()
            .evaluate("status == \"open\"", &ctx)
            .unwrap();
        assert_eq!(value, json!(true));
    }

    #[test]
    fn test_undefined_variable() {
        let ctx = context(&[("amount", json!(1))]);
        let err = DefaultEvaluator::new()
            .evaluate("amonut > 0", &ctx)
            .unwrap_err();
        assert_eq!(err.undefined_name(), Some("amonut"));
    }

    #[test]
    fn test_syntax_error() {
        let err = DefaultEvaluator::new()
            .evaluate("1 +", &DataMap::new())
            .unwrap_err();
        assert!(matches!(err, ExpressionError::Syntax { .. }));
    }

    #[test]
    fn test_execute_merges_assignments() {
        let mut ctx = context(&[("total", json!(10))]);
        DefaultEvaluator::new()
            .execute("total = total + 5; done = true", &mut ctx)
            .unwrap();
        assert_eq!(ctx.get("total"), Some(&json!(15)));
        assert_eq!(ctx.get("done"), Some(&json!(true)));
    }

    #[test]
    fn test_execute_failure_leaves_context_untouched() {
        let mut ctx = context(&[("total", json!(10))]);
        let before = ctx.clone();
        let err = DefaultEvaluator::new()
            .execute("total = total + missing", &mut ctx)
            .unwrap_err();
        assert_eq!(err.undefined_name(), Some("missing"));
        assert_eq!(ctx, before);
    }

    #[test]
    fn test_non_scalar_values_not_in_scope() {
        let ctx = context(&[("items", json!([1, 2, 3])), ("count", json!(3))]);
        let eval = DefaultEvaluator::new();

        assert_eq!(eval.evaluate("count == 3", &ctx).unwrap(), json!(true));
        let err = eval.evaluate("items", &ctx).unwrap_err();
        assert_eq!(err.undefined_name(), Some("items"));
    }
}
