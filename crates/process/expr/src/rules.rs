//! Decision-table boundary
//!
//! Business-rule tasks delegate to an external decision-table engine. The
//! runtime only needs the outcome of a decision: a single matched rule, or
//! every matched rule when the table runs under a "collect" hit policy.

use crate::error::ExpressionError;
use crate::evaluate::DataMap;

/// The result of evaluating a decision table against a data context.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    /// Exactly one rule matched (unique hit policy).
    Single(DataMap),
    /// All matching rules, in table order (collect hit policy).
    Collect(Vec<DataMap>),
}

/// An opaque decision-table evaluation service.
pub trait RuleEvaluator: Send + Sync {
    /// Evaluate the table against `context` and return the matched output(s).
    fn decide(&self, context: &DataMap) -> Result<RuleOutcome, ExpressionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct DiscountTable;

    impl RuleEvaluator for DiscountTable {
        fn decide(&self, context: &DataMap) -> Result<RuleOutcome, ExpressionError> {
            let total = context
                .get("total")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| ExpressionError::UndefinedVariable {
                    name: "total".into(),
                })?;
            let mut out = DataMap::new();
            out.insert(
                "discount".into(),
                json!(if total >= 100 { 10 } else { 0 }),
            );
            Ok(RuleOutcome::Single(out))
        }
    }

    #[test]
    fn test_single_outcome() {
        let mut ctx = DataMap::new();
        ctx.insert("total".into(), json!(120));

        let outcome = DiscountTable.decide(&ctx).unwrap();
        match outcome {
            RuleOutcome::Single(out) => assert_eq!(out.get("discount"), Some(&json!(10))),
            other => panic!("expected single outcome, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_input_is_reported() {
        let err = DiscountTable.decide(&DataMap::new()).unwrap_err();
        assert_eq!(err.undefined_name(), Some("total"));
    }
}
