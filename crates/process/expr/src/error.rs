//! Error types for the evaluator boundary

/// Failure raised by an [`Evaluator`](crate::Evaluator) or
/// [`RuleEvaluator`](crate::RuleEvaluator) implementation.
///
/// Positional detail is carried when the implementation can derive it;
/// the default `evalexpr` backend cannot, so it reports `None`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpressionError {
    #[error("syntax error: {message}")]
    Syntax {
        message: String,
        line: Option<u32>,
        column: Option<u32>,
    },

    #[error("undefined reference: {name}")]
    UndefinedVariable { name: String },

    #[error("evaluation failed: {message}")]
    Runtime { message: String },
}

impl ExpressionError {
    /// The undefined variable name, if this is an undefined-reference failure.
    ///
    /// The engine uses this to attach a nearest-name suggestion against the
    /// data keys that were in scope.
    pub fn undefined_name(&self) -> Option<&str> {
        match self {
            Self::UndefinedVariable { name } => Some(name),
            _ => None,
        }
    }
}
