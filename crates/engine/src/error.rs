//! Error types raised while interpreting a step tree.
//!
//! None of these escape a run: the interpreter converts them into failed step records.

use stepflow_types::ErrorKind;
use thiserror::Error;

/// Failure to evaluate a condition, loop source, or count expression.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    #[error("expression is empty")]
    Empty,
    #[error("variable '{0}' is not defined")]
    MissingVariable(String),
    #[error("cannot apply '{operator}' to {left} and {right}")]
    TypeMismatch {
        operator: &'static str,
        left: String,
        right: String,
    },
    #[error("expected an array from '{expression}' but found {found}")]
    NotAnArray { expression: String, found: String },
    #[error("expected a non-negative integer count from '{expression}' but found {found}")]
    InvalidCount { expression: String, found: String },
    #[error("loop requires '{0}'")]
    MissingExpression(&'static str),
    #[error("invalid expression '{expression}': {reason}")]
    Syntax { expression: String, reason: &'static str },
}

/// Failure of a single step, classified for the execution trace.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("{0}")]
    Action(String),
    #[error(transparent)]
    Evaluation(#[from] EvalError),
    #[error("action timed out after {0} ms")]
    Timeout(u64),
    #[error("{0}")]
    Recursion(String),
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Action(_) => ErrorKind::Action,
            StepError::Evaluation(_) => ErrorKind::Evaluation,
            StepError::Timeout(_) => ErrorKind::Timeout,
            StepError::Recursion(_) => ErrorKind::Recursion,
        }
    }
}
