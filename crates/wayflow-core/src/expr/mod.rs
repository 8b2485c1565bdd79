//! Expression evaluation seam.
//!
//! The engine never interprets expression text itself. It asks an
//! [`ExprParser`] to turn text into an [`Evaluable`] once, at compile time,
//! and evaluates that against a [`Scope`] at run time. [`jexl::JexlParser`]
//! is the bundled implementation.

pub mod jexl;

use std::fmt;
use std::sync::Arc;

use wayflow_types::scope::{Scope, Value};

/// Errors produced while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("failed to parse expression '{expr}': {reason}")]
    Parse { expr: String, reason: String },

    #[error("failed to evaluate expression '{expr}': {reason}")]
    Eval { expr: String, reason: String },
}

/// A parsed expression, ready to be evaluated any number of times.
pub trait Evaluable: Send + Sync + fmt::Debug {
    /// Original expression text.
    fn source(&self) -> &str;

    /// Evaluate to a value.
    fn eval(&self, scope: &Scope) -> Result<Value, ExprError>;

    /// Evaluate and coerce the result to a boolean.
    fn test(&self, scope: &Scope) -> Result<bool, ExprError>;
}

/// Turns expression text into evaluables.
pub trait ExprParser: Send + Sync {
    fn parse(&self, expr: &str) -> Result<Arc<dyn Evaluable>, ExprError>;
}
