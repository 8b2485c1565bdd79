//! Ordered expression sets.
//!
//! Used for expression steps and for function arguments/results. Entries are
//! evaluated left to right; each result is visible to the entries after it.

use std::sync::Arc;

use thiserror::Error;
use wayflow_types::scope::{Scope, ScopeError, Value, ValueType};
use wayflow_types::workflow::ExprDef;

use super::step::StepError;
use crate::expr::{Evaluable, ExprError, ExprParser};

/// Errors raised while compiling an expression set.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprSetError {
    #[error("expression target missing")]
    EmptyTarget,

    #[error("expression for '{0}' is empty")]
    EmptyExpression(String),

    #[error(transparent)]
    Expr(#[from] ExprError),

    #[error(transparent)]
    Type(#[from] ScopeError),
}

#[derive(Debug, Clone)]
enum ExprSource {
    Eval(Arc<dyn Evaluable>),
    /// Copy a (dotted) variable from the scope.
    Copy(String),
    Literal(Value),
}

/// Check evaluated before the entry; a truthy result fails the step.
#[derive(Debug, Clone)]
struct Check {
    eval: Arc<dyn Evaluable>,
    message: String,
}

#[derive(Debug, Clone)]
struct Entry {
    target: String,
    path: Vec<String>,
    source: ExprSource,
    value_type: Option<ValueType>,
    checks: Vec<Check>,
}

/// Compiled, ordered list of `target = expression` assignments.
#[derive(Debug, Clone, Default)]
pub struct ExprSet {
    entries: Vec<Entry>,
}

impl ExprSet {
    pub fn compile(defs: &[ExprDef], parser: &dyn ExprParser) -> Result<Self, ExprSetError> {
        let mut entries = Vec::with_capacity(defs.len());

        for def in defs {
            let target = def.target.trim();
            if target.is_empty() {
                return Err(ExprSetError::EmptyTarget);
            }

            let value_type = def
                .value_type
                .as_deref()
                .map(ValueType::from_name)
                .transpose()?;

            let source = if let Some(path) = def.source.as_deref().filter(|s| !s.is_empty()) {
                ExprSource::Copy(path.to_string())
            } else if let Some(raw) = &def.value {
                let value = Value::from_json(raw.clone());
                match value_type {
                    Some(t) => ExprSource::Literal(value.cast(t).map_err(ScopeError::from)?),
                    None => ExprSource::Literal(value),
                }
            } else if def.expr.trim().is_empty() {
                return Err(ExprSetError::EmptyExpression(target.to_string()));
            } else {
                ExprSource::Eval(parser.parse(&def.expr)?)
            };

            let checks = def
                .tests
                .iter()
                .map(|t| {
                    Ok(Check {
                        eval: parser.parse(&t.expr)?,
                        message: t.error.clone(),
                    })
                })
                .collect::<Result<Vec<_>, ExprError>>()?;

            entries.push(Entry {
                target: target.to_string(),
                path: target.split('.').map(str::to_string).collect(),
                source,
                value_type,
                checks,
            });
        }

        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Targets in evaluation order.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.target.as_str())
    }

    /// Evaluate every entry against `scope` and return only the assigned
    /// variables.
    pub fn eval(&self, scope: &Scope) -> Result<Scope, StepError> {
        let mut running = scope.clone();
        let mut out = Scope::new();

        for entry in &self.entries {
            for check in &entry.checks {
                if check.eval.test(&running)? {
                    return Err(StepError::TestFailed {
                        target: entry.target.clone(),
                        message: if check.message.is_empty() {
                            format!("test failed for '{}'", entry.target)
                        } else {
                            check.message.clone()
                        },
                    });
                }
            }

            let mut value = match &entry.source {
                ExprSource::Eval(eval) => eval.eval(&running)?,
                ExprSource::Copy(path) => running
                    .lookup(path)
                    .ok_or_else(|| StepError::MissingVariable(path.clone()))?,
                ExprSource::Literal(value) => value.clone(),
            };

            if let Some(value_type) = entry.value_type {
                value = value.cast(value_type)?;
            }

            let path: Vec<&str> = entry.path.iter().map(String::as_str).collect();
            running.set(value.clone(), &path)?;
            out.set(value, &path)?;
        }

        Ok(out)
    }
}
