//! JEXL expression parser backed by `jexl_eval`.
//!
//! Scopes are rendered to plain JSON and passed as the evaluation context;
//! values are never interpolated into expression text. Results are converted
//! back with [`Value::from_json`].
//!
//! JEXL numbers are `f64`. Integers beyond 2^53 cannot be represented
//! exactly, so they enter the context as decimal strings: lookups keep them
//! intact, comparing them with a number literal is false and arithmetic on
//! them fails.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Value as Json, json};
use wayflow_types::scope::{Scope, Value};

use super::{Evaluable, ExprError, ExprParser};

thread_local! {
    static EVALUATOR: jexl_eval::Evaluator<'static> = build_evaluator();
}

/// JEXL evaluator with standard transforms pre-registered.
fn build_evaluator() -> jexl_eval::Evaluator<'static> {
    jexl_eval::Evaluator::new()
        // String transforms
        .with_transform("lower", |args: &[Json]| {
            let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(s.to_lowercase()))
        })
        .with_transform("upper", |args: &[Json]| {
            let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(s.to_uppercase()))
        })
        .with_transform("trim", |args: &[Json]| {
            let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(s.trim()))
        })
        .with_transform("split", |args: &[Json]| {
            let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
            let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
            let parts: Vec<&str> = s.split(delimiter).collect();
            Ok(json!(parts))
        })
        .with_transform("string", |args: &[Json]| {
            let val = args.first().cloned().unwrap_or(Json::Null);
            Ok(match val {
                Json::String(s) => json!(s),
                Json::Null => json!(""),
                other => json!(other.to_string()),
            })
        })
        // Boolean transforms
        .with_transform("not", |args: &[Json]| {
            let val = args.first().cloned().unwrap_or(Json::Null);
            Ok(json!(!truthy(&val)))
        })
        // String search transforms
        .with_transform("contains", |args: &[Json]| {
            let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
            let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(subject.contains(search)))
        })
        .with_transform("startsWith", |args: &[Json]| {
            let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
            let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(subject.starts_with(prefix)))
        })
        .with_transform("endsWith", |args: &[Json]| {
            let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
            let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(subject.ends_with(suffix)))
        })
        // Length transform (works on strings, arrays, and objects)
        .with_transform("length", |args: &[Json]| {
            let len = match args.first() {
                Some(Json::String(s)) => s.chars().count(),
                Some(Json::Array(a)) => a.len(),
                Some(Json::Object(o)) => o.len(),
                _ => 0,
            };
            Ok(json!(len as f64))
        })
}

/// JavaScript-like truthiness.
fn truthy(value: &Json) -> bool {
    match value {
        Json::Bool(b) => *b,
        Json::Null => false,
        Json::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Json::String(s) => !s.is_empty(),
        Json::Array(_) | Json::Object(_) => true,
    }
}

/// Largest integer magnitude an `f64` holds exactly.
const MAX_EXACT_INTEGER: u64 = 1 << 53;

/// A scope rendered for evaluation.
struct Context {
    json: Json,
    /// Decimal renderings of the integers too large for `f64`.
    exact: HashSet<String>,
}

impl Context {
    /// Render a scope. Numbers become floats so literals compare with them;
    /// integers that would lose precision become strings.
    fn new(scope: &Scope) -> Self {
        let mut exact = HashSet::new();
        let json = widen(scope.to_json(), &mut exact);
        Self { json, exact }
    }

    /// Convert a result back, restoring the integers that were passed as
    /// strings and turning integral floats into integers.
    fn value(&self, result: Json) -> Value {
        Value::from_json(self.narrow(result))
    }

    fn narrow(&self, value: Json) -> Json {
        match value {
            Json::Number(n) => match n.as_f64() {
                Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() <= MAX_EXACT_INTEGER as f64 => {
                    Json::from(f as i64)
                }
                _ => Json::Number(n),
            },
            Json::String(s) if self.exact.contains(&s) => match s.parse::<i64>() {
                Ok(i) => Json::from(i),
                Err(_) => s.parse::<u64>().map_or(Json::String(s), Json::from),
            },
            Json::Array(items) => Json::Array(items.into_iter().map(|v| self.narrow(v)).collect()),
            Json::Object(map) => {
                Json::Object(map.into_iter().map(|(k, v)| (k, self.narrow(v))).collect())
            }
            other => other,
        }
    }
}

fn widen(value: Json, exact: &mut HashSet<String>) -> Json {
    match value {
        Json::Number(n) => {
            let magnitude = n.as_i64().map(i64::unsigned_abs).or_else(|| n.as_u64());
            match magnitude {
                Some(m) if m > MAX_EXACT_INTEGER => {
                    let digits = n.to_string();
                    exact.insert(digits.clone());
                    Json::String(digits)
                }
                _ => n
                    .as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map_or(Json::Null, Json::Number),
            }
        }
        Json::Array(items) => Json::Array(items.into_iter().map(|v| widen(v, exact)).collect()),
        Json::Object(map) => {
            Json::Object(map.into_iter().map(|(k, v)| (k, widen(v, exact))).collect())
        }
        other => other,
    }
}

fn eval_json(expr: &str, context: &Json) -> Result<Json, ExprError> {
    EVALUATOR.with(|evaluator| {
        evaluator
            .eval_in_context(expr, context)
            .map_err(|e| ExprError::Eval {
                expr: expr.to_string(),
                reason: e.to_string(),
            })
    })
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// [`ExprParser`] for JEXL.
///
/// Parsing performs a syntax check by evaluating against an empty context
/// and rejecting only parse failures; lookups of unknown variables are
/// resolved at evaluation time.
#[derive(Debug, Default, Clone)]
pub struct JexlParser;

impl JexlParser {
    pub fn new() -> Self {
        Self
    }
}

impl ExprParser for JexlParser {
    fn parse(&self, expr: &str) -> Result<Arc<dyn Evaluable>, ExprError> {
        let source = expr.trim();
        if source.is_empty() {
            return Err(ExprError::Parse {
                expr: expr.to_string(),
                reason: "empty expression".to_string(),
            });
        }

        let syntax = EVALUATOR.with(|evaluator| {
            match evaluator.eval_in_context(source, json!({})) {
                Err(err @ jexl_eval::error::EvaluationError::ParseError(_)) => Some(err.to_string()),
                _ => None,
            }
        });
        if let Some(reason) = syntax {
            return Err(ExprError::Parse {
                expr: source.to_string(),
                reason,
            });
        }

        Ok(Arc::new(JexlExpression {
            source: source.to_string(),
        }))
    }
}

#[derive(Debug)]
struct JexlExpression {
    source: String,
}

impl Evaluable for JexlExpression {
    fn source(&self) -> &str {
        &self.source
    }

    fn eval(&self, scope: &Scope) -> Result<Value, ExprError> {
        let context = Context::new(scope);
        eval_json(&self.source, &context.json).map(|v| context.value(v))
    }

    fn test(&self, scope: &Scope) -> Result<bool, ExprError> {
        eval_json(&self.source, &Context::new(scope).json).map(|v| truthy(&v))
    }
}
