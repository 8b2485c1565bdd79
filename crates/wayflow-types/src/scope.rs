//! Variable scope: the typed name -> value mapping passed between steps.
//!
//! A [`Scope`] is an ordered (by key) map of [`Value`]s. Scopes are the only
//! data-passing medium in the engine: session input, step arguments, step
//! results and the accumulated session state are all scopes.
//!
//! Reads go through explicit casts ([`Value::cast`], `as_*` accessors) that
//! fail loudly when a value cannot be represented as the requested type.
//! The `*_or` getters on [`Scope`] are the only place a default is substituted,
//! and only because the caller supplied it.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A value could not be represented as the requested type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("cannot cast {from} to {to}: {reason}")]
pub struct CastError {
    pub from: ValueType,
    pub to: ValueType,
    pub reason: String,
}

impl CastError {
    fn new(from: ValueType, to: ValueType, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
        }
    }
}

/// Errors raised by structural scope operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScopeError {
    #[error("type mismatch at '{path}': expected {expected}, got {actual}")]
    TypeMismatch {
        path: String,
        expected: ValueType,
        actual: ValueType,
    },

    #[error(transparent)]
    Cast(#[from] CastError),

    #[error("unknown value type '{0}'")]
    UnknownType(String),
}

// ---------------------------------------------------------------------------
// ValueType
// ---------------------------------------------------------------------------

/// Closed set of value types a scope can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Any,
    Boolean,
    #[serde(rename = "ID")]
    Id,
    Integer,
    Integer64,
    #[serde(rename = "UnsignedInteger")]
    Unsigned,
    Float,
    String,
    DateTime,
    Duration,
    #[serde(rename = "KV")]
    Kv,
    #[serde(rename = "KVV")]
    Kvv,
    #[serde(rename = "Reader")]
    Bytes,
    #[serde(rename = "Vars")]
    Scope,
}

impl ValueType {
    const ALL: [ValueType; 14] = [
        ValueType::Any,
        ValueType::Boolean,
        ValueType::Id,
        ValueType::Integer,
        ValueType::Integer64,
        ValueType::Unsigned,
        ValueType::Float,
        ValueType::String,
        ValueType::DateTime,
        ValueType::Duration,
        ValueType::Kv,
        ValueType::Kvv,
        ValueType::Bytes,
        ValueType::Scope,
    ];

    /// Canonical type name as used in workflow definitions.
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Any => "Any",
            ValueType::Boolean => "Boolean",
            ValueType::Id => "ID",
            ValueType::Integer => "Integer",
            ValueType::Integer64 => "Integer64",
            ValueType::Unsigned => "UnsignedInteger",
            ValueType::Float => "Float",
            ValueType::String => "String",
            ValueType::DateTime => "DateTime",
            ValueType::Duration => "Duration",
            ValueType::Kv => "KV",
            ValueType::Kvv => "KVV",
            ValueType::Bytes => "Reader",
            ValueType::Scope => "Vars",
        }
    }

    /// Resolve a type by name (case-insensitive).
    pub fn from_name(name: &str) -> Result<Self, ScopeError> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| ScopeError::UnknownType(name.to_string()))
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A single typed value stored in a [`Scope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@type", content = "@value")]
pub enum Value {
    Any(serde_json::Value),
    Boolean(bool),
    Integer(i32),
    Integer64(i64),
    Unsigned(u64),
    Float(f64),
    String(String),
    Datetime(DateTime<Utc>),
    Duration(Duration),
    Kv(BTreeMap<String, String>),
    Kvv(BTreeMap<String, Vec<String>>),
    Bytes(Vec<u8>),
    Scope(Scope),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Any(_) => ValueType::Any,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Integer(_) => ValueType::Integer,
            Value::Integer64(_) => ValueType::Integer64,
            Value::Unsigned(_) => ValueType::Unsigned,
            Value::Float(_) => ValueType::Float,
            Value::String(_) => ValueType::String,
            Value::Datetime(_) => ValueType::DateTime,
            Value::Duration(_) => ValueType::Duration,
            Value::Kv(_) => ValueType::Kv,
            Value::Kvv(_) => ValueType::Kvv,
            Value::Bytes(_) => ValueType::Bytes,
            Value::Scope(_) => ValueType::Scope,
        }
    }

    /// Convert into the requested type, failing when the value cannot be
    /// represented.
    pub fn cast(&self, to: ValueType) -> Result<Value, CastError> {
        if self.value_type() == to {
            return Ok(self.clone());
        }

        Ok(match to {
            ValueType::Any => Value::Any(self.to_json()),
            ValueType::Boolean => Value::Boolean(self.as_bool()?),
            ValueType::Id | ValueType::Unsigned => Value::Unsigned(self.as_u64()?),
            ValueType::Integer => {
                let n = self.as_i64()?;
                let n = i32::try_from(n).map_err(|_| {
                    CastError::new(self.value_type(), to, format!("{n} out of range"))
                })?;
                Value::Integer(n)
            }
            ValueType::Integer64 => Value::Integer64(self.as_i64()?),
            ValueType::Float => Value::Float(self.as_f64()?),
            ValueType::String => Value::String(self.as_string()?),
            ValueType::DateTime => Value::Datetime(self.as_datetime()?),
            ValueType::Duration => Value::Duration(self.as_duration()?),
            ValueType::Kv => Value::Kv(self.as_kv()?),
            ValueType::Kvv => Value::Kvv(self.as_kvv()?),
            ValueType::Bytes => Value::Bytes(self.as_bytes()?),
            ValueType::Scope => Value::Scope(self.as_scope()?),
        })
    }

    pub fn as_bool(&self) -> Result<bool, CastError> {
        let fail = |reason: String| CastError::new(self.value_type(), ValueType::Boolean, reason);
        match self {
            Value::Boolean(b) => Ok(*b),
            Value::Integer(n) => Ok(*n != 0),
            Value::Integer64(n) => Ok(*n != 0),
            Value::Unsigned(n) => Ok(*n != 0),
            Value::Float(f) => Ok(*f != 0.0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" | "" => Ok(false),
                other => Err(fail(format!("'{other}' is not a boolean"))),
            },
            Value::Any(serde_json::Value::Null) => Ok(false),
            Value::Any(v) => json_scalar(v)
                .ok_or_else(|| fail("structured value".to_string()))?
                .as_bool(),
            _ => Err(fail("unsupported conversion".to_string())),
        }
    }

    pub fn as_i64(&self) -> Result<i64, CastError> {
        let fail = |reason: String| CastError::new(self.value_type(), ValueType::Integer64, reason);
        match self {
            Value::Integer(n) => Ok(i64::from(*n)),
            Value::Integer64(n) => Ok(*n),
            Value::Unsigned(n) => i64::try_from(*n).map_err(|_| fail(format!("{n} out of range"))),
            Value::Float(f) => float_to_i64(*f).ok_or_else(|| fail(format!("{f} is not integral"))),
            Value::Boolean(b) => Ok(i64::from(*b)),
            Value::String(s) => {
                let s = s.trim();
                if let Ok(n) = s.parse::<i64>() {
                    return Ok(n);
                }
                s.parse::<f64>()
                    .ok()
                    .and_then(float_to_i64)
                    .ok_or_else(|| fail(format!("'{s}' is not an integer")))
            }
            Value::Any(v) => json_scalar(v)
                .ok_or_else(|| fail("not a scalar".to_string()))?
                .as_i64(),
            _ => Err(fail("unsupported conversion".to_string())),
        }
    }

    pub fn as_u64(&self) -> Result<u64, CastError> {
        let n = match self {
            Value::Unsigned(n) => return Ok(*n),
            other => other.as_i64().map_err(|e| CastError {
                to: ValueType::Unsigned,
                ..e
            })?,
        };
        u64::try_from(n).map_err(|_| {
            CastError::new(self.value_type(), ValueType::Unsigned, format!("{n} is negative"))
        })
    }

    pub fn as_f64(&self) -> Result<f64, CastError> {
        let fail = |reason: String| CastError::new(self.value_type(), ValueType::Float, reason);
        match self {
            Value::Float(f) => Ok(*f),
            Value::Integer(n) => Ok(f64::from(*n)),
            Value::Integer64(n) => Ok(*n as f64),
            Value::Unsigned(n) => Ok(*n as f64),
            Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| fail(format!("'{s}' is not a number"))),
            Value::Any(v) => json_scalar(v)
                .ok_or_else(|| fail("not a scalar".to_string()))?
                .as_f64(),
            _ => Err(fail("unsupported conversion".to_string())),
        }
    }

    pub fn as_string(&self) -> Result<String, CastError> {
        let fail = |reason: &str| CastError::new(self.value_type(), ValueType::String, reason);
        match self {
            Value::String(s) => Ok(s.clone()),
            Value::Boolean(b) => Ok(b.to_string()),
            Value::Integer(n) => Ok(n.to_string()),
            Value::Integer64(n) => Ok(n.to_string()),
            Value::Unsigned(n) => Ok(n.to_string()),
            Value::Float(f) => Ok(f.to_string()),
            Value::Datetime(dt) => Ok(dt.to_rfc3339()),
            Value::Duration(d) => Ok(format_duration(*d)),
            Value::Bytes(b) => String::from_utf8(b.clone()).map_err(|_| fail("invalid UTF-8")),
            Value::Any(serde_json::Value::String(s)) => Ok(s.clone()),
            Value::Any(serde_json::Value::Null) => Err(fail("null value")),
            Value::Any(v) => Ok(v.to_string()),
            Value::Kv(_) | Value::Kvv(_) | Value::Scope(_) => Err(fail("structured value")),
        }
    }

    pub fn as_datetime(&self) -> Result<DateTime<Utc>, CastError> {
        let fail = |reason: String| CastError::new(self.value_type(), ValueType::DateTime, reason);
        match self {
            Value::Datetime(dt) => Ok(*dt),
            Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| fail(format!("'{s}': {e}"))),
            Value::Integer(_) | Value::Integer64(_) | Value::Unsigned(_) => {
                let secs = self.as_i64()?;
                DateTime::from_timestamp(secs, 0)
                    .ok_or_else(|| fail(format!("timestamp {secs} out of range")))
            }
            Value::Any(v) => json_scalar(v)
                .ok_or_else(|| fail("not a scalar".to_string()))?
                .as_datetime(),
            _ => Err(fail("unsupported conversion".to_string())),
        }
    }

    pub fn as_duration(&self) -> Result<Duration, CastError> {
        let fail = |reason: String| CastError::new(self.value_type(), ValueType::Duration, reason);
        match self {
            Value::Duration(d) => Ok(*d),
            Value::String(s) => parse_duration(s).map_err(fail),
            Value::Integer(_) | Value::Integer64(_) | Value::Unsigned(_) => {
                let secs = self.as_u64()?;
                Ok(Duration::from_secs(secs))
            }
            Value::Float(f) => Duration::try_from_secs_f64(*f).map_err(|e| fail(e.to_string())),
            Value::Any(v) => json_scalar(v)
                .ok_or_else(|| fail("not a scalar".to_string()))?
                .as_duration(),
            _ => Err(fail("unsupported conversion".to_string())),
        }
    }

    pub fn as_kv(&self) -> Result<BTreeMap<String, String>, CastError> {
        let fail = |reason: &str| CastError::new(self.value_type(), ValueType::Kv, reason);
        match self {
            Value::Kv(kv) => Ok(kv.clone()),
            Value::Kvv(kvv) => Ok(kvv
                .iter()
                .filter_map(|(k, vv)| vv.first().map(|v| (k.clone(), v.clone())))
                .collect()),
            Value::Scope(scope) => scope
                .iter()
                .map(|(k, v)| Ok((k.clone(), v.as_string()?)))
                .collect(),
            Value::Any(serde_json::Value::Object(_)) => Value::Scope(self.as_scope()?).as_kv(),
            _ => Err(fail("not a map")),
        }
    }

    pub fn as_kvv(&self) -> Result<BTreeMap<String, Vec<String>>, CastError> {
        let fail = |reason: &str| CastError::new(self.value_type(), ValueType::Kvv, reason);
        match self {
            Value::Kvv(kvv) => Ok(kvv.clone()),
            Value::Kv(kv) => Ok(kv
                .iter()
                .map(|(k, v)| (k.clone(), vec![v.clone()]))
                .collect()),
            Value::Scope(scope) => scope
                .iter()
                .map(|(k, v)| Ok((k.clone(), v.as_string_list()?)))
                .collect(),
            Value::Any(serde_json::Value::Object(_)) => Value::Scope(self.as_scope()?).as_kvv(),
            _ => Err(fail("not a map")),
        }
    }

    pub fn as_string_list(&self) -> Result<Vec<String>, CastError> {
        match self {
            Value::Any(serde_json::Value::Array(items)) => items
                .iter()
                .map(|item| Value::from_json(item.clone()).as_string())
                .collect(),
            other => Ok(vec![other.as_string()?]),
        }
    }

    pub fn as_bytes(&self) -> Result<Vec<u8>, CastError> {
        match self {
            Value::Bytes(b) => Ok(b.clone()),
            other => other
                .as_string()
                .map(String::into_bytes)
                .map_err(|e| CastError {
                    to: ValueType::Bytes,
                    ..e
                }),
        }
    }

    pub fn as_scope(&self) -> Result<Scope, CastError> {
        let fail = |reason: &str| CastError::new(self.value_type(), ValueType::Scope, reason);
        match self {
            Value::Scope(scope) => Ok(scope.clone()),
            Value::Kv(kv) => Ok(kv
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect()),
            Value::Any(v @ serde_json::Value::Object(_)) => {
                Scope::from_json(v).map_err(|_| fail("invalid object"))
            }
            Value::Any(serde_json::Value::Null) => Ok(Scope::new()),
            _ => Err(fail("not a map")),
        }
    }

    /// Plain JSON rendering used for expression contexts and display.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Any(v) => v.clone(),
            Value::Boolean(b) => J::Bool(*b),
            Value::Integer(n) => J::from(*n),
            Value::Integer64(n) => J::from(*n),
            Value::Unsigned(n) => J::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f).map_or(J::Null, J::Number),
            Value::String(s) => J::String(s.clone()),
            Value::Datetime(dt) => J::String(dt.to_rfc3339()),
            Value::Duration(d) => J::String(format_duration(*d)),
            Value::Kv(kv) => J::Object(
                kv.iter()
                    .map(|(k, v)| (k.clone(), J::String(v.clone())))
                    .collect(),
            ),
            Value::Kvv(kvv) => J::Object(
                kvv.iter()
                    .map(|(k, vv)| {
                        (
                            k.clone(),
                            J::Array(vv.iter().cloned().map(J::String).collect()),
                        )
                    })
                    .collect(),
            ),
            Value::Bytes(b) => J::String(String::from_utf8_lossy(b).into_owned()),
            Value::Scope(scope) => scope.to_json(),
        }
    }

    /// Infer a typed value from plain JSON.
    ///
    /// Objects become nested scopes; arrays and nulls stay untyped.
    pub fn from_json(value: serde_json::Value) -> Value {
        match value {
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer64(i)
                } else if let Some(u) = n.as_u64() {
                    Value::Unsigned(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Object(map) => Value::Scope(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
            other => Value::Any(other),
        }
    }
}

fn json_scalar(v: &serde_json::Value) -> Option<Value> {
    match v {
        serde_json::Value::Bool(_) | serde_json::Value::Number(_) | serde_json::Value::String(_) => {
            Some(Value::from_json(v.clone()))
        }
        _ => None,
    }
}

fn float_to_i64(f: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, which is out of range.
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    if f.is_finite() && f.fract() == 0.0 && f >= -TWO_POW_63 && f < TWO_POW_63 {
        Some(f as i64)
    } else {
        None
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v.into())
            }
        })*
    };
}

value_from! {
    bool => Boolean,
    i32 => Integer,
    i64 => Integer64,
    u64 => Unsigned,
    f64 => Float,
    String => String,
    &str => String,
    DateTime<Utc> => Datetime,
    Duration => Duration,
    Scope => Scope,
    Vec<u8> => Bytes,
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::from_json(v)
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Ordered mapping of variable names to typed values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope {
    vars: BTreeMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Insert or replace a top-level variable without casting.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.vars.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.vars.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.vars.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Combine this scope with the given overlays into a new scope.
    ///
    /// Later overlays win on key conflicts. Neither `self` nor any overlay
    /// is modified.
    pub fn merge<'a>(&self, overlays: impl IntoIterator<Item = &'a Scope>) -> Scope {
        let mut out = self.clone();
        for overlay in overlays {
            for (k, v) in &overlay.vars {
                out.vars.insert(k.clone(), v.clone());
            }
        }
        out
    }

    /// True when every key is present.
    ///
    /// Keys may be dot-separated paths (`user.address.city`); every
    /// intermediate container along the path must exist as well.
    pub fn has(&self, keys: &[&str]) -> bool {
        keys.iter().all(|key| {
            let segments: Vec<&str> = key.split('.').collect();
            match segments.split_first() {
                Some((head, rest)) => self
                    .vars
                    .get(*head)
                    .is_some_and(|v| value_has_path(v, rest)),
                None => false,
            }
        })
    }

    /// Value at a dot-separated path, if present.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let mut current = self.vars.get(segments.next()?)?.clone();
        for segment in segments {
            current = match current {
                Value::Scope(scope) => scope.vars.get(segment)?.clone(),
                Value::Kv(kv) => Value::String(kv.get(segment)?.clone()),
                Value::Kvv(mut kvv) => Value::Any(serde_json::Value::Array(
                    kvv.remove(segment)?
                        .into_iter()
                        .map(serde_json::Value::String)
                        .collect(),
                )),
                Value::Any(serde_json::Value::Object(mut obj)) => Value::from_json(obj.remove(segment)?),
                _ => return None,
            };
        }
        Some(current)
    }

    /// Deep set.
    ///
    /// - Empty `path` replaces the whole scope; `value` must be a scope.
    /// - Otherwise descends through nested scopes (creating missing nested
    ///   scopes), KV maps and JSON objects. Descending into any other value
    ///   type is a type mismatch.
    /// - When the final key already holds a typed value, the new value is
    ///   cast to that type.
    pub fn set(&mut self, value: Value, path: &[&str]) -> Result<(), ScopeError> {
        match path.split_first() {
            None => match value {
                Value::Scope(scope) => {
                    *self = scope;
                    Ok(())
                }
                other => Err(ScopeError::TypeMismatch {
                    path: String::new(),
                    expected: ValueType::Scope,
                    actual: other.value_type(),
                }),
            },
            Some((key, rest)) => assign(self, key, rest, value, &path.join(".")),
        }
    }

    // -- best-effort typed reads --

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>, CastError> {
        self.vars.get(key).map(Value::as_i64).transpose()
    }

    pub fn get_f64(&self, key: &str) -> Result<Option<f64>, CastError> {
        self.vars.get(key).map(Value::as_f64).transpose()
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, CastError> {
        self.vars.get(key).map(Value::as_bool).transpose()
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>, CastError> {
        self.vars.get(key).map(Value::as_string).transpose()
    }

    pub fn get_datetime(&self, key: &str) -> Result<Option<DateTime<Utc>>, CastError> {
        self.vars.get(key).map(Value::as_datetime).transpose()
    }

    pub fn get_duration(&self, key: &str) -> Result<Option<Duration>, CastError> {
        self.vars.get(key).map(Value::as_duration).transpose()
    }

    /// Integer read that falls back to `default` when the key is missing or
    /// not representable.
    pub fn i64_or(&self, key: &str, default: i64) -> i64 {
        self.get_i64(key).ok().flatten().unwrap_or(default)
    }

    pub fn f64_or(&self, key: &str, default: f64) -> f64 {
        self.get_f64(key).ok().flatten().unwrap_or(default)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).ok().flatten().unwrap_or(default)
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.get_string(key)
            .ok()
            .flatten()
            .unwrap_or_else(|| default.to_string())
    }

    // -- JSON bridge --

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.vars
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    /// Build a scope from a JSON object (`null` yields an empty scope).
    pub fn from_json(value: &serde_json::Value) -> Result<Scope, ScopeError> {
        match value {
            serde_json::Value::Object(map) => Ok(map
                .iter()
                .map(|(k, v)| (k.clone(), Value::from_json(v.clone())))
                .collect()),
            serde_json::Value::Null => Ok(Scope::new()),
            other => Err(ScopeError::TypeMismatch {
                path: String::new(),
                expected: ValueType::Scope,
                actual: Value::from_json(other.clone()).value_type(),
            }),
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Scope {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl IntoIterator for Scope {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.vars.into_iter()
    }
}

fn value_has_path(value: &Value, path: &[&str]) -> bool {
    let Some((head, rest)) = path.split_first() else {
        return true;
    };
    match value {
        Value::Scope(scope) => scope
            .vars
            .get(*head)
            .is_some_and(|v| value_has_path(v, rest)),
        Value::Kv(kv) => rest.is_empty() && kv.contains_key(*head),
        Value::Kvv(kvv) => rest.is_empty() && kvv.contains_key(*head),
        Value::Any(serde_json::Value::Object(obj)) => obj
            .get(*head)
            .is_some_and(|v| value_has_path(&Value::Any(v.clone()), rest)),
        _ => false,
    }
}

fn assign(
    scope: &mut Scope,
    key: &str,
    rest: &[&str],
    value: Value,
    full_path: &str,
) -> Result<(), ScopeError> {
    if rest.is_empty() {
        let value = match scope.vars.get(key) {
            Some(existing)
                if existing.value_type() != ValueType::Any
                    && existing.value_type() != value.value_type() =>
            {
                value.cast(existing.value_type())?
            }
            _ => value,
        };
        scope.vars.insert(key.to_string(), value);
        return Ok(());
    }

    let target = scope
        .vars
        .entry(key.to_string())
        .or_insert_with(|| Value::Scope(Scope::new()));
    assign_into(target, rest, value, full_path)
}

fn assign_into(
    target: &mut Value,
    path: &[&str],
    value: Value,
    full_path: &str,
) -> Result<(), ScopeError> {
    let Some((key, rest)) = path.split_first() else {
        return Ok(());
    };

    match target {
        Value::Scope(inner) => assign(inner, key, rest, value, full_path),
        Value::Kv(kv) if rest.is_empty() => {
            kv.insert(key.to_string(), value.as_string()?);
            Ok(())
        }
        Value::Kvv(kvv) if rest.is_empty() => {
            kvv.insert(key.to_string(), value.as_string_list()?);
            Ok(())
        }
        Value::Any(serde_json::Value::Object(obj)) => {
            set_json(obj, key, rest, value.to_json(), full_path)
        }
        other => Err(ScopeError::TypeMismatch {
            path: full_path.to_string(),
            expected: ValueType::Scope,
            actual: other.value_type(),
        }),
    }
}

fn set_json(
    obj: &mut serde_json::Map<String, serde_json::Value>,
    key: &str,
    rest: &[&str],
    value: serde_json::Value,
    full_path: &str,
) -> Result<(), ScopeError> {
    let Some((next, tail)) = rest.split_first() else {
        obj.insert(key.to_string(), value);
        return Ok(());
    };

    let entry = obj
        .entry(key.to_string())
        .or_insert_with(|| serde_json::Value::Object(Default::default()));
    match entry {
        serde_json::Value::Object(inner) => set_json(inner, next, tail, value, full_path),
        other => Err(ScopeError::TypeMismatch {
            path: full_path.to_string(),
            expected: ValueType::Scope,
            actual: Value::from_json(other.clone()).value_type(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Plain JSON (de)serialization
// ---------------------------------------------------------------------------

/// Serde adapter that reads and writes a scope as a plain JSON object.
///
/// Used for hand-written workflow definitions, where values carry no type
/// tags and are inferred on load.
pub mod plain {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Scope;

    pub fn serialize<S: Serializer>(scope: &Scope, serializer: S) -> Result<S::Ok, S::Error> {
        scope.to_json().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Scope, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Scope::from_json(&value).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

/// Parse a duration such as `90`, `1.5s`, `250ms` or `1h30m`.
///
/// A bare integer is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let is_num = |c: char| c.is_ascii_digit() || c == '.';
    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest.find(|c: char| !is_num(c)).unwrap_or(rest.len());
        if num_end == 0 {
            return Err(format!("invalid duration '{input}'"));
        }
        let n: f64 = rest[..num_end]
            .parse()
            .map_err(|_| format!("invalid duration '{input}'"))?;
        rest = &rest[num_end..];

        let unit_end = rest.find(is_num).unwrap_or(rest.len());
        let factor = match &rest[..unit_end] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "d" => 86_400.0,
            unit => return Err(format!("unknown duration unit '{unit}' in '{input}'")),
        };
        total += n * factor;
        rest = &rest[unit_end..];
    }

    Duration::try_from_secs_f64(total).map_err(|e| e.to_string())
}

/// Render a duration in the format accepted by [`parse_duration`].
pub fn format_duration(d: Duration) -> String {
    let total_ms = d.as_millis();
    if total_ms == 0 {
        return "0s".to_string();
    }

    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let seconds = (total_ms / 1000) % 60;
    let millis = total_ms % 1000;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if seconds > 0 {
        out.push_str(&format!("{seconds}s"));
    }
    if millis > 0 {
        out.push_str(&format!("{millis}ms"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_later_overlay_wins_without_mutation() {
        let a = Scope::new().with("a", 1i64);
        let b = Scope::new().with("a", 2i64).with("b", 3i64);

        let merged = a.merge([&b]);

        assert_eq!(merged.get("a"), Some(&Value::Integer64(2)));
        assert_eq!(merged.get("b"), Some(&Value::Integer64(3)));
        assert_eq!(a.len(), 1);
        assert_eq!(a.get("a"), Some(&Value::Integer64(1)));
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn merge_with_no_overlays_is_a_copy() {
        let a = Scope::new().with("x", "y");
        assert_eq!(a.merge([]), a);
    }

    #[test]
    fn has_requires_every_key_and_path() {
        let scope = Scope::new()
            .with("a", 1i64)
            .with("user", Scope::new().with("name", "ann"));

        assert!(scope.has(&["a"]));
        assert!(scope.has(&["a", "user.name"]));
        assert!(!scope.has(&["a", "b"]));
        assert!(!scope.has(&["user.email"]));
        assert!(!scope.has(&["a.b"]));
    }

    #[test]
    fn lookup_follows_paths() {
        let scope = Scope::new()
            .with("user", Scope::new().with("name", "ann"))
            .with("doc", Value::Any(json!({"meta": {"rev": 3}})));

        assert_eq!(scope.lookup("user.name"), Some(Value::from("ann")));
        assert_eq!(scope.lookup("doc.meta.rev"), Some(Value::Integer64(3)));
        assert_eq!(scope.lookup("user.email"), None);
        assert_eq!(scope.lookup("user.name.first"), None);
    }

    #[test]
    fn set_empty_path_replaces_scope() {
        let mut scope = Scope::new().with("old", true);
        scope
            .set(Value::Scope(Scope::new().with("new", 1i64)), &[])
            .unwrap();
        assert!(!scope.contains_key("old"));
        assert!(scope.contains_key("new"));
    }

    #[test]
    fn set_empty_path_rejects_non_scope() {
        let mut scope = Scope::new();
        let err = scope.set(Value::Integer64(1), &[]).unwrap_err();
        assert!(matches!(err, ScopeError::TypeMismatch { .. }));
    }

    #[test]
    fn set_deep_creates_nested_scopes() {
        let mut scope = Scope::new();
        scope.set(Value::from("x"), &["a", "b", "c"]).unwrap();
        assert!(scope.has(&["a.b.c"]));
    }

    #[test]
    fn set_into_kv_and_json_object() {
        let mut scope = Scope::new()
            .with("headers", Value::Kv(BTreeMap::new()))
            .with("doc", Value::Any(json!({"meta": {}})));

        scope.set(Value::Integer64(5), &["headers", "x-count"]).unwrap();
        scope.set(Value::from("v"), &["doc", "meta", "tag"]).unwrap();

        match scope.get("headers") {
            Some(Value::Kv(kv)) => assert_eq!(kv.get("x-count").map(String::as_str), Some("5")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(scope.get("doc").unwrap().to_json()["meta"]["tag"], "v");
    }

    #[test]
    fn set_through_scalar_is_type_mismatch() {
        let mut scope = Scope::new().with("n", 1i64);
        let err = scope.set(Value::from("x"), &["n", "inner"]).unwrap_err();
        assert_eq!(
            err,
            ScopeError::TypeMismatch {
                path: "n.inner".to_string(),
                expected: ValueType::Scope,
                actual: ValueType::Integer64,
            }
        );
    }

    #[test]
    fn set_casts_to_existing_type() {
        let mut scope = Scope::new().with("count", 1i64);
        scope.set(Value::from("42"), &["count"]).unwrap();
        assert_eq!(scope.get("count"), Some(&Value::Integer64(42)));

        let err = scope.set(Value::from("many"), &["count"]).unwrap_err();
        assert!(matches!(err, ScopeError::Cast(_)));
    }

    #[test]
    fn casts_fail_explicitly() {
        assert_eq!(Value::from("12").as_i64().unwrap(), 12);
        assert_eq!(Value::Float(3.0).as_i64().unwrap(), 3);
        assert!(Value::Float(3.5).as_i64().is_err());
        assert!(Value::from("abc").as_f64().is_err());
        assert!(Value::Integer64(-1).as_u64().is_err());
        assert!(Value::cast(&Value::Integer64(1 << 40), ValueType::Integer).is_err());
        assert_eq!(
            Value::from("2024-01-02T03:04:05Z").as_datetime().unwrap().to_rfc3339(),
            "2024-01-02T03:04:05+00:00"
        );
    }

    #[test]
    fn float_to_integer_stays_in_range() {
        assert!(Value::Float(9_223_372_036_854_775_808.0).as_i64().is_err());
        assert_eq!(
            Value::Float(9_223_372_036_854_774_784.0).as_i64().unwrap(),
            9_223_372_036_854_774_784
        );
        assert_eq!(Value::Float(-9_223_372_036_854_775_808.0).as_i64().unwrap(), i64::MIN);
        assert!(Value::from("9223372036854775808.0").as_i64().is_err());
    }

    #[test]
    fn defaults_only_when_caller_asks() {
        let scope = Scope::new().with("n", "not a number");
        assert!(scope.get_i64("n").is_err());
        assert_eq!(scope.i64_or("n", 7), 7);
        assert_eq!(scope.i64_or("missing", 3), 3);
        assert_eq!(scope.get_i64("missing").unwrap(), None);
    }

    #[test]
    fn value_type_names_resolve() {
        assert_eq!(ValueType::from_name("ID").unwrap(), ValueType::Id);
        assert_eq!(ValueType::from_name("kvv").unwrap(), ValueType::Kvv);
        assert_eq!(ValueType::from_name("Vars").unwrap(), ValueType::Scope);
        assert!(ValueType::from_name("Matrix").is_err());
    }

    #[test]
    fn json_bridge_infers_types() {
        let scope = Scope::from_json(&json!({"a": 1, "b": "x", "c": {"d": true}})).unwrap();
        assert_eq!(scope.get("a"), Some(&Value::Integer64(1)));
        assert!(scope.has(&["c.d"]));
        assert_eq!(scope.to_json(), json!({"a": 1, "b": "x", "c": {"d": true}}));
        assert!(Scope::from_json(&json!([1, 2])).is_err());
    }

    #[test]
    fn tagged_serde_is_lossless() {
        let scope = Scope::new()
            .with("i", 5i32)
            .with("d", Duration::from_millis(1500))
            .with("when", DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let json = serde_json::to_string(&scope).unwrap();
        let back: Scope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, scope);
    }

    #[test]
    fn durations_parse_and_format() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("3 weeks").is_err());
        assert_eq!(format_duration(Duration::from_millis(61_250)), "1m1s250ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }
}
