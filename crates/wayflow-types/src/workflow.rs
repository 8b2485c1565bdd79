//! Persisted workflow definition types.
//!
//! A workflow definition is the storable, user-authored description of a
//! graph: a flat list of steps plus a flat list of parent -> child paths.
//! The engine compiles it into an executable graph; nothing here executes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scope::{self, Scope};

/// Identifier of a step within one workflow definition.
pub type StepId = u64;

/// Identifier of a stored workflow.
pub type WorkflowId = u64;

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

/// A stored workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Assigned on create; 0 until then.
    #[serde(default)]
    pub id: WorkflowId,

    /// Unique, human-friendly identifier (`[a-z0-9_-]`, starts with a letter).
    pub handle: String,

    #[serde(default)]
    pub meta: WorkflowMeta,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Record a step-by-step trace on every session of this workflow.
    #[serde(default)]
    pub trace: bool,

    /// How long finished sessions are kept, in seconds (0 = forever).
    #[serde(default)]
    pub keep_sessions_secs: u64,

    /// Default variables every session starts with.
    #[serde(default, with = "scope::plain")]
    pub scope: Scope,

    #[serde(default)]
    pub steps: Vec<WorkflowStep>,

    #[serde(default)]
    pub paths: Vec<WorkflowPath>,

    /// Identity the sessions run as (0 = invoker).
    #[serde(default)]
    pub run_as: u64,

    #[serde(default)]
    pub owned_by: u64,

    #[serde(default)]
    pub created_by: u64,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub updated_by: u64,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub deleted_by: u64,

    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl WorkflowDefinition {
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            id: 0,
            handle: handle.into(),
            meta: WorkflowMeta::default(),
            enabled: true,
            trace: false,
            keep_sessions_secs: 0,
            scope: Scope::new(),
            steps: Vec::new(),
            paths: Vec::new(),
            run_as: 0,
            owned_by: 0,
            created_by: 0,
            created_at: Utc::now(),
            updated_by: 0,
            updated_at: None,
            deleted_by: 0,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Step definition by ID.
    pub fn step(&self, id: StepId) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Paths leading into the given step, in declared order.
    pub fn paths_into(&self, id: StepId) -> impl Iterator<Item = &WorkflowPath> {
        self.paths.iter().filter(move |p| p.child_id == id)
    }

    /// Paths leaving the given step, in declared order.
    pub fn paths_from(&self, id: StepId) -> impl Iterator<Item = &WorkflowPath> {
        self.paths.iter().filter(move |p| p.parent_id == id)
    }
}

/// Descriptive metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMeta {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Kind of a step definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStepKind {
    /// Evaluates arguments into variables.
    Expressions,
    /// Calls a registered function.
    Function,
    /// Routing: `ref` is one of `fork`, `join`, `incl`, `excl`.
    Gateway,
    /// Waits for external input.
    Prompt,
    /// Waits until a point in time.
    Delay,
    /// Anything not recognised; rejected by validation.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for WorkflowStepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStepKind::Expressions => "expressions",
            WorkflowStepKind::Function => "function",
            WorkflowStepKind::Gateway => "gateway",
            WorkflowStepKind::Prompt => "prompt",
            WorkflowStepKind::Delay => "delay",
            WorkflowStepKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One step in a stored definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,

    pub kind: WorkflowStepKind,

    /// Function reference, gateway type or prompt reference.
    #[serde(default, rename = "ref")]
    pub reference: String,

    #[serde(default)]
    pub arguments: Vec<ExprDef>,

    #[serde(default)]
    pub results: Vec<ExprDef>,

    /// Prompt steps: input variables that must be supplied on resume.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl WorkflowStep {
    pub fn new(id: StepId, kind: WorkflowStepKind, reference: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            reference: reference.into(),
            arguments: Vec::new(),
            results: Vec::new(),
            required: Vec::new(),
            label: None,
        }
    }

    pub fn with_arguments(mut self, arguments: Vec<ExprDef>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_results(mut self, results: Vec<ExprDef>) -> Self {
        self.results = results;
        self
    }
}

/// A named expression: evaluates `expr` (or copies `source`, or takes the
/// literal `value`) and stores the result under `target`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExprDef {
    pub target: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expr: String,

    /// Copy another variable verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Literal value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,

    /// Type name the result is cast to (see `ValueType::from_name`).
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,

    /// Checks run before the expression; a test evaluating to true fails
    /// the step with the test's error message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<TestDef>,
}

impl ExprDef {
    pub fn new(target: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            expr: expr.into(),
            ..Self::default()
        }
    }

    pub fn typed(mut self, value_type: impl Into<String>) -> Self {
        self.value_type = Some(value_type.into());
        self
    }

    pub fn with_test(mut self, expr: impl Into<String>, error: impl Into<String>) -> Self {
        self.tests.push(TestDef {
            expr: expr.into(),
            error: error.into(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDef {
    pub expr: String,
    #[serde(default)]
    pub error: String,
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Directed edge between two steps, with an optional guard (used by
/// inclusive/exclusive gateways).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPath {
    pub parent_id: StepId,
    pub child_id: StepId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
}

impl WorkflowPath {
    pub fn new(parent_id: StepId, child_id: StepId) -> Self {
        Self {
            parent_id,
            child_id,
            expr: None,
        }
    }

    pub fn guarded(parent_id: StepId, child_id: StepId, expr: impl Into<String>) -> Self {
        Self {
            parent_id,
            child_id,
            expr: Some(expr.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// Whether soft-deleted records are included in a search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletedFilter {
    #[default]
    Exclude,
    Include,
    Only,
}

impl DeletedFilter {
    pub fn matches(self, deleted_at: Option<DateTime<Utc>>) -> bool {
        match self {
            DeletedFilter::Exclude => deleted_at.is_none(),
            DeletedFilter::Include => true,
            DeletedFilter::Only => deleted_at.is_some(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFilter {
    /// Exact handle match.
    pub handle: Option<String>,
    /// Substring match on handle or name.
    pub query: Option<String>,
    pub deleted: DeletedFilter,
    /// Only enabled workflows.
    pub enabled_only: bool,
    pub limit: Option<usize>,
}

impl WorkflowFilter {
    pub fn matches(&self, def: &WorkflowDefinition) -> bool {
        if let Some(handle) = &self.handle {
            if &def.handle != handle {
                return false;
            }
        }
        if let Some(q) = &self.query {
            let q = q.to_lowercase();
            if !def.handle.to_lowercase().contains(&q) && !def.meta.name.to_lowercase().contains(&q)
            {
                return false;
            }
        }
        if self.enabled_only && !def.enabled {
            return false;
        }
        self.deleted.matches(def.deleted_at)
    }
}

/// Check a workflow handle: non-empty, starts with a letter, then letters,
/// digits, `_` or `-`.
pub fn is_valid_handle(handle: &str) -> bool {
    let mut chars = handle.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_definition_parses_with_defaults() {
        let yaml = r#"
handle: greet
scope:
  greeting: hello
steps:
  - id: 1
    kind: expressions
    arguments:
      - target: message
        expr: "greeting + ' world'"
  - id: 2
    kind: gateway
    ref: excl
  - id: 3
    kind: teleport
paths:
  - parent_id: 1
    child_id: 2
  - parent_id: 2
    child_id: 3
    expr: "message != ''"
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(def.enabled);
        assert!(!def.trace);
        assert_eq!(def.steps.len(), 3);
        assert_eq!(def.steps[1].reference, "excl");
        assert_eq!(def.steps[2].kind, WorkflowStepKind::Unknown);
        assert_eq!(def.paths[1].expr.as_deref(), Some("message != ''"));
        assert_eq!(def.scope.string_or("greeting", ""), "hello");
        assert_eq!(def.paths_into(3).count(), 1);
        assert_eq!(def.paths_from(1).count(), 1);
    }

    #[test]
    fn handle_validation() {
        assert!(is_valid_handle("order-flow_2"));
        assert!(!is_valid_handle(""));
        assert!(!is_valid_handle("2fast"));
        assert!(!is_valid_handle("has space"));
    }

    #[test]
    fn filter_matches_deleted_and_query() {
        let mut def = WorkflowDefinition::new("invoice-sync");
        def.meta.name = "Invoice Sync".to_string();

        let by_query = WorkflowFilter {
            query: Some("SYNC".to_string()),
            ..Default::default()
        };
        assert!(by_query.matches(&def));

        def.deleted_at = Some(Utc::now());
        assert!(!by_query.matches(&def));

        let only_deleted = WorkflowFilter {
            deleted: DeletedFilter::Only,
            ..Default::default()
        };
        assert!(only_deleted.matches(&def));
    }
}
