//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML/JSON documents and the stored `WorkflowDefinition`
//! and checks the structural rules every definition must satisfy before it
//! can be compiled.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;
use wayflow_types::workflow::{
    is_valid_handle, StepId, WorkflowDefinition, WorkflowStep, WorkflowStepKind,
};

use super::exprset::ExprSetError;
use super::graph::GraphError;
use crate::expr::ExprError;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Everything that can make a definition unusable.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid workflow handle '{0}'")]
    InvalidHandle(String),

    #[error("step on position {0} has no ID")]
    MissingStepId(usize),

    #[error("duplicate step ID ({id}) used for steps on positions {first} and {second}")]
    DuplicateStep {
        id: StepId,
        first: usize,
        second: usize,
    },

    #[error("{kind} step (ID={id}, position={position}) does not accept {what}")]
    NotAccepted {
        kind: WorkflowStepKind,
        id: StepId,
        position: usize,
        what: &'static str,
    },

    #[error("unknown step kind (ID={id}, position={position})")]
    UnknownKind { id: StepId, position: usize },

    #[error("function reference missing (step {0})")]
    MissingFunctionRef(StepId),

    #[error("unknown function '{reference}' (step {step})")]
    UnknownFunction { step: StepId, reference: String },

    #[error("function handler for '{reference}' not set (step {step})")]
    HandlerNotSet { step: StepId, reference: String },

    #[error("unknown gateway type '{reference}' (step {step})")]
    UnknownGateway { step: StepId, reference: String },

    #[error("{reference} gateway (step {step}) has no paths")]
    EmptyGateway { step: StepId, reference: String },

    #[error("delay step {0} needs a 'timestamp' or 'offset' argument")]
    DelayWithoutTarget(StepId),

    #[error("invalid expression in step {step}: {source}")]
    Expression { step: StepId, source: ExprSetError },

    #[error("invalid condition on path {parent} -> {child}: {source}")]
    Guard {
        parent: StepId,
        child: StepId,
        source: ExprError,
    },

    #[error("failed to resolve workflow step dependencies (unresolved steps: {0:?})")]
    Unresolved(Vec<StepId>),

    #[error("failed to resolve path {parent} -> {child}")]
    DanglingPath { parent: StepId, child: StepId },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a whole definition: handle format, steps, and path endpoints.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if !is_valid_handle(&def.handle) {
        return Err(DefinitionError::InvalidHandle(def.handle.clone()));
    }

    validate_steps(&def.steps)?;

    for path in &def.paths {
        if def.step(path.parent_id).is_none() || def.step(path.child_id).is_none() {
            return Err(DefinitionError::DanglingPath {
                parent: path.parent_id,
                child: path.child_id,
            });
        }
    }

    Ok(())
}

/// Per-step rules: IDs present and unique, and each kind only carries the
/// expression lists it uses.
pub fn validate_steps(steps: &[WorkflowStep]) -> Result<(), DefinitionError> {
    let mut seen: HashMap<StepId, usize> = HashMap::with_capacity(steps.len());

    for (position, step) in steps.iter().enumerate() {
        if step.id == 0 {
            return Err(DefinitionError::MissingStepId(position));
        }

        if let Some(first) = seen.insert(step.id, position) {
            return Err(DefinitionError::DuplicateStep {
                id: step.id,
                first,
                second: position,
            });
        }

        let not_accepted = |what| DefinitionError::NotAccepted {
            kind: step.kind,
            id: step.id,
            position,
            what,
        };

        match step.kind {
            WorkflowStepKind::Expressions | WorkflowStepKind::Prompt | WorkflowStepKind::Delay => {
                if !step.results.is_empty() {
                    return Err(not_accepted("results"));
                }
            }
            WorkflowStepKind::Gateway => {
                if !step.arguments.is_empty() {
                    return Err(not_accepted("arguments"));
                }
                if !step.results.is_empty() {
                    return Err(not_accepted("results"));
                }
            }
            WorkflowStepKind::Function => {}
            WorkflowStepKind::Unknown => {
                return Err(DefinitionError::UnknownKind {
                    id: step.id,
                    position,
                });
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a `.json`, `.yaml` or `.yml` file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

/// Save a workflow definition as YAML, creating parent directories.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serialize_workflow_yaml(def)?)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use wayflow_types::workflow::{ExprDef, WorkflowPath};

    fn expressions(id: StepId) -> WorkflowStep {
        WorkflowStep::new(id, WorkflowStepKind::Expressions, "")
    }

    #[test]
    fn test_parse_yaml_roundtrip() {
        let yaml = r#"
handle: order-flow
meta:
  name: Order flow
steps:
  - id: 1
    kind: expressions
    arguments:
      - target: total
        expr: "price * qty"
  - id: 2
    kind: prompt
    ref: confirm
    required: [approved]
paths:
  - parent_id: 1
    child_id: 2
"#;
        let def = parse_workflow_yaml(yaml).unwrap();
        assert_eq!(def.handle, "order-flow");
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[1].required, vec!["approved".to_string()]);

        let back = parse_workflow_yaml(&serialize_workflow_yaml(&def).unwrap()).unwrap();
        assert_eq!(back.steps, def.steps);
        assert_eq!(back.paths, def.paths);
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{"handle":"j","steps":[{"id":1,"kind":"gateway","ref":"fork"}]}"#;
        let def = parse_workflow_json(json).unwrap();
        assert_eq!(def.steps[0].kind, WorkflowStepKind::Gateway);
        assert!(matches!(parse_workflow_json("{"), Err(DefinitionError::Parse(_))));
    }

    #[test]
    fn test_validation_rejects_duplicate_step_ids() {
        let err = validate_steps(&[expressions(1), expressions(2), expressions(1)]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "duplicate step ID (1) used for steps on positions 0 and 2"
        );
    }

    #[test]
    fn test_validation_rejects_results_on_expressions() {
        let step = expressions(4).with_results(vec![ExprDef::new("a", "1")]);
        let err = validate_steps(&[step]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "expressions step (ID=4, position=0) does not accept results"
        );
    }

    #[test]
    fn test_validation_rejects_gateway_arguments() {
        let step = WorkflowStep::new(3, WorkflowStepKind::Gateway, "excl")
            .with_arguments(vec![ExprDef::new("a", "1")]);
        assert!(matches!(
            validate_steps(&[step]),
            Err(DefinitionError::NotAccepted { what: "arguments", .. })
        ));
    }

    #[test]
    fn test_validation_rejects_unknown_kind_and_zero_id() {
        let unknown = WorkflowStep::new(5, WorkflowStepKind::Unknown, "");
        assert_eq!(
            validate_steps(&[unknown]).unwrap_err().to_string(),
            "unknown step kind (ID=5, position=0)"
        );
        assert!(matches!(
            validate_steps(&[expressions(0)]),
            Err(DefinitionError::MissingStepId(0))
        ));
    }

    #[test]
    fn test_validation_rejects_bad_handle_and_dangling_path() {
        let mut def = WorkflowDefinition::new("9lives");
        assert!(matches!(
            validate_definition(&def),
            Err(DefinitionError::InvalidHandle(_))
        ));

        def.handle = "ok".into();
        def.steps.push(expressions(1));
        def.paths.push(WorkflowPath::new(1, 2));
        assert!(matches!(
            validate_definition(&def),
            Err(DefinitionError::DanglingPath { parent: 1, child: 2 })
        ));
    }

    #[test]
    fn test_save_and_load_workflow_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("flow.yaml");

        let mut def = WorkflowDefinition::new("saved");
        def.steps.push(expressions(1).with_arguments(vec![ExprDef::new("x", "1")]));
        save_workflow_file(&path, &def).unwrap();

        let loaded = load_workflow_file(&path).unwrap();
        assert_eq!(loaded.handle, "saved");
        assert_eq!(loaded.steps, def.steps);
    }
}
