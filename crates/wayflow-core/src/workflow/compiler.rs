//! Definition -> graph compilation.
//!
//! Steps are converted by repeated passes over the unconverted definitions.
//! A conversion may defer while a step it structurally depends on (a join's
//! parents, a choice gateway's children) is not in the graph yet. A pass that
//! converts nothing ends the loop with an error naming the leftovers.

use wayflow_types::workflow::{ExprDef, StepId, WorkflowDefinition, WorkflowStep, WorkflowStepKind};

use super::definition::{validate_steps, DefinitionError};
use super::exprset::ExprSet;
use super::gateway::{ExclusiveGateway, GatewayPath, InclusiveGateway, JoinGateway};
use super::graph::Graph;
use super::step::{DelayStep, FunctionStep, PromptStep, Step, StepKind};
use crate::expr::ExprParser;
use crate::function::FunctionRegistry;

/// Gateway type names used in the `ref` of gateway steps.
pub const GATEWAY_FORK: &str = "fork";
pub const GATEWAY_JOIN: &str = "join";
pub const GATEWAY_INCLUSIVE: &str = "incl";
pub const GATEWAY_EXCLUSIVE: &str = "excl";

/// Compile a stored definition into an executable graph.
pub fn compile(
    def: &WorkflowDefinition,
    parser: &dyn ExprParser,
    functions: &FunctionRegistry,
) -> Result<Graph, DefinitionError> {
    validate_steps(&def.steps)?;

    let mut graph = Graph::new();
    let mut pending: Vec<&WorkflowStep> = def.steps.iter().collect();

    while !pending.is_empty() {
        let before = pending.len();
        let mut deferred = Vec::with_capacity(before);

        for step in pending {
            match convert(def, step, &graph, parser, functions)? {
                Some(converted) => {
                    graph.add_step(converted.with_id(step.id))?;
                }
                None => deferred.push(step),
            }
        }

        if deferred.len() == before {
            return Err(DefinitionError::Unresolved(
                deferred.iter().map(|s| s.id).collect(),
            ));
        }
        pending = deferred;
    }

    for path in &def.paths {
        graph
            .add_parent(path.child_id, path.parent_id)
            .map_err(|_| DefinitionError::DanglingPath {
                parent: path.parent_id,
                child: path.child_id,
            })?;
    }

    tracing::debug!(
        workflow_id = def.id,
        handle = %def.handle,
        steps = graph.len(),
        paths = graph.path_count(),
        "workflow compiled"
    );

    Ok(graph)
}

/// Convert one definition; `Ok(None)` defers it to a later pass.
fn convert(
    def: &WorkflowDefinition,
    step: &WorkflowStep,
    graph: &Graph,
    parser: &dyn ExprParser,
    functions: &FunctionRegistry,
) -> Result<Option<Step>, DefinitionError> {
    let exprs = |defs: &[ExprDef]| {
        ExprSet::compile(defs, parser).map_err(|source| DefinitionError::Expression {
            step: step.id,
            source,
        })
    };

    let kind = match step.kind {
        WorkflowStepKind::Expressions => StepKind::Expressions(exprs(&step.arguments)?),

        WorkflowStepKind::Function => {
            if step.reference.is_empty() {
                return Err(DefinitionError::MissingFunctionRef(step.id));
            }
            let function =
                functions
                    .lookup(&step.reference)
                    .ok_or_else(|| DefinitionError::UnknownFunction {
                        step: step.id,
                        reference: step.reference.clone(),
                    })?;
            let f = FunctionStep::new(function, exprs(&step.arguments)?, exprs(&step.results)?)
                .map_err(|_| DefinitionError::HandlerNotSet {
                    step: step.id,
                    reference: step.reference.clone(),
                })?;
            StepKind::Function(f)
        }

        WorkflowStepKind::Prompt => StepKind::Prompt(PromptStep::new(
            step.reference.clone(),
            step.required.clone(),
            exprs(&step.arguments)?,
        )),

        WorkflowStepKind::Delay => {
            let arguments = exprs(&step.arguments)?;
            if !arguments
                .targets()
                .any(|t| t == "timestamp" || t == "offset")
            {
                return Err(DefinitionError::DelayWithoutTarget(step.id));
            }
            StepKind::Delay(DelayStep::new(arguments))
        }

        WorkflowStepKind::Gateway => match convert_gateway(def, step, graph, parser)? {
            Some(kind) => kind,
            None => return Ok(None),
        },

        WorkflowStepKind::Unknown => {
            return Err(DefinitionError::UnknownKind {
                id: step.id,
                position: def.steps.iter().position(|s| s.id == step.id).unwrap_or(0),
            })
        }
    };

    Ok(Some(Step::new(kind)))
}

fn convert_gateway(
    def: &WorkflowDefinition,
    step: &WorkflowStep,
    graph: &Graph,
    parser: &dyn ExprParser,
) -> Result<Option<StepKind>, DefinitionError> {
    let empty = || DefinitionError::EmptyGateway {
        step: step.id,
        reference: step.reference.clone(),
    };

    match step.reference.as_str() {
        GATEWAY_FORK => Ok(Some(StepKind::Fork)),

        GATEWAY_JOIN => {
            let parents: Vec<StepId> = def.paths_into(step.id).map(|p| p.parent_id).collect();
            if parents.is_empty() {
                return Err(empty());
            }
            if !parents.iter().all(|id| graph.contains(*id)) {
                return Ok(None);
            }
            Ok(Some(StepKind::Join(JoinGateway::new(parents))))
        }

        GATEWAY_INCLUSIVE | GATEWAY_EXCLUSIVE => {
            let mut paths = Vec::new();
            for path in def.paths_from(step.id) {
                if !graph.contains(path.child_id) {
                    return Ok(None);
                }
                let test = match path.expr.as_deref().map(str::trim) {
                    Some(expr) if !expr.is_empty() => {
                        Some(parser.parse(expr).map_err(|source| DefinitionError::Guard {
                            parent: path.parent_id,
                            child: path.child_id,
                            source,
                        })?)
                    }
                    _ => None,
                };
                paths.push(GatewayPath::new(path.child_id, test));
            }

            if paths.is_empty() {
                return Err(empty());
            }

            if step.reference == GATEWAY_INCLUSIVE {
                Ok(Some(StepKind::Inclusive(InclusiveGateway::new(paths))))
            } else {
                Ok(Some(StepKind::Exclusive(ExclusiveGateway::new(paths))))
            }
        }

        other => Err(DefinitionError::UnknownGateway {
            step: step.id,
            reference: other.to_string(),
        }),
    }
}
