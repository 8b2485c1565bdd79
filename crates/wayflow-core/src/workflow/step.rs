//! Executable steps.
//!
//! A [`Step`] is one node of a compiled [`Graph`](super::graph::Graph). The
//! built-in behaviours are variants of [`StepKind`]; anything else plugs in
//! through [`StepHandler`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use wayflow_types::scope::{CastError, Scope, ScopeError};
use wayflow_types::session::{SessionId, StateId};
use wayflow_types::workflow::StepId;

use super::exprset::ExprSet;
use super::gateway::{ExclusiveGateway, InclusiveGateway, JoinGateway, JoinState};
use crate::expr::ExprError;
use crate::function::{Function, FunctionCall, FunctionHandler};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure of a single step invocation. Any of these aborts the session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    #[error(transparent)]
    Expr(#[from] ExprError),

    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error(transparent)]
    Cast(#[from] CastError),

    #[error("{message}")]
    TestFailed { target: String, message: String },

    /// Error returned by a function handler, kept verbatim.
    #[error("{0}")]
    Handler(String),

    #[error("function handler for '{0}' not set")]
    HandlerNotSet(String),

    #[error("function '{function}' requires argument '{argument}'")]
    MissingArgument { function: String, argument: String },

    #[error("variable '{0}' not found")]
    MissingVariable(String),

    #[error("no matching path")]
    NoMatchingPath,

    #[error("unknown join path: step {0} is not a declared parent")]
    UnknownJoinPath(StepId),

    #[error("duplicate join path: step {0} already arrived")]
    DuplicateJoinPath(StepId),

    #[error("step {0} does not exist")]
    UnknownStep(StepId),

    #[error("{0}")]
    Failed(String),

    #[error("step panicked: {0}")]
    Panicked(String),

    #[error("session cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// Everything a step invocation gets to work with.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub session_id: SessionId,
    pub state_id: StateId,
    pub step_id: StepId,
    /// Step whose completion scheduled this one (0 for the start step).
    pub parent: StepId,
    /// Scope of the branch that led here.
    pub scope: Scope,
    /// Output of the parent, the session input for the start step, or the
    /// input supplied on resume.
    pub input: Scope,
    /// Ids of the step's children in the graph.
    pub children: Vec<StepId>,
    /// When the state was created; stable across re-executions.
    pub started_at: DateTime<Utc>,
    /// Set when the state is re-executed after a suspension.
    pub resumed: bool,
    pub cancel: CancellationToken,
    /// Shared arrival buffer, present for join steps only.
    pub join: Option<Arc<JoinState>>,
}

impl ExecRequest {
    /// Branch scope with the input laid over it.
    pub fn merged_scope(&self) -> Scope {
        self.scope.merge([&self.input])
    }
}

/// Why a step wants to be parked.
#[derive(Debug, Clone, PartialEq)]
pub enum Suspend {
    /// Re-run the step once this moment has passed.
    Until(DateTime<Utc>),
    /// Re-run the step when `resume` supplies input.
    Input,
}

/// Outcome of a successful step invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecResponse {
    /// Completed with these output variables; continue along graph edges.
    Result(Scope),
    /// Join branch accepted; still waiting for the others.
    Partial,
    Suspend(Suspend),
    /// Continue concurrently into these steps.
    Next(Vec<StepId>),
    /// Continue into this one step.
    Step(StepId),
}

impl ExecResponse {
    pub fn delay_until(until: DateTime<Utc>) -> Self {
        ExecResponse::Suspend(Suspend::Until(until))
    }

    pub fn wait_for_input() -> Self {
        ExecResponse::Suspend(Suspend::Input)
    }
}

impl From<Scope> for ExecResponse {
    fn from(scope: Scope) -> Self {
        ExecResponse::Result(scope)
    }
}

// ---------------------------------------------------------------------------
// Pluggable handlers
// ---------------------------------------------------------------------------

/// Custom step behaviour.
pub trait StepHandler: Send + Sync + 'static {
    fn exec(
        &self,
        req: &ExecRequest,
    ) -> impl Future<Output = Result<ExecResponse, StepError>> + Send;
}

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn exec_boxed<'a>(
        &'a self,
        req: &'a ExecRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ExecResponse, StepError>> + Send + 'a>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn exec_boxed<'a>(
        &'a self,
        req: &'a ExecRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ExecResponse, StepError>> + Send + 'a>> {
        Box::pin(self.exec(req))
    }
}

// ---------------------------------------------------------------------------
// Built-in kinds
// ---------------------------------------------------------------------------

/// Calls a registered function.
#[derive(Clone)]
pub struct FunctionStep {
    function: Arc<Function>,
    handler: FunctionHandler,
    arguments: ExprSet,
    results: ExprSet,
}

impl FunctionStep {
    pub fn new(
        function: Arc<Function>,
        arguments: ExprSet,
        results: ExprSet,
    ) -> Result<Self, StepError> {
        let handler = function
            .handler
            .clone()
            .ok_or_else(|| StepError::HandlerNotSet(function.meta.reference.clone()))?;
        Ok(Self {
            function,
            handler,
            arguments,
            results,
        })
    }

    pub fn reference(&self) -> &str {
        &self.function.meta.reference
    }

    async fn exec(&self, req: &ExecRequest) -> Result<ExecResponse, StepError> {
        let args = self.arguments.eval(&req.merged_scope())?;

        if let Some(missing) = self
            .function
            .meta
            .required_parameters()
            .find(|name| !args.has(&[*name]))
        {
            return Err(StepError::MissingArgument {
                function: self.reference().to_string(),
                argument: missing.to_string(),
            });
        }

        tracing::debug!(
            session_id = req.session_id,
            state_id = req.state_id,
            step_id = req.step_id,
            function = self.reference(),
            "calling function"
        );

        let out = (self.handler)(FunctionCall {
            session_id: req.session_id,
            state_id: req.state_id,
            step_id: req.step_id,
            args,
            cancel: req.cancel.clone(),
        })
        .await
        .map_err(|e| StepError::Handler(e.to_string()))?;

        if self.results.is_empty() {
            return Ok(ExecResponse::Result(Scope::new()));
        }

        Ok(ExecResponse::Result(self.results.eval(&out)?))
    }
}

/// Waits for external input.
#[derive(Debug, Clone)]
pub struct PromptStep {
    reference: String,
    required: Vec<String>,
    arguments: ExprSet,
}

impl PromptStep {
    pub fn new(reference: impl Into<String>, required: Vec<String>, arguments: ExprSet) -> Self {
        Self {
            reference: reference.into(),
            required,
            arguments,
        }
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Suspends until the input carries every required name. A prompt
    /// without required names suspends once and accepts whatever the
    /// resume supplies.
    fn exec(&self, req: &ExecRequest) -> Result<ExecResponse, StepError> {
        let required: Vec<&str> = self.required.iter().map(String::as_str).collect();
        let satisfied = if required.is_empty() {
            req.resumed
        } else {
            req.input.has(&required)
        };

        if !satisfied {
            return Ok(ExecResponse::wait_for_input());
        }

        if self.arguments.is_empty() {
            return Ok(ExecResponse::Result(req.input.clone()));
        }

        let extra = self.arguments.eval(&req.merged_scope())?;
        Ok(ExecResponse::Result(req.input.merge([&extra])))
    }
}

/// Holds the branch until a moment in time.
///
/// Arguments must produce either `timestamp` (absolute) or `offset`
/// (duration counted from when the state was created).
#[derive(Debug, Clone)]
pub struct DelayStep {
    arguments: ExprSet,
}

impl DelayStep {
    pub fn new(arguments: ExprSet) -> Self {
        Self { arguments }
    }

    fn exec(&self, req: &ExecRequest) -> Result<ExecResponse, StepError> {
        let args = self.arguments.eval(&req.merged_scope())?;

        let until = match args.get_datetime("timestamp")? {
            Some(ts) => ts,
            None => {
                let offset = args
                    .get_duration("offset")?
                    .ok_or_else(|| StepError::MissingVariable("timestamp or offset".into()))?;
                let offset = chrono::Duration::from_std(offset)
                    .map_err(|e| StepError::Failed(format!("invalid delay offset: {e}")))?;
                req.started_at + offset
            }
        };

        if Utc::now() < until {
            return Ok(ExecResponse::delay_until(until));
        }

        Ok(ExecResponse::Result(Scope::new()))
    }
}

/// Closed set of step behaviours.
#[derive(Clone)]
pub enum StepKind {
    Expressions(ExprSet),
    Function(FunctionStep),
    Prompt(PromptStep),
    Delay(DelayStep),
    Fork,
    Join(JoinGateway),
    Inclusive(InclusiveGateway),
    Exclusive(ExclusiveGateway),
    Custom(Arc<dyn StepHandlerDyn>),
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Expressions(_) => "expressions",
            StepKind::Function(_) => "function",
            StepKind::Prompt(_) => "prompt",
            StepKind::Delay(_) => "delay",
            StepKind::Fork => "fork",
            StepKind::Join(_) => "join",
            StepKind::Inclusive(_) => "incl",
            StepKind::Exclusive(_) => "excl",
            StepKind::Custom(_) => "custom",
        }
    }
}

/// One node of a workflow graph.
#[derive(Clone)]
pub struct Step {
    id: StepId,
    kind: StepKind,
}

impl Step {
    /// New step without an id; the graph assigns one on insertion.
    pub fn new(kind: StepKind) -> Self {
        Self { id: 0, kind }
    }

    pub fn with_id(mut self, id: StepId) -> Self {
        self.id = id;
        self
    }

    pub fn custom(handler: impl StepHandler) -> Self {
        Self::new(StepKind::Custom(Arc::new(handler)))
    }

    pub fn id(&self) -> StepId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: StepId) {
        self.id = id;
    }

    pub fn kind(&self) -> &StepKind {
        &self.kind
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn is_join(&self) -> bool {
        matches!(self.kind, StepKind::Join(_))
    }

    pub async fn exec(&self, req: &ExecRequest) -> Result<ExecResponse, StepError> {
        match &self.kind {
            StepKind::Expressions(set) => Ok(ExecResponse::Result(set.eval(&req.merged_scope())?)),
            StepKind::Function(f) => f.exec(req).await,
            StepKind::Prompt(p) => p.exec(req),
            StepKind::Delay(d) => d.exec(req),
            StepKind::Fork => Ok(ExecResponse::Next(req.children.clone())),
            StepKind::Join(j) => j.exec(req),
            StepKind::Inclusive(g) => g.exec(req),
            StepKind::Exclusive(g) => g.exec(req),
            StepKind::Custom(h) => h.exec_boxed(req).await,
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("kind", &self.kind_name())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::expr::jexl::JexlParser;
    use wayflow_types::function::{FunctionMeta, Param};
    use wayflow_types::scope::ValueType;
    use wayflow_types::workflow::ExprDef;

    pub(crate) fn request(scope: Scope, input: Scope) -> ExecRequest {
        ExecRequest {
            session_id: 1,
            state_id: 1,
            step_id: 1,
            parent: 0,
            scope,
            input,
            children: Vec::new(),
            started_at: Utc::now(),
            resumed: false,
            cancel: CancellationToken::new(),
            join: None,
        }
    }

    fn exprs(defs: &[ExprDef]) -> ExprSet {
        ExprSet::compile(defs, &JexlParser).unwrap()
    }

    fn sum_function() -> Arc<Function> {
        Arc::new(Function::new(
            FunctionMeta::new("sum")
                .param(Param::new("a", &[ValueType::Float]).required())
                .param(Param::new("b", &[ValueType::Float])),
            |call: FunctionCall| async move {
                let a = call.args.f64_or("a", 0.0);
                let b = call.args.f64_or("b", 0.0);
                Ok(Scope::new().with("sum", a + b))
            },
        ))
    }

    #[tokio::test]
    async fn test_expression_step_sees_scope_and_input() {
        let step = Step::new(StepKind::Expressions(exprs(&[ExprDef::new("c", "a + b")])));
        let req = request(Scope::new().with("a", 1i64), Scope::new().with("b", 2i64));
        let res = step.exec(&req).await.unwrap();
        let ExecResponse::Result(out) = res else { panic!("expected result") };
        assert_eq!(out.f64_or("c", 0.0), 3.0);
    }

    #[tokio::test]
    async fn test_function_step_arguments_and_results() {
        let step = FunctionStep::new(
            sum_function(),
            exprs(&[ExprDef::new("a", "x"), ExprDef::new("b", "2")]),
            exprs(&[ExprDef::new("total", "sum")]),
        )
        .unwrap();
        let res = step
            .exec(&request(Scope::new().with("x", 40i64), Scope::new()))
            .await
            .unwrap();
        let ExecResponse::Result(out) = res else { panic!("expected result") };
        assert_eq!(out.f64_or("total", 0.0), 42.0);
        assert!(!out.contains_key("sum"));
    }

    #[tokio::test]
    async fn test_function_step_without_results_contributes_nothing() {
        let step = FunctionStep::new(sum_function(), exprs(&[ExprDef::new("a", "1")]), ExprSet::default())
            .unwrap();
        let res = step.exec(&request(Scope::new(), Scope::new())).await.unwrap();
        assert_eq!(res, ExecResponse::Result(Scope::new()));
    }

    #[tokio::test]
    async fn test_function_step_missing_required_argument() {
        let step = FunctionStep::new(sum_function(), exprs(&[ExprDef::new("b", "1")]), ExprSet::default())
            .unwrap();
        let err = step.exec(&request(Scope::new(), Scope::new())).await.unwrap_err();
        assert_eq!(
            err,
            StepError::MissingArgument {
                function: "sum".into(),
                argument: "a".into()
            }
        );
    }

    #[tokio::test]
    async fn test_function_handler_error_is_verbatim() {
        let failing = Arc::new(Function::new(FunctionMeta::new("boom"), |_call: FunctionCall| async {
            Err::<Scope, _>(anyhow::anyhow!("remote said no"))
        }));
        let step = FunctionStep::new(failing, ExprSet::default(), ExprSet::default()).unwrap();
        let err = step.exec(&request(Scope::new(), Scope::new())).await.unwrap_err();
        assert_eq!(err.to_string(), "remote said no");
    }

    #[test]
    fn test_function_step_requires_handler() {
        let declared = Arc::new(Function::declared(FunctionMeta::new("later")));
        assert!(matches!(
            FunctionStep::new(declared, ExprSet::default(), ExprSet::default()),
            Err(StepError::HandlerNotSet(_))
        ));
    }

    #[test]
    fn test_prompt_waits_for_required_input() {
        let prompt = PromptStep::new("ask", vec!["answer".into()], ExprSet::default());

        let res = prompt.exec(&request(Scope::new(), Scope::new())).unwrap();
        assert_eq!(res, ExecResponse::wait_for_input());

        let input = Scope::new().with("answer", "yes");
        let res = prompt.exec(&request(Scope::new(), input.clone())).unwrap();
        assert_eq!(res, ExecResponse::Result(input));
    }

    #[test]
    fn test_prompt_without_required_waits_once() {
        let prompt = PromptStep::new("ack", Vec::new(), ExprSet::default());
        let mut req = request(Scope::new(), Scope::new().with("anything", 1i64));
        assert_eq!(prompt.exec(&req).unwrap(), ExecResponse::wait_for_input());

        req.resumed = true;
        assert!(matches!(prompt.exec(&req).unwrap(), ExecResponse::Result(_)));
    }

    #[test]
    fn test_delay_step_offset() {
        let mut offset = ExprDef::new("offset", "");
        offset.value = Some(serde_json::json!("1h"));
        let step = DelayStep::new(exprs(&[offset.typed("Duration")]));

        let req = request(Scope::new(), Scope::new());
        match step.exec(&req).unwrap() {
            ExecResponse::Suspend(Suspend::Until(until)) => {
                assert_eq!(until, req.started_at + chrono::Duration::hours(1));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_delay_step_past_timestamp_completes() {
        let step = DelayStep::new(exprs(&[
            ExprDef::new("timestamp", "'2001-01-01T00:00:00Z'").typed("DateTime")
        ]));
        let res = step.exec(&request(Scope::new(), Scope::new())).unwrap();
        assert_eq!(res, ExecResponse::Result(Scope::new()));
    }

    #[test]
    fn test_delay_step_needs_target() {
        let step = DelayStep::new(exprs(&[ExprDef::new("other", "1")]));
        assert!(matches!(
            step.exec(&request(Scope::new(), Scope::new())),
            Err(StepError::MissingVariable(_))
        ));
    }

    struct Echo;

    impl StepHandler for Echo {
        async fn exec(&self, req: &ExecRequest) -> Result<ExecResponse, StepError> {
            Ok(ExecResponse::Result(req.input.clone()))
        }
    }

    #[tokio::test]
    async fn test_custom_step() {
        let step = Step::custom(Echo).with_id(9);
        assert_eq!(step.id(), 9);
        assert_eq!(step.kind_name(), "custom");
        let input = Scope::new().with("k", "v");
        let res = step.exec(&request(Scope::new(), input.clone())).await.unwrap();
        assert_eq!(res, ExecResponse::Result(input));
    }

    #[tokio::test]
    async fn test_fork_returns_children() {
        let step = Step::new(StepKind::Fork);
        let mut req = request(Scope::new(), Scope::new());
        req.children = vec![4, 5, 6];
        assert_eq!(step.exec(&req).await.unwrap(), ExecResponse::Next(vec![4, 5, 6]));
    }
}
