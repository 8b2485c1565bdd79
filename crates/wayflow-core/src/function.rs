//! Function registry.
//!
//! Function steps call into handlers registered here by reference. The
//! registry is an explicit object owned by the workflow service and handed to
//! the compiler; there is no process-wide registry.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use wayflow_types::function::FunctionMeta;
use wayflow_types::scope::Scope;
use wayflow_types::session::{SessionId, StateId};
use wayflow_types::workflow::StepId;

/// Everything a handler gets to see about the invocation.
#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub session_id: SessionId,
    pub state_id: StateId,
    pub step_id: StepId,
    pub args: Scope,
    /// Cancelled when the owning session is cancelled.
    pub cancel: CancellationToken,
}

/// Type-erased async handler: `(call) -> result scope`.
pub type FunctionHandler =
    Arc<dyn Fn(FunctionCall) -> BoxFuture<'static, anyhow::Result<Scope>> + Send + Sync>;

/// A callable function: public description plus handler.
#[derive(Clone)]
pub struct Function {
    pub meta: FunctionMeta,
    /// `None` for declared-but-unimplemented functions; compiling a step
    /// that references one fails.
    pub handler: Option<FunctionHandler>,
}

impl Function {
    pub fn new<F, Fut>(meta: FunctionMeta, handler: F) -> Self
    where
        F: Fn(FunctionCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Scope>> + Send + 'static,
    {
        Self {
            meta,
            handler: Some(Arc::new(move |call| Box::pin(handler(call)))),
        }
    }

    /// A function known by name whose handler is not available.
    pub fn declared(meta: FunctionMeta) -> Self {
        Self {
            meta,
            handler: None,
        }
    }

    pub fn reference(&self) -> &str {
        &self.meta.reference
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("meta", &self.meta)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Registry of callable functions keyed by reference.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    functions: DashMap<String, Arc<Function>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) functions.
    pub fn register(&self, functions: impl IntoIterator<Item = Function>) {
        for function in functions {
            tracing::debug!(reference = function.reference(), "registering function");
            self.functions
                .insert(function.meta.reference.clone(), Arc::new(function));
        }
    }

    /// Remove functions by reference. Unknown references are ignored.
    pub fn unregister<'a>(&self, references: impl IntoIterator<Item = &'a str>) {
        for reference in references {
            if self.functions.remove(reference).is_some() {
                tracing::debug!(reference, "unregistered function");
            }
        }
    }

    pub fn lookup(&self, reference: &str) -> Option<Arc<Function>> {
        self.functions.get(reference).map(|f| Arc::clone(f.value()))
    }

    /// Descriptions of every registered function, sorted by reference.
    pub fn list(&self) -> Vec<FunctionMeta> {
        let mut out: Vec<FunctionMeta> = self
            .functions
            .iter()
            .map(|entry| entry.value().meta.clone())
            .collect();
        out.sort_by(|a, b| a.reference.cmp(&b.reference));
        out
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(reference: &str) -> Function {
        Function::new(FunctionMeta::new(reference), |call: FunctionCall| async move {
            Ok(call.args)
        })
    }

    #[test]
    fn test_register_lookup_unregister() {
        let registry = FunctionRegistry::new();
        registry.register([echo("http.send"), echo("log.write")]);

        assert!(registry.lookup("http.send").is_some());
        assert!(registry.lookup("nope").is_none());

        registry.unregister(["http.send", "nope"]);
        assert!(registry.lookup("http.send").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_sorted_by_reference() {
        let registry = FunctionRegistry::new();
        registry.register([echo("zeta"), echo("alpha"), echo("mid")]);

        let refs: Vec<String> = registry.list().into_iter().map(|m| m.reference).collect();
        assert_eq!(refs, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_handler_invocation() {
        let function = echo("echo");
        let handler = function.handler.clone().unwrap();
        let out = handler(FunctionCall {
            session_id: 1,
            state_id: 2,
            step_id: 3,
            args: Scope::new().with("x", 1i64),
            cancel: CancellationToken::new(),
        })
        .await
        .unwrap();
        assert_eq!(out.i64_or("x", 0), 1);
    }

    #[test]
    fn test_declared_function_has_no_handler() {
        let function = Function::declared(FunctionMeta::new("later"));
        assert!(function.handler.is_none());
        assert_eq!(function.reference(), "later");
    }
}
