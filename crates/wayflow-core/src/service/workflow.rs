//! Workflow service.
//!
//! Manages stored definitions (create, update, soft delete), keeps a cache
//! of compiled graphs for every enabled workflow, owns the function registry
//! and hands sessions to the [`SessionService`].

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use wayflow_types::function::FunctionMeta;
use wayflow_types::identity::Identity;
use wayflow_types::scope::Scope;
use wayflow_types::session::{SessionId, SessionStartParams, StateId};
use wayflow_types::workflow::{WorkflowDefinition, WorkflowFilter, WorkflowId};

use super::ServiceError;
use super::access::AccessControl;
use super::session::{SessionService, WorkflowSource};
use crate::expr::ExprParser;
use crate::function::{Function, FunctionRegistry};
use crate::id::IdGenerator;
use crate::repository::{SessionRepository, WorkflowRepository};
use crate::workflow::compiler::compile;
use crate::workflow::definition::validate_definition;
use crate::workflow::graph::Graph;
use crate::workflow::session::Session;

/// Service for the workflow lifecycle and the entry point for running them.
pub struct WorkflowService<W, S, A>
where
    W: WorkflowRepository,
    S: SessionRepository + 'static,
    A: AccessControl,
{
    repo: Arc<W>,
    access: Arc<A>,
    parser: Arc<dyn ExprParser>,
    functions: Arc<FunctionRegistry>,
    ids: Arc<IdGenerator>,
    graphs: DashMap<WorkflowId, Arc<Graph>>,
    sessions: SessionService<S, A>,
}

impl<W, S, A> WorkflowService<W, S, A>
where
    W: WorkflowRepository,
    S: SessionRepository + 'static,
    A: AccessControl,
{
    pub fn new(
        repo: Arc<W>,
        access: Arc<A>,
        parser: Arc<dyn ExprParser>,
        functions: Arc<FunctionRegistry>,
        ids: Arc<IdGenerator>,
        sessions: SessionService<S, A>,
    ) -> Self {
        Self {
            repo,
            access,
            parser,
            functions,
            ids,
            graphs: DashMap::new(),
            sessions,
        }
    }

    pub fn sessions(&self) -> &SessionService<S, A> {
        &self.sessions
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate, compile and store a new workflow. The ID and audit fields
    /// are assigned here.
    pub async fn create(
        &self,
        who: &Identity,
        mut def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, ServiceError> {
        if !self.access.can_create_workflow(who) {
            return Err(ServiceError::NotAllowed("create workflow"));
        }

        validate_definition(&def)?;
        self.check_handle(&def.handle, 0).await?;
        let graph = self.compile(&def)?;

        def.id = self.ids.next();
        def.created_by = who.id;
        def.created_at = Utc::now();
        if def.owned_by == 0 {
            def.owned_by = who.id;
        }
        def.updated_by = 0;
        def.updated_at = None;
        def.deleted_by = 0;
        def.deleted_at = None;

        self.repo.create_workflow(&def).await?;
        self.cache(&def, graph);

        tracing::info!(workflow_id = def.id, handle = %def.handle, "workflow created");
        Ok(def)
    }

    /// Replace a stored workflow's definition.
    ///
    /// `def.updated_at` must match the stored value (the caller edited the
    /// latest version). When nothing changed the stored record is returned
    /// untouched.
    pub async fn update(
        &self,
        who: &Identity,
        def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, ServiceError> {
        if def.id == 0 {
            return Err(ServiceError::InvalidId);
        }

        validate_definition(&def)?;
        self.check_handle(&def.handle, def.id).await?;
        let graph = self.compile(&def)?;

        let id = def.id;
        let access = Arc::clone(&self.access);
        let mut changed = false;
        let updated = self
            .repo
            .update_workflow_with(id, |old: WorkflowDefinition| {
                if old.is_deleted() {
                    return Err(ServiceError::WorkflowNotFound(old.id));
                }
                if !access.can_update_workflow(who, &old) {
                    return Err(ServiceError::NotAllowed("update workflow"));
                }
                if old.updated_at != def.updated_at {
                    return Err(ServiceError::StaleData);
                }
                if !definition_changed(&old, &def) {
                    return Ok(old);
                }

                changed = true;
                Ok(WorkflowDefinition {
                    id: old.id,
                    owned_by: if def.owned_by == 0 { old.owned_by } else { def.owned_by },
                    created_by: old.created_by,
                    created_at: old.created_at,
                    updated_by: who.id,
                    updated_at: Some(Utc::now()),
                    deleted_by: 0,
                    deleted_at: None,
                    ..def
                })
            })
            .await
            .map_err(not_found(id))?;

        if changed {
            self.cache(&updated, graph);
            tracing::info!(workflow_id = updated.id, "workflow updated");
        }
        Ok(updated)
    }

    /// Soft delete. Sessions already running are not affected.
    pub async fn delete(&self, who: &Identity, id: WorkflowId) -> Result<(), ServiceError> {
        if id == 0 {
            return Err(ServiceError::InvalidId);
        }

        let access = Arc::clone(&self.access);
        self.repo
            .update_workflow_with(id, |mut def: WorkflowDefinition| {
                if !access.can_delete_workflow(who, &def) {
                    return Err(ServiceError::NotAllowed("delete workflow"));
                }
                if !def.is_deleted() {
                    def.deleted_by = who.id;
                    def.deleted_at = Some(Utc::now());
                }
                Ok(def)
            })
            .await
            .map_err(not_found(id))?;

        self.graphs.remove(&id);
        tracing::info!(workflow_id = id, "workflow deleted");
        Ok(())
    }

    pub async fn undelete(&self, who: &Identity, id: WorkflowId) -> Result<(), ServiceError> {
        if id == 0 {
            return Err(ServiceError::InvalidId);
        }

        let stored = self
            .repo
            .lookup_workflow_by_id(id)
            .await?
            .ok_or(ServiceError::WorkflowNotFound(id))?;
        if !stored.is_deleted() {
            return Ok(());
        }
        self.check_handle(&stored.handle, id).await?;

        let access = Arc::clone(&self.access);
        let def = self
            .repo
            .update_workflow_with(id, |mut def: WorkflowDefinition| {
                if !access.can_undelete_workflow(who, &def) {
                    return Err(ServiceError::NotAllowed("undelete workflow"));
                }
                def.deleted_by = 0;
                def.deleted_at = None;
                def.updated_by = who.id;
                def.updated_at = Some(Utc::now());
                Ok(def)
            })
            .await
            .map_err(not_found(id))?;

        match self.compile(&def) {
            Ok(graph) => self.cache(&def, graph),
            Err(e) => {
                tracing::warn!(workflow_id = id, error = %e, "restored workflow does not compile");
            }
        }
        tracing::info!(workflow_id = id, "workflow undeleted");
        Ok(())
    }

    pub async fn lookup(
        &self,
        who: &Identity,
        id: WorkflowId,
    ) -> Result<WorkflowDefinition, ServiceError> {
        if id == 0 {
            return Err(ServiceError::InvalidId);
        }
        let def = self.lookup_stored(id).await?;
        if !self.access.can_read_workflow(who, &def) {
            return Err(ServiceError::NotAllowed("read workflow"));
        }
        Ok(def)
    }

    pub async fn lookup_by_handle(
        &self,
        who: &Identity,
        handle: &str,
    ) -> Result<WorkflowDefinition, ServiceError> {
        let def = self
            .repo
            .lookup_workflow_by_handle(handle)
            .await?
            .ok_or(ServiceError::WorkflowNotFound(0))?;
        if !self.access.can_read_workflow(who, &def) {
            return Err(ServiceError::NotAllowed("read workflow"));
        }
        Ok(def)
    }

    /// Workflows matching the filter that the caller may read.
    pub async fn search(
        &self,
        who: &Identity,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowDefinition>, ServiceError> {
        if !self.access.can_search_workflows(who) {
            return Err(ServiceError::NotAllowed("search workflows"));
        }
        let found = self.repo.search_workflows(filter).await?;
        Ok(found
            .into_iter()
            .filter(|def| self.access.can_read_workflow(who, def))
            .collect())
    }

    /// Compile every enabled, non-deleted workflow into the graph cache.
    /// Workflows that fail to compile are logged and skipped. Returns the
    /// number of graphs loaded.
    pub async fn load(&self) -> Result<usize, ServiceError> {
        let defs = self
            .repo
            .search_workflows(&WorkflowFilter {
                enabled_only: true,
                ..Default::default()
            })
            .await?;

        self.graphs.clear();
        let mut loaded = 0;
        for def in defs {
            self.ids.observe(def.id);
            match self.compile(&def) {
                Ok(graph) => {
                    self.graphs.insert(def.id, Arc::new(graph));
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        workflow_id = def.id,
                        handle = %def.handle,
                        error = %e,
                        "skipping workflow that does not compile"
                    );
                }
            }
        }

        tracing::info!(loaded, "workflows loaded");
        Ok(loaded)
    }

    /// Compiled graph of a loaded workflow.
    pub fn graph(&self, id: WorkflowId) -> Option<Arc<Graph>> {
        self.graphs.get(&id).map(|g| Arc::clone(&g))
    }

    // -----------------------------------------------------------------------
    // Functions
    // -----------------------------------------------------------------------

    /// Register functions. Graphs compiled earlier keep the handlers they
    /// were compiled with; call [`load`](Self::load) to pick up replacements.
    pub fn register_functions(&self, functions: impl IntoIterator<Item = Function>) {
        self.functions.register(functions);
    }

    pub fn unregister_functions<'a>(&self, references: impl IntoIterator<Item = &'a str>) {
        self.functions.unregister(references);
    }

    /// Registered functions, sorted by reference.
    pub fn functions(&self) -> Vec<FunctionMeta> {
        self.functions.list()
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Start a session of a loaded workflow.
    pub async fn exec(&self, params: SessionStartParams) -> Result<Arc<Session>, ServiceError> {
        if params.workflow_id == 0 {
            return Err(ServiceError::InvalidId);
        }
        let def = self.lookup_stored(params.workflow_id).await?;
        let graph = self
            .graph(def.id)
            .ok_or(ServiceError::WorkflowNotLoaded(def.id))?;
        self.sessions.start(&def, graph, params).await
    }

    /// Supply input to a waiting state of a session.
    pub async fn resume(
        &self,
        who: &Identity,
        session_id: SessionId,
        state_id: StateId,
        input: Scope,
    ) -> Result<Arc<Session>, ServiceError> {
        self.sessions
            .resume(who, session_id, state_id, input, self)
            .await
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn lookup_stored(&self, id: WorkflowId) -> Result<WorkflowDefinition, ServiceError> {
        self.repo
            .lookup_workflow_by_id(id)
            .await?
            .filter(|def| !def.is_deleted())
            .ok_or(ServiceError::WorkflowNotFound(id))
    }

    async fn check_handle(&self, handle: &str, owner: WorkflowId) -> Result<(), ServiceError> {
        match self.repo.lookup_workflow_by_handle(handle).await? {
            Some(existing) if existing.id != owner => {
                Err(ServiceError::HandleNotUnique(handle.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn compile(&self, def: &WorkflowDefinition) -> Result<Graph, ServiceError> {
        Ok(compile(def, self.parser.as_ref(), &self.functions)?)
    }

    fn cache(&self, def: &WorkflowDefinition, graph: Graph) {
        if def.enabled && !def.is_deleted() {
            self.graphs.insert(def.id, Arc::new(graph));
        } else {
            self.graphs.remove(&def.id);
        }
    }
}

impl<W, S, A> WorkflowSource for WorkflowService<W, S, A>
where
    W: WorkflowRepository,
    S: SessionRepository + 'static,
    A: AccessControl,
{
    async fn resolve(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<(WorkflowDefinition, Arc<Graph>), ServiceError> {
        let def = self
            .repo
            .lookup_workflow_by_id(workflow_id)
            .await?
            .ok_or(ServiceError::WorkflowNotFound(workflow_id))?;
        let graph = match self.graph(workflow_id) {
            Some(graph) => graph,
            // Suspended sessions finish even if their workflow was disabled
            // or deleted in the meantime.
            None => Arc::new(self.compile(&def)?),
        };
        Ok((def, graph))
    }
}

/// True when anything the user edits differs.
fn definition_changed(old: &WorkflowDefinition, new: &WorkflowDefinition) -> bool {
    old.handle != new.handle
        || old.meta != new.meta
        || old.enabled != new.enabled
        || old.trace != new.trace
        || old.keep_sessions_secs != new.keep_sessions_secs
        || old.scope != new.scope
        || old.steps != new.steps
        || old.paths != new.paths
        || old.run_as != new.run_as
        || (new.owned_by != 0 && old.owned_by != new.owned_by)
}

fn not_found(id: WorkflowId) -> impl Fn(ServiceError) -> ServiceError {
    move |err| match err {
        ServiceError::Repository(wayflow_types::error::RepositoryError::NotFound) => {
            ServiceError::WorkflowNotFound(id)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::jexl::JexlParser;
    use crate::repository::memory::MemoryRepository;
    use crate::service::access::{AllowAll, OwnerOnly};
    use crate::workflow::definition::DefinitionError;
    use wayflow_types::config::EngineConfig;
    use wayflow_types::function::{FunctionMeta, Param};
    use wayflow_types::scope::ValueType;
    use wayflow_types::session::SessionStatus;
    use wayflow_types::workflow::{
        DeletedFilter, ExprDef, WorkflowPath, WorkflowStep, WorkflowStepKind,
    };

    type Service<A> = WorkflowService<MemoryRepository, MemoryRepository, A>;

    fn service<A: AccessControl>(access: A) -> (Service<A>, Arc<MemoryRepository>) {
        let repo = Arc::new(MemoryRepository::new());
        let access = Arc::new(access);
        let ids = Arc::new(IdGenerator::sequential());
        let config = EngineConfig {
            worker_interval_ms: 1,
            ..Default::default()
        };
        let sessions =
            SessionService::new(Arc::clone(&repo), Arc::clone(&access), config, Arc::clone(&ids));
        let svc = WorkflowService::new(
            Arc::clone(&repo),
            access,
            Arc::new(JexlParser),
            Arc::new(FunctionRegistry::new()),
            ids,
            sessions,
        );
        (svc, repo)
    }

    fn greet() -> WorkflowDefinition {
        let mut def = WorkflowDefinition::new("greet");
        def.scope = Scope::new().with("name", "world");
        def.steps = vec![
            WorkflowStep::new(1, WorkflowStepKind::Expressions, "")
                .with_arguments(vec![ExprDef::new("message", "'hello ' + name")]),
            WorkflowStep::new(2, WorkflowStepKind::Function, "shout")
                .with_arguments(vec![ExprDef::new("text", "message")])
                .with_results(vec![ExprDef::new("loud", "text")]),
        ];
        def.paths = vec![WorkflowPath::new(1, 2)];
        def
    }

    fn shout() -> Function {
        Function::new(
            FunctionMeta::new("shout")
                .param(Param::new("text", &[ValueType::String]).required())
                .result(Param::new("text", &[ValueType::String])),
            |call| async move {
                let text = call.args.string_or("text", "");
                Ok(Scope::new().with("text", text.to_uppercase()))
            },
        )
    }

    fn ann() -> Identity {
        Identity::new(7, "ann")
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_caches_graph() {
        let (svc, _) = service(AllowAll);
        svc.register_functions([shout()]);

        let def = svc.create(&ann(), greet()).await.unwrap();
        assert_ne!(def.id, 0);
        assert_eq!(def.created_by, 7);
        assert_eq!(def.owned_by, 7);
        assert_eq!(svc.graph(def.id).map(|g| g.len()), Some(2));
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_function_and_duplicate_handle() {
        let (svc, _) = service(AllowAll);
        assert!(matches!(
            svc.create(&ann(), greet()).await,
            Err(ServiceError::Definition(DefinitionError::UnknownFunction { .. }))
        ));

        svc.register_functions([shout()]);
        svc.create(&ann(), greet()).await.unwrap();
        assert!(matches!(
            svc.create(&ann(), greet()).await,
            Err(ServiceError::HandleNotUnique(h)) if h == "greet"
        ));
    }

    #[tokio::test]
    async fn test_exec_runs_function_steps() {
        let (svc, repo) = service(AllowAll);
        svc.register_functions([shout()]);
        let def = svc.create(&ann(), greet()).await.unwrap();

        let session = svc
            .exec(SessionStartParams {
                workflow_id: def.id,
                invoker: ann(),
                wait: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let result = session.result().await.expect("result");
        assert_eq!(result.string_or("loud", ""), "HELLO WORLD");
        svc.sessions().flush().await;
        let stored = repo.lookup_session(session.id()).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert_eq!(stored.workflow_id, def.id);
    }

    #[tokio::test]
    async fn test_update_detects_stale_data_and_no_change() {
        let (svc, _) = service(AllowAll);
        svc.register_functions([shout()]);
        let created = svc.create(&ann(), greet()).await.unwrap();

        let unchanged = svc.update(&ann(), created.clone()).await.unwrap();
        assert_eq!(unchanged.updated_at, None);

        let mut edited = created.clone();
        edited.meta.name = "Greeter".into();
        let updated = svc.update(&ann(), edited).await.unwrap();
        assert!(updated.updated_at.is_some());
        assert_eq!(updated.meta.name, "Greeter");

        // based on the version before the edit
        let mut stale = created;
        stale.trace = true;
        assert!(matches!(
            svc.update(&ann(), stale).await,
            Err(ServiceError::StaleData)
        ));
    }

    #[tokio::test]
    async fn test_update_disabling_drops_graph() {
        let (svc, _) = service(AllowAll);
        svc.register_functions([shout()]);
        let mut def = svc.create(&ann(), greet()).await.unwrap();

        def.enabled = false;
        let def = svc.update(&ann(), def).await.unwrap();
        assert!(svc.graph(def.id).is_none());
        assert!(matches!(
            svc.exec(SessionStartParams {
                workflow_id: def.id,
                ..Default::default()
            })
            .await,
            Err(ServiceError::WorkflowNotLoaded(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_and_undelete() {
        let (svc, _) = service(AllowAll);
        svc.register_functions([shout()]);
        let def = svc.create(&ann(), greet()).await.unwrap();

        svc.delete(&ann(), def.id).await.unwrap();
        assert!(svc.graph(def.id).is_none());
        assert!(matches!(
            svc.lookup(&ann(), def.id).await,
            Err(ServiceError::WorkflowNotFound(_))
        ));
        let deleted = svc
            .search(
                &ann(),
                &WorkflowFilter {
                    deleted: DeletedFilter::Only,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(deleted.len(), 1);

        svc.undelete(&ann(), def.id).await.unwrap();
        assert!(svc.graph(def.id).is_some());
        assert_eq!(svc.lookup(&ann(), def.id).await.unwrap().handle, "greet");

        assert!(matches!(
            svc.delete(&ann(), 0).await,
            Err(ServiceError::InvalidId)
        ));
        assert!(matches!(
            svc.delete(&ann(), 999).await,
            Err(ServiceError::WorkflowNotFound(999))
        ));
    }

    #[tokio::test]
    async fn test_access_denials_and_search_filtering() {
        let (svc, _) = service(OwnerOnly);
        svc.register_functions([shout()]);
        let def = svc.create(&ann(), greet()).await.unwrap();
        let bob = Identity::new(8, "bob");

        assert!(matches!(
            svc.lookup(&bob, def.id).await,
            Err(ServiceError::NotAllowed("read workflow"))
        ));
        assert!(matches!(
            svc.delete(&bob, def.id).await,
            Err(ServiceError::NotAllowed("delete workflow"))
        ));
        assert!(
            svc.search(&bob, &WorkflowFilter::default())
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            svc.search(&ann(), &WorkflowFilter::default())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_load_skips_workflows_that_no_longer_compile() {
        let (svc, _) = service(AllowAll);
        svc.register_functions([shout()]);
        let def = svc.create(&ann(), greet()).await.unwrap();

        let mut plain = WorkflowDefinition::new("plain");
        plain.steps = vec![
            WorkflowStep::new(1, WorkflowStepKind::Expressions, "")
                .with_arguments(vec![ExprDef::new("a", "1")]),
        ];
        let plain = svc.create(&ann(), plain).await.unwrap();

        svc.unregister_functions(["shout"]);
        assert_eq!(svc.load().await.unwrap(), 1);
        assert!(svc.graph(def.id).is_none());
        assert!(svc.graph(plain.id).is_some());
        assert!(svc.functions().is_empty());
    }

    #[tokio::test]
    async fn test_resume_through_service() {
        let (svc, _) = service(AllowAll);
        let mut def = WorkflowDefinition::new("ask");
        def.steps = vec![
            WorkflowStep::new(1, WorkflowStepKind::Prompt, "ask"),
            WorkflowStep::new(2, WorkflowStepKind::Expressions, "")
                .with_arguments(vec![ExprDef::new("answer", "input")]),
        ];
        def.paths = vec![WorkflowPath::new(1, 2)];
        let def = svc.create(&ann(), def).await.unwrap();

        let session = svc
            .exec(SessionStartParams {
                workflow_id: def.id,
                invoker: ann(),
                wait: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(session.suspended().await);

        let pending = session.pending_inputs().await;
        let resumed = svc
            .resume(
                &ann(),
                session.id(),
                pending[0].state_id,
                Scope::new().with("input", "foo"),
            )
            .await
            .unwrap();
        resumed.wait().await;
        let result = resumed.result().await.expect("result");
        assert_eq!(result.string_or("answer", ""), "foo");
    }
}
