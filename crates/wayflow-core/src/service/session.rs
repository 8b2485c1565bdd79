//! Session pool.
//!
//! Keeps every live [`Session`] keyed by ID. New sessions are not built by
//! the caller: a construction request goes through a bounded queue to one
//! coordinator task, which owns the root cancellation token, so every
//! session inherits the pool's lifetime instead of the caller's.
//!
//! State changes reported by sessions are forwarded to a persister task
//! that writes them through the [`SessionRepository`]; the scheduler never
//! touches storage itself.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use wayflow_types::config::EngineConfig;
use wayflow_types::identity::Identity;
use wayflow_types::scope::Scope;
use wayflow_types::session::{
    SessionFilter, SessionId, SessionRecord, SessionStartParams, SessionStatus, StateId,
};
use wayflow_types::workflow::{WorkflowDefinition, WorkflowId};

use super::ServiceError;
use super::access::AccessControl;
use crate::id::IdGenerator;
use crate::repository::SessionRepository;
use crate::workflow::graph::Graph;
use crate::workflow::session::{
    Session, SessionError, SessionOptions, SessionSnapshot, StateChangeHandler,
};

/// Resolves the definition and compiled graph a stored session runs on.
pub trait WorkflowSource: Send + Sync {
    fn resolve(
        &self,
        workflow_id: WorkflowId,
    ) -> impl Future<Output = Result<(WorkflowDefinition, Arc<Graph>), ServiceError>> + Send;
}

type Pool = Arc<RwLock<HashMap<SessionId, Arc<Session>>>>;

struct SpawnRequest {
    id: SessionId,
    graph: Arc<Graph>,
    options: SessionOptions,
    restore: Option<SessionSnapshot>,
    reply: oneshot::Sender<Result<Arc<Session>, SessionError>>,
}

enum PersistMsg {
    Snapshot {
        snapshot: SessionSnapshot,
        keep_secs: u64,
    },
    Flush(oneshot::Sender<()>),
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Starts, resumes, finds and cancels sessions.
///
/// Must be constructed inside a tokio runtime: the coordinator and persister
/// tasks are spawned by [`SessionService::new`].
pub struct SessionService<R: SessionRepository + 'static, A: AccessControl> {
    repo: Arc<R>,
    access: Arc<A>,
    config: EngineConfig,
    ids: Arc<IdGenerator>,
    pool: Pool,
    restoring: Mutex<()>,
    spawn_tx: mpsc::Sender<SpawnRequest>,
    persist_tx: mpsc::UnboundedSender<PersistMsg>,
    root: CancellationToken,
}

impl<R: SessionRepository + 'static, A: AccessControl> SessionService<R, A> {
    pub fn new(repo: Arc<R>, access: Arc<A>, config: EngineConfig, ids: Arc<IdGenerator>) -> Self {
        let root = CancellationToken::new();
        let pool: Pool = Arc::default();

        let (spawn_tx, spawn_rx) = mpsc::channel(config.spawn_queue_capacity.max(1));
        tokio::spawn(coordinate(spawn_rx, root.clone()));

        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        tokio::spawn(persist(Arc::clone(&repo), Arc::clone(&pool), persist_rx));

        Self {
            repo,
            access,
            config,
            ids,
            pool,
            restoring: Mutex::new(()),
            spawn_tx,
            persist_tx,
            root,
        }
    }

    /// Start a new session of `def` at `params.step_id` (or the graph's only
    /// orphan when 0).
    pub async fn start(
        &self,
        def: &WorkflowDefinition,
        graph: Arc<Graph>,
        params: SessionStartParams,
    ) -> Result<Arc<Session>, ServiceError> {
        if !self.access.can_execute_workflow(&params.invoker, def) {
            return Err(ServiceError::NotAllowed("execute workflow"));
        }
        if def.is_deleted() {
            return Err(ServiceError::WorkflowNotFound(def.id));
        }
        if !def.enabled {
            return Err(ServiceError::WorkflowDisabled(def.id));
        }

        let step_id = if params.step_id == 0 {
            match graph.orphans().as_slice() {
                [] => return Err(ServiceError::NoStartStep),
                [only] => *only,
                many => return Err(ServiceError::AmbiguousStartStep(many.to_vec())),
            }
        } else {
            params.step_id
        };
        if !graph.contains(step_id) {
            return Err(SessionError::StepNotFound(step_id).into());
        }

        let id = self.ids.next();
        let mut record = SessionRecord::new(id, def.id, params.input.clone(), &params.invoker);
        record.event_type = params.event_type;
        record.resource_type = params.resource_type;
        self.repo.create_session(&record).await?;

        let options = self.options(def, params.trace);
        let session = self.spawn(id, graph, options, None).await?;
        self.pool.write().await.insert(id, Arc::clone(&session));

        session.exec(step_id, params.input).await?;
        tracing::info!(
            session_id = id,
            workflow_id = def.id,
            step_id,
            invoker = params.invoker.id,
            "session spawned"
        );

        if params.wait {
            session.wait().await;
        }
        Ok(session)
    }

    /// Supply input to a waiting state. Sessions that are not live (e.g.
    /// after a restart) are restored from their stored record first.
    pub async fn resume<S: WorkflowSource>(
        &self,
        who: &Identity,
        session_id: SessionId,
        state_id: StateId,
        input: Scope,
        source: &S,
    ) -> Result<Arc<Session>, ServiceError> {
        let record = self.record(session_id).await?;
        if !self.access.can_manage_session(who, &record) {
            return Err(ServiceError::NotAllowed("resume session"));
        }

        let session = match self.live(session_id).await {
            Some(live) => live,
            None => {
                if record.status.is_terminal() {
                    return Err(SessionError::Finished(record.status).into());
                }
                let (def, graph) = source.resolve(record.workflow_id).await?;
                self.restore(session_id, &def, graph).await?
            }
        };

        session.resume(state_id, input).await?;
        Ok(session)
    }

    /// Restore every stored suspended session so parked timers fire again.
    /// Returns how many sessions were restored.
    pub async fn recover<S: WorkflowSource>(&self, source: &S) -> Result<usize, ServiceError> {
        let stored = self
            .repo
            .search_sessions(&SessionFilter {
                status: vec![SessionStatus::Suspended],
                ..Default::default()
            })
            .await?;

        let mut restored = 0;
        for record in stored {
            if self.live(record.id).await.is_some() {
                continue;
            }
            let recovered = match source.resolve(record.workflow_id).await {
                Ok((def, graph)) => self.restore(record.id, &def, graph).await,
                Err(e) => Err(e),
            };
            match recovered {
                Ok(_) => restored += 1,
                Err(e) => {
                    tracing::warn!(session_id = record.id, error = %e, "cannot recover session");
                }
            }
        }

        tracing::info!(restored, "recovered suspended sessions");
        Ok(restored)
    }

    /// Stored records matching the filter, with live state overlaid. Records
    /// the caller may not read are left out.
    pub async fn find(
        &self,
        who: &Identity,
        filter: &SessionFilter,
    ) -> Result<Vec<SessionRecord>, ServiceError> {
        if !self.access.can_search_sessions(who) {
            return Err(ServiceError::NotAllowed("search sessions"));
        }

        let mut found = Vec::new();
        for mut record in self.repo.search_sessions(filter).await? {
            if !self.access.can_read_session(who, &record) {
                continue;
            }
            if let Some(live) = self.live(record.id).await {
                live.snapshot().await.apply_to(&mut record);
            }
            found.push(record);
        }
        Ok(found)
    }

    pub async fn find_by_id(
        &self,
        who: &Identity,
        session_id: SessionId,
    ) -> Result<SessionRecord, ServiceError> {
        let record = self.record(session_id).await?;
        if !self.access.can_read_session(who, &record) {
            return Err(ServiceError::NotAllowed("read session"));
        }
        Ok(record)
    }

    /// Cancel a session. A stored session that is not live is marked failed
    /// directly.
    pub async fn cancel(&self, who: &Identity, session_id: SessionId) -> Result<(), ServiceError> {
        let mut record = self.record(session_id).await?;
        if !self.access.can_manage_session(who, &record) {
            return Err(ServiceError::NotAllowed("cancel session"));
        }
        if record.status.is_terminal() {
            return Err(SessionError::Finished(record.status).into());
        }

        if let Some(live) = self.live(session_id).await {
            live.cancel().await;
        } else {
            record.status = SessionStatus::Failed;
            record.error = Some(crate::workflow::step::StepError::Cancelled.to_string());
            record.states.clear();
            record.joins.clear();
            record.completed_at = Some(Utc::now());
            self.repo.update_session(&record).await?;
        }

        tracing::info!(session_id, by = who.id, "session cancelled");
        Ok(())
    }

    /// Live session by ID.
    pub async fn live(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.pool.read().await.get(&session_id).cloned()
    }

    pub async fn live_count(&self) -> usize {
        self.pool.read().await.len()
    }

    /// Wait until every state change reported so far has been written.
    pub async fn flush(&self) {
        let (done, rx) = oneshot::channel();
        if self.persist_tx.send(PersistMsg::Flush(done)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Cancel the root token: every live session fails with `Cancelled` and
    /// no new session can be spawned.
    pub async fn shutdown(&self) {
        self.root.cancel();
        for session in self.pool.read().await.values() {
            session.wait().await;
        }
        self.flush().await;
    }

    /// Stored record with live state overlaid.
    async fn record(&self, session_id: SessionId) -> Result<SessionRecord, ServiceError> {
        if session_id == 0 {
            return Err(ServiceError::InvalidId);
        }
        let mut record = self
            .repo
            .lookup_session(session_id)
            .await?
            .ok_or(ServiceError::SessionNotFound(session_id))?;
        if let Some(live) = self.live(session_id).await {
            live.snapshot().await.apply_to(&mut record);
        }
        Ok(record)
    }

    /// Spawn a stored session into the pool unless another caller already
    /// did. Restorations wait on each other; the pool itself is only locked
    /// for the insert, so live sessions stay reachable meanwhile.
    async fn restore(
        &self,
        session_id: SessionId,
        def: &WorkflowDefinition,
        graph: Arc<Graph>,
    ) -> Result<Arc<Session>, ServiceError> {
        let _restoring = self.restoring.lock().await;
        if let Some(live) = self.live(session_id).await {
            return Ok(live);
        }

        // Re-read: the session may have finished while the graph resolved.
        let record = self
            .repo
            .lookup_session(session_id)
            .await?
            .ok_or(ServiceError::SessionNotFound(session_id))?;
        if record.status.is_terminal() {
            return Err(SessionError::Finished(record.status).into());
        }

        let snapshot = SessionSnapshot::from_record(&record);
        let session = self
            .spawn(session_id, graph, self.options(def, false), Some(snapshot))
            .await?;
        let session = Arc::clone(self.pool.write().await.entry(session_id).or_insert(session));
        tracing::info!(session_id, "session restored");
        Ok(session)
    }

    fn options(&self, def: &WorkflowDefinition, trace: bool) -> SessionOptions {
        let keep_secs = if def.keep_sessions_secs > 0 {
            def.keep_sessions_secs
        } else {
            self.config.keep_sessions_secs
        };

        let persist_tx = self.persist_tx.downgrade();
        let handler: StateChangeHandler = Arc::new(move |change, snapshot| {
            tracing::debug!(session_id = snapshot.id, ?change, "session state changed");
            if let Some(tx) = persist_tx.upgrade() {
                let _ = tx.send(PersistMsg::Snapshot {
                    snapshot,
                    keep_secs,
                });
            }
        });

        SessionOptions::from_config(&self.config)
            .with_ids(Arc::clone(&self.ids))
            .with_trace(self.config.trace || def.trace || trace)
            .with_scope(def.scope.clone())
            .with_handler(handler)
    }

    async fn spawn(
        &self,
        id: SessionId,
        graph: Arc<Graph>,
        options: SessionOptions,
        restore: Option<SessionSnapshot>,
    ) -> Result<Arc<Session>, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.spawn_tx
            .send(SpawnRequest {
                id,
                graph,
                options,
                restore,
                reply,
            })
            .await
            .map_err(|_| ServiceError::PoolClosed)?;
        let session = rx.await.map_err(|_| ServiceError::PoolClosed)??;
        Ok(session)
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn coordinate(mut requests: mpsc::Receiver<SpawnRequest>, root: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = root.cancelled() => break,
            req = requests.recv() => {
                let Some(req) = req else { break };
                let options = req.options.with_parent_cancel(&root);
                let session = match req.restore {
                    Some(snapshot) => Session::restore(req.graph, snapshot, options),
                    None => Ok(Session::new(req.id, req.graph, options)),
                };
                let _ = req.reply.send(session.map(Arc::new));
            }
        }
    }
    tracing::debug!("session coordinator stopped");
}

async fn persist<R: SessionRepository>(
    repo: Arc<R>,
    pool: Pool,
    mut messages: mpsc::UnboundedReceiver<PersistMsg>,
) {
    while let Some(msg) = messages.recv().await {
        match msg {
            PersistMsg::Snapshot {
                snapshot,
                keep_secs,
            } => {
                let id = snapshot.id;
                if let Err(e) = store(repo.as_ref(), &snapshot, keep_secs).await {
                    tracing::error!(session_id = id, error = %e, "failed to persist session");
                }
                if snapshot.status.is_terminal() {
                    pool.write().await.remove(&id);
                }
            }
            PersistMsg::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("session persister stopped");
}

async fn store<R: SessionRepository>(
    repo: &R,
    snapshot: &SessionSnapshot,
    keep_secs: u64,
) -> Result<(), ServiceError> {
    let mut record = repo
        .lookup_session(snapshot.id)
        .await?
        .ok_or(ServiceError::SessionNotFound(snapshot.id))?;
    snapshot.apply_to(&mut record);
    if keep_secs > 0 {
        if let Some(done) = record.completed_at {
            record.purge_at = i64::try_from(keep_secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .and_then(|keep| done.checked_add_signed(keep));
        }
    }
    repo.update_session(&record).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::jexl::JexlParser;
    use crate::function::FunctionRegistry;
    use crate::repository::memory::MemoryRepository;
    use crate::service::access::{AllowAll, OwnerOnly};
    use crate::workflow::compiler::compile;
    use crate::workflow::step::StepError;
    use wayflow_types::workflow::{ExprDef, WorkflowPath, WorkflowStep, WorkflowStepKind};

    struct Fixed(WorkflowDefinition, Arc<Graph>);

    impl WorkflowSource for Fixed {
        async fn resolve(
            &self,
            workflow_id: WorkflowId,
        ) -> Result<(WorkflowDefinition, Arc<Graph>), ServiceError> {
            if workflow_id != self.0.id {
                return Err(ServiceError::WorkflowNotFound(workflow_id));
            }
            Ok((self.0.clone(), Arc::clone(&self.1)))
        }
    }

    /// Resolves like `Fixed`, but only after `delay`.
    struct Slow(Fixed, std::time::Duration);

    impl WorkflowSource for Slow {
        async fn resolve(
            &self,
            workflow_id: WorkflowId,
        ) -> Result<(WorkflowDefinition, Arc<Graph>), ServiceError> {
            tokio::time::sleep(self.1).await;
            self.0.resolve(workflow_id).await
        }
    }

    fn approval() -> Fixed {
        let mut def = WorkflowDefinition::new("approval");
        def.id = 1;
        def.owned_by = 7;
        def.scope = Scope::new().with("greeting", "hi");
        let mut prompt = WorkflowStep::new(1, WorkflowStepKind::Prompt, "approve");
        prompt.required = vec!["approved".into()];
        def.steps = vec![
            prompt,
            WorkflowStep::new(2, WorkflowStepKind::Expressions, "")
                .with_arguments(vec![ExprDef::new("outcome", "greeting + '!'")]),
        ];
        def.paths = vec![WorkflowPath::new(1, 2)];
        let graph = compile(&def, &JexlParser, &FunctionRegistry::new()).unwrap();
        Fixed(def, Arc::new(graph))
    }

    fn config() -> EngineConfig {
        EngineConfig {
            worker_interval_ms: 1,
            ..Default::default()
        }
    }

    fn service<A: AccessControl>(
        repo: &Arc<MemoryRepository>,
        access: A,
    ) -> SessionService<MemoryRepository, A> {
        SessionService::new(
            Arc::clone(repo),
            Arc::new(access),
            config(),
            Arc::new(IdGenerator::new()),
        )
    }

    fn params(wait: bool) -> SessionStartParams {
        SessionStartParams {
            workflow_id: 1,
            invoker: Identity::new(7, "ann"),
            wait,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_persists_suspension_and_resume_completes() {
        let repo = Arc::new(MemoryRepository::new());
        let svc = service(&repo, AllowAll);
        let src = approval();

        let session = svc.start(&src.0, Arc::clone(&src.1), params(true)).await.unwrap();
        svc.flush().await;

        let stored = repo.lookup_session(session.id()).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Suspended);
        assert_eq!(stored.states.len(), 1);
        assert_eq!(stored.created_by, 7);

        let state_id = stored.states[0].state_id;
        let who = Identity::new(7, "ann");
        let resumed = svc
            .resume(&who, session.id(), state_id, Scope::new().with("approved", true), &src)
            .await
            .unwrap();
        resumed.wait().await;
        svc.flush().await;

        let stored = repo.lookup_session(session.id()).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert_eq!(stored.result.string_or("outcome", ""), "hi!");
        assert!(stored.states.is_empty());
        assert_eq!(svc.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_resume_restores_session_after_restart() {
        let repo = Arc::new(MemoryRepository::new());
        let src = approval();
        let who = Identity::new(7, "ann");

        let (session_id, state_id) = {
            let first = service(&repo, AllowAll);
            let session = first.start(&src.0, Arc::clone(&src.1), params(true)).await.unwrap();
            first.flush().await;
            let pending = session.pending_inputs().await;
            (session.id(), pending[0].state_id)
        };

        let second = service(&repo, AllowAll);
        assert!(second.live(session_id).await.is_none());
        let session = second
            .resume(&who, session_id, state_id, Scope::new().with("approved", true), &src)
            .await
            .unwrap();
        session.wait().await;

        assert_eq!(session.status().await, SessionStatus::Completed);
        let result = session.result().await.unwrap();
        assert_eq!(result.string_or("outcome", ""), "hi!");
    }

    #[tokio::test]
    async fn test_recover_restores_suspended_sessions() {
        let repo = Arc::new(MemoryRepository::new());
        let src = approval();
        {
            let first = service(&repo, AllowAll);
            first.start(&src.0, Arc::clone(&src.1), params(true)).await.unwrap();
            first.flush().await;
        }

        let second = service(&repo, AllowAll);
        assert_eq!(second.recover(&src).await.unwrap(), 1);
        assert_eq!(second.live_count().await, 1);
        assert_eq!(second.recover(&src).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_slow_restore_does_not_block_live_sessions() {
        let repo = Arc::new(MemoryRepository::new());
        let who = Identity::new(7, "ann");

        let (stored_id, state_id) = {
            let first = service(&repo, AllowAll);
            let src = approval();
            let session = first.start(&src.0, Arc::clone(&src.1), params(true)).await.unwrap();
            first.flush().await;
            (session.id(), session.pending_inputs().await[0].state_id)
        };

        let ids = Arc::new(IdGenerator::new());
        ids.observe(stored_id);
        let svc = Arc::new(SessionService::new(
            Arc::clone(&repo),
            Arc::new(AllowAll),
            config(),
            ids,
        ));
        let src = approval();
        let live = svc.start(&src.0, Arc::clone(&src.1), params(true)).await.unwrap();

        let slow = Slow(approval(), std::time::Duration::from_millis(500));
        let restoring = {
            let svc = Arc::clone(&svc);
            let who = who.clone();
            tokio::spawn(async move {
                svc.resume(&who, stored_id, state_id, Scope::new().with("approved", true), &slow)
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let found = tokio::time::timeout(std::time::Duration::from_millis(200), svc.live(live.id()))
            .await
            .expect("pool blocked while a session was being restored");
        assert!(found.is_some());

        let restored = restoring.await.unwrap().unwrap();
        restored.wait().await;
        assert_eq!(restored.status().await, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_concurrent_resumes_share_one_restored_session() {
        let repo = Arc::new(MemoryRepository::new());
        let who = Identity::new(7, "ann");

        let (stored_id, state_id) = {
            let first = service(&repo, AllowAll);
            let src = approval();
            let session = first.start(&src.0, Arc::clone(&src.1), params(true)).await.unwrap();
            first.flush().await;
            (session.id(), session.pending_inputs().await[0].state_id)
        };

        let svc = service(&repo, AllowAll);
        let a = Slow(approval(), std::time::Duration::from_millis(100));
        let b = Slow(approval(), std::time::Duration::from_millis(100));
        let input = || Scope::new().with("approved", true);
        let (first, second) = tokio::join!(
            svc.resume(&who, stored_id, state_id, input(), &a),
            svc.resume(&who, stored_id, state_id, input(), &b),
        );

        // Both callers reach the same session, so the state is consumed once.
        let (won, lost) = match (first, second) {
            (Ok(s), Err(e)) | (Err(e), Ok(s)) => (s, e),
            other => panic!("expected exactly one resume to succeed: {other:?}"),
        };
        assert!(matches!(
            lost,
            ServiceError::Session(SessionError::StateNotFound(_) | SessionError::Finished(_))
        ));
        won.wait().await;
        assert_eq!(won.status().await, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_start_rejects_ambiguous_orphans() {
        let repo = Arc::new(MemoryRepository::new());
        let svc = service(&repo, AllowAll);

        let mut def = WorkflowDefinition::new("two");
        def.id = 2;
        def.steps = vec![
            WorkflowStep::new(1, WorkflowStepKind::Expressions, "")
                .with_arguments(vec![ExprDef::new("a", "1")]),
            WorkflowStep::new(2, WorkflowStepKind::Expressions, "")
                .with_arguments(vec![ExprDef::new("b", "2")]),
        ];
        let graph = Arc::new(compile(&def, &JexlParser, &FunctionRegistry::new()).unwrap());

        let err = svc.start(&def, Arc::clone(&graph), params(true)).await.unwrap_err();
        assert!(matches!(err, ServiceError::AmbiguousStartStep(ids) if ids.len() == 2));

        let explicit = SessionStartParams {
            step_id: 2,
            ..params(true)
        };
        let session = svc.start(&def, graph, explicit).await.unwrap();
        let result = session.result().await.unwrap();
        assert!(result.has(&["b"]));
        assert!(!result.has(&["a"]));
    }

    #[tokio::test]
    async fn test_start_checks_access_and_enabled() {
        let repo = Arc::new(MemoryRepository::new());
        let svc = service(&repo, OwnerOnly);
        let src = approval();

        let stranger = SessionStartParams {
            invoker: Identity::new(8, "bob"),
            ..params(true)
        };
        assert!(matches!(
            svc.start(&src.0, Arc::clone(&src.1), stranger).await,
            Err(ServiceError::NotAllowed(_))
        ));

        let mut disabled = src.0.clone();
        disabled.enabled = false;
        assert!(matches!(
            svc.start(&disabled, Arc::clone(&src.1), params(true)).await,
            Err(ServiceError::WorkflowDisabled(1))
        ));
    }

    #[tokio::test]
    async fn test_cancel_live_and_stored_sessions() {
        let repo = Arc::new(MemoryRepository::new());
        let src = approval();
        let who = Identity::new(7, "ann");

        let svc = service(&repo, AllowAll);
        let live = svc.start(&src.0, Arc::clone(&src.1), params(true)).await.unwrap();
        svc.cancel(&who, live.id()).await.unwrap();
        assert_eq!(live.error().await, Some(StepError::Cancelled));
        svc.flush().await;
        let stored = repo.lookup_session(live.id()).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Failed);

        let stored_only = {
            let other = service(&repo, AllowAll);
            let s = other.start(&src.0, Arc::clone(&src.1), params(true)).await.unwrap();
            other.flush().await;
            s.id()
        };
        svc.cancel(&who, stored_only).await.unwrap();
        let stored = repo.lookup_session(stored_only).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("session cancelled"));

        assert!(matches!(
            svc.cancel(&who, stored_only).await,
            Err(ServiceError::Session(SessionError::Finished(SessionStatus::Failed)))
        ));
    }

    #[tokio::test]
    async fn test_find_filters_unreadable_sessions() {
        let repo = Arc::new(MemoryRepository::new());
        let svc = service(&repo, OwnerOnly);
        let src = approval();
        svc.start(&src.0, Arc::clone(&src.1), params(true)).await.unwrap();

        let owner = Identity::new(7, "ann");
        let stranger = Identity::new(8, "bob");
        let filter = SessionFilter::default();
        assert_eq!(svc.find(&owner, &filter).await.unwrap().len(), 1);
        assert!(svc.find(&stranger, &filter).await.unwrap().is_empty());

        assert!(matches!(
            svc.find_by_id(&owner, 0).await,
            Err(ServiceError::InvalidId)
        ));
        assert!(matches!(
            svc.find_by_id(&owner, 12345).await,
            Err(ServiceError::SessionNotFound(12345))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_pool() {
        let repo = Arc::new(MemoryRepository::new());
        let svc = service(&repo, AllowAll);
        let src = approval();
        svc.shutdown().await;

        assert!(matches!(
            svc.start(&src.0, Arc::clone(&src.1), params(true)).await,
            Err(ServiceError::PoolClosed)
        ));
    }
}
