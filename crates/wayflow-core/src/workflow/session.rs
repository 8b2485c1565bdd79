//! Session scheduler.
//!
//! A [`Session`] owns one run of a [`Graph`]. Every step invocation is a
//! [`State`]; ready states are spawned as tokio tasks (bounded by a
//! semaphore), and each response is folded back into the session under a
//! single `RwLock`. States parked on a timer are released by a background
//! ticker; states parked on input wait for [`Session::resume`].
//!
//! Lifecycle: `new` -> `running` <-> `suspended` -> `completed` | `failed`.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use wayflow_types::config::EngineConfig;
use wayflow_types::scope::Scope;
use wayflow_types::session::{
    JoinProgress, PendingInput, SessionId, SessionRecord, SessionStatus, SessionTraceStep,
    StateId, SuspendedState, TraceOutcome,
};
use wayflow_types::workflow::StepId;

use super::gateway::JoinState;
use super::graph::Graph;
use super::step::{ExecRequest, ExecResponse, StepError, Suspend};
use crate::id::IdGenerator;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("step {0} not found in graph")]
    StepNotFound(StepId),

    #[error("session already started (status: {0})")]
    AlreadyStarted(SessionStatus),

    #[error("state {0} not found or not waiting for input")]
    StateNotFound(StateId),

    #[error("session is {0}")]
    Finished(SessionStatus),

    #[error("session cannot be restored from status {0}")]
    NotRestorable(SessionStatus),
}

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// Transition reported to the state-change handler.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    /// A single step parked itself (timer or input).
    StepSuspended {
        state_id: StateId,
        step_id: StepId,
        resume_at: Option<DateTime<Utc>>,
    },
    /// Nothing in flight, at least one state parked.
    Suspended,
    Completed,
    Failed,
}

/// Point-in-time copy of everything needed to persist or restore a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub status: SessionStatus,
    pub scope: Scope,
    pub result: Scope,
    pub error: Option<String>,
    pub states: Vec<SuspendedState>,
    pub joins: Vec<JoinProgress>,
    pub trace: Vec<SessionTraceStep>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    /// Copy the live fields onto a stored record.
    pub fn apply_to(&self, record: &mut SessionRecord) {
        record.status = self.status;
        record.output = self.scope.clone();
        record.result = self.result.clone();
        record.error = self.error.clone();
        record.states = self.states.clone();
        record.joins = self.joins.clone();
        record.trace = self.trace.clone();
        record.suspended_at = self.suspended_at;
        record.completed_at = self.completed_at;
    }

    pub fn from_record(record: &SessionRecord) -> Self {
        Self {
            id: record.id,
            status: record.status,
            scope: record.output.clone(),
            result: record.result.clone(),
            error: record.error.clone(),
            states: record.states.clone(),
            joins: record.joins.clone(),
            trace: record.trace.clone(),
            suspended_at: record.suspended_at,
            completed_at: record.completed_at,
        }
    }
}

/// Called on every [`StateChange`] while the session lock is held; must not
/// block.
pub type StateChangeHandler = Arc<dyn Fn(StateChange, SessionSnapshot) + Send + Sync>;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SessionOptions {
    /// How often parked timers are checked.
    pub worker_interval: Duration,
    /// Steps of this session executing at the same time.
    pub max_workers: usize,
    pub trace: bool,
    /// Cancelling this token cancels the session.
    pub cancel: CancellationToken,
    pub on_change: Option<StateChangeHandler>,
    pub ids: Arc<IdGenerator>,
    /// Variables every branch starts with.
    pub scope: Scope,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl SessionOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            worker_interval: config.worker_interval(),
            max_workers: config.max_workers.max(1),
            trace: config.trace,
            cancel: CancellationToken::new(),
            on_change: None,
            ids: Arc::new(IdGenerator::new()),
            scope: Scope::new(),
        }
    }

    pub fn with_worker_interval(mut self, interval: Duration) -> Self {
        self.worker_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max.max(1);
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Run under a child of `parent`.
    pub fn with_parent_cancel(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn with_handler(mut self, handler: StateChangeHandler) -> Self {
        self.on_change = Some(handler);
        self
    }

    pub fn with_ids(mut self, ids: Arc<IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("worker_interval", &self.worker_interval)
            .field("max_workers", &self.max_workers)
            .field("trace", &self.trace)
            .field("on_change", &self.on_change.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// One invocation of a step.
#[derive(Debug)]
pub struct State {
    pub id: StateId,
    pub step_id: StepId,
    pub created_at: DateTime<Utc>,
    /// Arrival buffer; join steps only.
    pub join: Option<Arc<JoinState>>,
}

/// A state ready to run (or parked), with the data it runs on.
#[derive(Debug, Clone)]
struct Activation {
    state: Arc<State>,
    parent: StepId,
    scope: Scope,
    input: Scope,
    resumed: bool,
}

impl Activation {
    fn suspended(&self, resume_at: Option<DateTime<Utc>>) -> SuspendedState {
        SuspendedState {
            state_id: self.state.id,
            step_id: self.state.step_id,
            parent_id: self.parent,
            created_at: self.state.created_at,
            scope: self.scope.clone(),
            input: self.input.clone(),
            resume_at,
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    status: SessionStatus,
    /// Union of every step output, in completion order.
    scope: Scope,
    /// Merged branch scopes of terminal steps.
    result: Scope,
    error: Option<StepError>,
    in_flight: usize,
    joins: HashMap<StepId, Arc<State>>,
    waiting: BTreeMap<StateId, Activation>,
    delayed: BTreeMap<StateId, (DateTime<Utc>, Activation)>,
    trace: Vec<SessionTraceStep>,
    suspended_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One run of a compiled graph.
pub struct Session {
    shared: Arc<Shared>,
}

struct Shared {
    id: SessionId,
    graph: Arc<Graph>,
    options: SessionOptions,
    workers: Arc<Semaphore>,
    state: RwLock<SessionState>,
    /// Number of states queued or executing.
    in_flight: watch::Sender<usize>,
    driver_started: AtomicBool,
}

impl Session {
    pub fn new(id: SessionId, graph: Arc<Graph>, options: SessionOptions) -> Self {
        Self::with_state(id, graph, options, SessionState::default())
    }

    fn with_state(
        id: SessionId,
        graph: Arc<Graph>,
        options: SessionOptions,
        state: SessionState,
    ) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                id,
                graph,
                workers: Arc::new(Semaphore::new(options.max_workers.max(1))),
                options,
                state: RwLock::new(state),
                in_flight,
                driver_started: AtomicBool::new(false),
            }),
        }
    }

    /// Rebuild a suspended session from a snapshot (e.g. after a restart).
    ///
    /// Parked timers are picked up by the ticker, which is started here, so
    /// this must be called from within a tokio runtime.
    pub fn restore(
        graph: Arc<Graph>,
        snapshot: SessionSnapshot,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        if snapshot.status != SessionStatus::Suspended {
            return Err(SessionError::NotRestorable(snapshot.status));
        }

        let mut state = SessionState {
            status: SessionStatus::Suspended,
            scope: snapshot.scope,
            result: snapshot.result,
            trace: snapshot.trace,
            suspended_at: snapshot.suspended_at,
            ..Default::default()
        };

        for join in snapshot.joins {
            options.ids.observe(join.state_id);
            state.joins.insert(
                join.step_id,
                Arc::new(State {
                    id: join.state_id,
                    step_id: join.step_id,
                    created_at: join.created_at,
                    join: Some(Arc::new(JoinState::with_arrivals(join.arrived))),
                }),
            );
        }

        for parked in snapshot.states {
            if !graph.contains(parked.step_id) {
                return Err(SessionError::StepNotFound(parked.step_id));
            }
            options.ids.observe(parked.state_id);
            let activation = Activation {
                state: Arc::new(State {
                    id: parked.state_id,
                    step_id: parked.step_id,
                    created_at: parked.created_at,
                    join: None,
                }),
                parent: parked.parent_id,
                scope: parked.scope,
                input: parked.input,
                resumed: true,
            };
            match parked.resume_at {
                Some(at) => {
                    state.delayed.insert(parked.state_id, (at, activation));
                }
                None => {
                    state.waiting.insert(parked.state_id, activation);
                }
            }
        }

        let session = Self::with_state(snapshot.id, graph, options, state);
        session.start_driver();
        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.shared.graph
    }

    /// Start executing at `step_id` with `input`. Returns once the first
    /// state is queued.
    pub async fn exec(&self, step_id: StepId, input: Scope) -> Result<(), SessionError> {
        let shared = &self.shared;
        if !shared.graph.contains(step_id) {
            return Err(SessionError::StepNotFound(step_id));
        }

        let activation = {
            let mut st = shared.state.write().await;
            if st.status != SessionStatus::New {
                return Err(SessionError::AlreadyStarted(st.status));
            }
            st.status = SessionStatus::Running;

            let activation = shared.activation(
                &mut st,
                step_id,
                0,
                shared.options.scope.clone(),
                input,
            )?;
            st.in_flight += 1;
            shared.in_flight.send_replace(st.in_flight);
            activation
        };

        tracing::info!(
            session_id = shared.id,
            step_id,
            steps = shared.graph.len(),
            "session started"
        );

        self.start_driver();
        Shared::schedule(shared, activation);
        Ok(())
    }

    /// Supply input to a state that is waiting for it.
    pub async fn resume(&self, state_id: StateId, input: Scope) -> Result<(), SessionError> {
        let shared = &self.shared;
        let activation = {
            let mut st = shared.state.write().await;
            if st.status.is_terminal() {
                return Err(SessionError::Finished(st.status));
            }

            let mut activation = st
                .waiting
                .remove(&state_id)
                .ok_or(SessionError::StateNotFound(state_id))?;
            activation.input = input;
            activation.resumed = true;

            st.status = SessionStatus::Running;
            st.in_flight += 1;
            shared.in_flight.send_replace(st.in_flight);
            activation
        };

        tracing::debug!(
            session_id = shared.id,
            state_id,
            step_id = activation.state.step_id,
            "resuming state"
        );

        self.start_driver();
        Shared::schedule(shared, activation);
        Ok(())
    }

    /// Stop the session: in-flight steps observe the cancellation, nothing
    /// new is scheduled, and the session fails with `Cancelled`.
    pub async fn cancel(&self) {
        self.shared.options.cancel.cancel();
        self.shared.abort(StepError::Cancelled).await;
    }

    /// Wait until no state is queued or executing.
    pub async fn wait(&self) {
        let mut rx = self.shared.in_flight.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub fn idle(&self) -> bool {
        *self.shared.in_flight.borrow() == 0
    }

    pub async fn status(&self) -> SessionStatus {
        self.shared.state.read().await.status
    }

    pub async fn suspended(&self) -> bool {
        self.status().await == SessionStatus::Suspended
    }

    /// Final scope; only set once the session completed.
    pub async fn result(&self) -> Option<Scope> {
        let st = self.shared.state.read().await;
        (st.status == SessionStatus::Completed).then(|| st.result.clone())
    }

    pub async fn error(&self) -> Option<StepError> {
        self.shared.state.read().await.error.clone()
    }

    /// Union of every step output so far.
    pub async fn scope(&self) -> Scope {
        self.shared.state.read().await.scope.clone()
    }

    pub async fn pending_inputs(&self) -> Vec<PendingInput> {
        let st = self.shared.state.read().await;
        st.waiting
            .values()
            .map(|a| PendingInput {
                session_id: self.shared.id,
                state_id: a.state.id,
                step_id: a.state.step_id,
                created_at: a.state.created_at,
            })
            .collect()
    }

    pub async fn trace(&self) -> Vec<SessionTraceStep> {
        self.shared.state.read().await.trace.clone()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let st = self.shared.state.read().await;
        self.shared.snapshot_of(&st)
    }

    fn start_driver(&self) {
        if self.shared.driver_started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(drive(
            Arc::downgrade(&self.shared),
            self.shared.options.cancel.clone(),
            self.shared.options.worker_interval,
        ));
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("steps", &self.shared.graph.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

impl Shared {
    /// New activation of `step_id`. Join steps share one state per session
    /// until they produce a result.
    fn activation(
        &self,
        st: &mut SessionState,
        step_id: StepId,
        parent: StepId,
        scope: Scope,
        input: Scope,
    ) -> Result<Activation, SessionError> {
        let step = self
            .graph
            .step_by_id(step_id)
            .ok_or(SessionError::StepNotFound(step_id))?;

        let state = if step.is_join() {
            Arc::clone(st.joins.entry(step_id).or_insert_with(|| {
                Arc::new(State {
                    id: self.options.ids.next(),
                    step_id,
                    created_at: Utc::now(),
                    join: Some(Arc::new(JoinState::new())),
                })
            }))
        } else {
            Arc::new(State {
                id: self.options.ids.next(),
                step_id,
                created_at: Utc::now(),
                join: None,
            })
        };

        Ok(Activation {
            state,
            parent,
            scope,
            input,
            resumed: false,
        })
    }

    fn schedule(shared: &Arc<Self>, activation: Activation) {
        tokio::spawn(Arc::clone(shared).run(activation));
    }

    async fn run(self: Arc<Self>, activation: Activation) {
        let started_at = Utc::now();

        let permit = match Arc::clone(&self.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                let err = StepError::Internal(format!("worker pool closed: {e}"));
                self.complete(activation, Err(err), started_at).await;
                return;
            }
        };

        if self.options.cancel.is_cancelled() {
            drop(permit);
            self.complete(activation, Err(StepError::Cancelled), started_at)
                .await;
            return;
        }

        let step_id = activation.state.step_id;
        let Some(step) = self.graph.step_by_id(step_id) else {
            drop(permit);
            self.complete(activation, Err(StepError::UnknownStep(step_id)), started_at)
                .await;
            return;
        };

        let req = ExecRequest {
            session_id: self.id,
            state_id: activation.state.id,
            step_id,
            parent: activation.parent,
            scope: activation.scope.clone(),
            input: activation.input.clone(),
            children: self.graph.children(step_id),
            started_at: activation.state.created_at,
            resumed: activation.resumed,
            cancel: self.options.cancel.clone(),
            join: activation.state.join.clone(),
        };

        tracing::debug!(
            session_id = self.id,
            state_id = req.state_id,
            step_id,
            kind = step.kind_name(),
            "executing step"
        );

        // Separate task so a panicking step fails the session, not the worker.
        let cancel = self.options.cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StepError::Cancelled),
                res = step.exec(&req) => res,
            }
        });

        let outcome = match task.await {
            Ok(res) => res,
            Err(e) if e.is_panic() => Err(StepError::Panicked(panic_message(e.into_panic()))),
            Err(e) => Err(StepError::Internal(format!("task join error: {e}"))),
        };
        drop(permit);

        self.complete(activation, outcome, started_at).await;
    }

    /// Fold one step response into the session.
    async fn complete(
        self: &Arc<Self>,
        activation: Activation,
        outcome: Result<ExecResponse, StepError>,
        started_at: DateTime<Utc>,
    ) {
        let state_id = activation.state.id;
        let step_id = activation.state.step_id;
        let mut changes = Vec::new();

        let spawn = {
            let mut st = self.state.write().await;
            st.in_flight = st.in_flight.saturating_sub(1);
            let mut spawn = Vec::new();

            if st.status.is_terminal() {
                tracing::warn!(
                    session_id = self.id,
                    state_id,
                    step_id,
                    status = %st.status,
                    "discarding step outcome"
                );
            } else {
                match self.apply(&mut st, &activation, outcome, started_at, &mut spawn) {
                    Ok(Some(change)) => changes.push(change),
                    Ok(None) => {}
                    Err(err) => {
                        spawn.clear();
                        self.record(&mut st, &activation, started_at, TraceOutcome::Failed, Some(&err));
                        changes.push(self.fail(&mut st, err));
                    }
                }
            }

            st.in_flight += spawn.len();
            if let Some(change) = self.settle(&mut st) {
                changes.push(change);
            }
            self.notify(&st, changes);
            self.in_flight.send_replace(st.in_flight);
            spawn
        };

        for next in spawn {
            Shared::schedule(self, next);
        }
    }

    /// Report changes while the lock is held, so handlers observe snapshots
    /// in the order the session produced them.
    fn notify(&self, st: &SessionState, changes: Vec<StateChange>) {
        let Some(handler) = &self.options.on_change else {
            return;
        };
        if changes.is_empty() {
            return;
        }
        let snapshot = self.snapshot_of(st);
        for change in changes {
            handler(change, snapshot.clone());
        }
    }

    fn apply(
        &self,
        st: &mut SessionState,
        activation: &Activation,
        outcome: Result<ExecResponse, StepError>,
        started_at: DateTime<Utc>,
        spawn: &mut Vec<Activation>,
    ) -> Result<Option<StateChange>, StepError> {
        let state_id = activation.state.id;
        let step_id = activation.state.step_id;

        match outcome? {
            ExecResponse::Result(out) => {
                st.scope = st.scope.merge([&out]);
                if activation.state.join.is_some() {
                    st.joins.remove(&step_id);
                }

                let branch = activation.scope.merge([&activation.input, &out]);
                let children = self.graph.children(step_id);
                if children.is_empty() {
                    st.result = st.result.merge([&branch]);
                }
                for child in children {
                    spawn.push(
                        self.activation(st, child, step_id, branch.clone(), out.clone())
                            .map_err(|_| StepError::UnknownStep(child))?,
                    );
                }

                self.record(st, activation, started_at, TraceOutcome::Result, None);
                Ok(None)
            }

            ExecResponse::Partial => {
                self.record(st, activation, started_at, TraceOutcome::Partial, None);
                Ok(None)
            }

            ExecResponse::Suspend(Suspend::Input) => {
                tracing::debug!(session_id = self.id, state_id, step_id, "waiting for input");
                st.waiting.insert(state_id, activation.clone());
                self.record(st, activation, started_at, TraceOutcome::SuspendedForInput, None);
                Ok(Some(StateChange::StepSuspended {
                    state_id,
                    step_id,
                    resume_at: None,
                }))
            }

            ExecResponse::Suspend(Suspend::Until(at)) => {
                tracing::debug!(session_id = self.id, state_id, step_id, until = %at, "delayed");
                let mut parked = activation.clone();
                parked.resumed = true;
                st.delayed.insert(state_id, (at, parked));
                self.record(st, activation, started_at, TraceOutcome::SuspendedUntil, None);
                Ok(Some(StateChange::StepSuspended {
                    state_id,
                    step_id,
                    resume_at: Some(at),
                }))
            }

            ExecResponse::Next(next) => {
                self.branch_into(st, activation, next, spawn)?;
                self.record(st, activation, started_at, TraceOutcome::Next, None);
                Ok(None)
            }

            ExecResponse::Step(next) => {
                self.branch_into(st, activation, vec![next], spawn)?;
                self.record(st, activation, started_at, TraceOutcome::Next, None);
                Ok(None)
            }
        }
    }

    /// Continue into explicitly chosen steps, passing the input through.
    fn branch_into(
        &self,
        st: &mut SessionState,
        activation: &Activation,
        next: Vec<StepId>,
        spawn: &mut Vec<Activation>,
    ) -> Result<(), StepError> {
        let step_id = activation.state.step_id;
        let scope = activation.scope.merge([&activation.input]);
        for child in next {
            spawn.push(
                self.activation(st, child, step_id, scope.clone(), activation.input.clone())
                    .map_err(|_| StepError::UnknownStep(child))?,
            );
        }
        Ok(())
    }

    /// Recompute the non-terminal status after a change.
    fn settle(&self, st: &mut SessionState) -> Option<StateChange> {
        if st.status.is_terminal() {
            return None;
        }

        if st.in_flight > 0 {
            st.status = SessionStatus::Running;
            return None;
        }

        if !st.waiting.is_empty() || !st.delayed.is_empty() {
            if st.status == SessionStatus::Suspended {
                return None;
            }
            st.status = SessionStatus::Suspended;
            st.suspended_at = Some(Utc::now());
            tracing::debug!(
                session_id = self.id,
                waiting = st.waiting.len(),
                delayed = st.delayed.len(),
                "session suspended"
            );
            return Some(StateChange::Suspended);
        }

        if !st.joins.is_empty() {
            tracing::warn!(
                session_id = self.id,
                joins = st.joins.len(),
                "session completed with unfinished joins"
            );
        }

        st.status = SessionStatus::Completed;
        st.completed_at = Some(Utc::now());
        tracing::info!(session_id = self.id, "session completed");
        Some(StateChange::Completed)
    }

    fn fail(&self, st: &mut SessionState, err: StepError) -> StateChange {
        tracing::warn!(session_id = self.id, error = %err, "session failed");
        st.status = SessionStatus::Failed;
        st.error = Some(err);
        st.completed_at = Some(Utc::now());
        st.waiting.clear();
        st.delayed.clear();
        st.joins.clear();
        StateChange::Failed
    }

    /// Fail the session from outside a step (cancellation).
    async fn abort(&self, err: StepError) {
        let mut st = self.state.write().await;
        if st.status.is_terminal() {
            return;
        }
        let change = self.fail(&mut st, err);
        self.notify(&st, vec![change]);
    }

    /// Re-queue parked timers whose moment has come. Returns false once the
    /// session is finished and the ticker can stop.
    async fn release_due(self: &Arc<Self>) -> bool {
        let due = {
            let mut st = self.state.write().await;
            if st.status.is_terminal() {
                return false;
            }

            let now = Utc::now();
            let ids: Vec<StateId> = st
                .delayed
                .iter()
                .filter(|(_, (at, _))| *at <= now)
                .map(|(id, _)| *id)
                .collect();

            let due: Vec<Activation> = ids
                .into_iter()
                .filter_map(|id| st.delayed.remove(&id).map(|(_, a)| a))
                .collect();

            if !due.is_empty() {
                st.in_flight += due.len();
                st.status = SessionStatus::Running;
                self.in_flight.send_replace(st.in_flight);
            }
            due
        };

        for activation in due {
            tracing::debug!(
                session_id = self.id,
                state_id = activation.state.id,
                "delay elapsed"
            );
            Shared::schedule(self, activation);
        }
        true
    }

    fn record(
        &self,
        st: &mut SessionState,
        activation: &Activation,
        started_at: DateTime<Utc>,
        outcome: TraceOutcome,
        error: Option<&StepError>,
    ) {
        if !self.options.trace {
            return;
        }
        st.trace.push(SessionTraceStep {
            state_id: activation.state.id,
            step_id: activation.state.step_id,
            parent_id: activation.parent,
            started_at,
            finished_at: Utc::now(),
            outcome,
            error: error.map(ToString::to_string),
        });
    }

    fn snapshot_of(&self, st: &SessionState) -> SessionSnapshot {
        let states = st
            .waiting
            .values()
            .map(|a| a.suspended(None))
            .chain(st.delayed.values().map(|(at, a)| a.suspended(Some(*at))))
            .collect();

        let joins = st
            .joins
            .values()
            .filter_map(|state| {
                let arrived = state.join.as_ref()?.arrivals();
                Some(JoinProgress {
                    state_id: state.id,
                    step_id: state.step_id,
                    created_at: state.created_at,
                    arrived,
                })
            })
            .collect();

        SessionSnapshot {
            id: self.id,
            status: st.status,
            scope: st.scope.clone(),
            result: st.result.clone(),
            error: st.error.as_ref().map(ToString::to_string),
            states,
            joins,
            trace: st.trace.clone(),
            suspended_at: st.suspended_at,
            completed_at: st.completed_at,
        }
    }
}

/// Background ticker: releases due timers and reacts to cancellation.
async fn drive(shared: Weak<Shared>, cancel: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Some(shared) = shared.upgrade() {
                    shared.abort(StepError::Cancelled).await;
                }
                break;
            }
            _ = ticker.tick() => {
                let Some(shared) = shared.upgrade() else { break };
                if !shared.release_due().await {
                    break;
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
