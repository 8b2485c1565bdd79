//! Session record types.
//!
//! A session is one run of a compiled workflow. These types are the
//! persisted/observable side of a session; the live scheduler lives in
//! `wayflow-core`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::Identity;
use crate::scope::Scope;
use crate::workflow::{StepId, WorkflowId};

pub type SessionId = u64;

/// Identifier of one step invocation within a session.
pub type StateId = u64;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Constructed, nothing executed yet.
    #[default]
    New,
    /// At least one step in flight.
    Running,
    /// Idle, waiting on a timer or external input.
    Suspended,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::New => "new",
            SessionStatus::Running => "running",
            SessionStatus::Suspended => "suspended",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(SessionStatus::New),
            "running" => Ok(SessionStatus::Running),
            "suspended" => Ok(SessionStatus::Suspended),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(format!("invalid session status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Trace
// ---------------------------------------------------------------------------

/// What a traced step invocation produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceOutcome {
    Result,
    Partial,
    SuspendedUntil,
    SuspendedForInput,
    Next,
    Failed,
}

/// One executed state, as recorded in the session trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTraceStep {
    pub state_id: StateId,
    pub step_id: StepId,
    /// Step that scheduled this one (0 for the start step).
    pub parent_id: StepId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: TraceOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Persisted view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub workflow_id: WorkflowId,
    pub status: SessionStatus,

    /// What started the session (e.g. `manual`, `onTimestamp`).
    #[serde(default)]
    pub event_type: String,

    #[serde(default)]
    pub resource_type: String,

    #[serde(default)]
    pub input: Scope,

    /// Accumulated scope (union of all step outputs so far).
    #[serde(default)]
    pub output: Scope,

    /// Merged scopes of the branches that reached a terminal step.
    #[serde(default)]
    pub result: Scope,

    /// States parked on a timer or on external input.
    #[serde(default)]
    pub states: Vec<SuspendedState>,

    /// Joins that have seen some, but not all, of their parents.
    #[serde(default)]
    pub joins: Vec<JoinProgress>,

    #[serde(default)]
    pub trace: Vec<SessionTraceStep>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_by: u64,
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub suspended_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// When a finished session may be removed.
    #[serde(default)]
    pub purge_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn new(id: SessionId, workflow_id: WorkflowId, input: Scope, creator: &Identity) -> Self {
        Self {
            id,
            workflow_id,
            status: SessionStatus::New,
            event_type: String::new(),
            resource_type: String::new(),
            input,
            output: Scope::new(),
            result: Scope::new(),
            states: Vec::new(),
            joins: Vec::new(),
            trace: Vec::new(),
            error: None,
            created_by: creator.id,
            created_at: Utc::now(),
            suspended_at: None,
            completed_at: None,
            purge_at: None,
        }
    }
}

/// A parked step invocation, enough to re-enqueue it after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendedState {
    pub state_id: StateId,
    pub step_id: StepId,
    #[serde(default)]
    pub parent_id: StepId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub input: Scope,
    /// Set for timer suspensions; `None` means waiting for input.
    #[serde(default)]
    pub resume_at: Option<DateTime<Utc>>,
}

impl SuspendedState {
    pub fn waits_for_input(&self) -> bool {
        self.resume_at.is_none()
    }
}

/// Branch scopes a join has collected so far, keyed by parent step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinProgress {
    pub state_id: StateId,
    pub step_id: StepId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub arrived: Vec<(StepId, Scope)>,
}

/// A state waiting for external input, addressable by `resume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInput {
    pub session_id: SessionId,
    pub state_id: StateId,
    pub step_id: StepId,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Search / start
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionFilter {
    pub workflow_id: Option<WorkflowId>,
    /// Any of these statuses; empty matches all.
    #[serde(default)]
    pub status: Vec<SessionStatus>,
    pub created_by: Option<u64>,
    pub limit: Option<usize>,
}

impl SessionFilter {
    pub fn matches(&self, record: &SessionRecord) -> bool {
        if self.workflow_id.is_some_and(|id| id != record.workflow_id) {
            return false;
        }
        if !self.status.is_empty() && !self.status.contains(&record.status) {
            return false;
        }
        if self.created_by.is_some_and(|id| id != record.created_by) {
            return false;
        }
        true
    }
}

/// Parameters for starting a new session.
#[derive(Debug, Clone, Default)]
pub struct SessionStartParams {
    pub workflow_id: WorkflowId,
    /// Start step; 0 resolves the workflow's single orphan step.
    pub step_id: StepId,
    pub input: Scope,
    pub event_type: String,
    pub resource_type: String,
    pub invoker: Identity,
    /// Force tracing on for this session.
    pub trace: bool,
    /// Block until the session goes idle and return its result.
    pub wait: bool,
}
