//! Business logic services (use cases).
//!
//! Services orchestrate repository calls, access checks and the engine.
//! They depend on traits (ports) -- never on concrete infrastructure
//! implementations.

pub mod access;
pub mod session;
pub mod workflow;

use thiserror::Error;
use wayflow_types::error::RepositoryError;
use wayflow_types::session::SessionId;
use wayflow_types::workflow::{StepId, WorkflowId};

use crate::workflow::definition::DefinitionError;
use crate::workflow::session::SessionError;

/// Errors surfaced by the workflow and session services.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not allowed to {0}")]
    NotAllowed(&'static str),

    #[error("invalid ID")]
    InvalidId,

    #[error("workflow {0} not found")]
    WorkflowNotFound(WorkflowId),

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("workflow handle '{0}' is already in use")]
    HandleNotUnique(String),

    #[error("workflow was modified since it was read")]
    StaleData,

    #[error("workflow {0} is disabled")]
    WorkflowDisabled(WorkflowId),

    #[error("workflow {0} is not loaded")]
    WorkflowNotLoaded(WorkflowId),

    #[error("workflow has no orphan step to start from")]
    NoStartStep,

    #[error("workflow has more than one orphan step ({0:?}), start step must be given")]
    AmbiguousStartStep(Vec<StepId>),

    #[error("session pool is shut down")]
    PoolClosed,

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}
