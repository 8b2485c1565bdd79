//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (wayflow-infra) implements. The core crate never depends on any
//! specific storage technology; [`memory::MemoryRepository`] covers
//! embedding and tests.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

pub mod memory;

use std::future::Future;

use wayflow_types::error::RepositoryError;
use wayflow_types::session::{SessionFilter, SessionId, SessionRecord};
use wayflow_types::workflow::{WorkflowDefinition, WorkflowFilter, WorkflowId};

/// Storage for workflow definitions.
pub trait WorkflowRepository: Send + Sync {
    /// Insert a new definition. Fails with `Conflict` if the ID or handle
    /// is already taken.
    fn create_workflow(
        &self,
        def: &WorkflowDefinition,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Overwrite an existing definition. Fails with `NotFound` if missing.
    fn update_workflow(
        &self,
        def: &WorkflowDefinition,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn lookup_workflow_by_id(
        &self,
        id: WorkflowId,
    ) -> impl Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Lookup by handle; soft-deleted definitions are not returned.
    fn lookup_workflow_by_handle(
        &self,
        handle: &str,
    ) -> impl Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Definitions matching the filter, ordered by ID.
    fn search_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> impl Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Lookup, mutate and store as one unit: no other writer observes or
    /// changes the record between the lookup and the update.
    ///
    /// `mutate` may reject the change; its error is returned and nothing is
    /// written.
    fn update_workflow_with<F, E>(
        &self,
        id: WorkflowId,
        mutate: F,
    ) -> impl Future<Output = Result<WorkflowDefinition, E>> + Send
    where
        F: FnOnce(WorkflowDefinition) -> Result<WorkflowDefinition, E> + Send,
        E: From<RepositoryError> + Send;
}

/// Storage for session records.
pub trait SessionRepository: Send + Sync {
    fn create_session(
        &self,
        record: &SessionRecord,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Full overwrite by session ID.
    fn update_session(
        &self,
        record: &SessionRecord,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn lookup_session(
        &self,
        id: SessionId,
    ) -> impl Future<Output = Result<Option<SessionRecord>, RepositoryError>> + Send;

    /// Records matching the filter, newest first.
    fn search_sessions(
        &self,
        filter: &SessionFilter,
    ) -> impl Future<Output = Result<Vec<SessionRecord>, RepositoryError>> + Send;
}
