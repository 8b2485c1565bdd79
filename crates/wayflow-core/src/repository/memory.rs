//! In-memory repository.
//!
//! Backs both repository traits with `DashMap`s. Workflow writes are
//! serialized through one async mutex so handle uniqueness and
//! `update_workflow_with` hold across concurrent writers.

use dashmap::DashMap;
use tokio::sync::Mutex;
use wayflow_types::error::RepositoryError;
use wayflow_types::session::{SessionFilter, SessionId, SessionRecord};
use wayflow_types::workflow::{WorkflowDefinition, WorkflowFilter, WorkflowId};

use super::{SessionRepository, WorkflowRepository};

#[derive(Debug, Default)]
pub struct MemoryRepository {
    workflows: DashMap<WorkflowId, WorkflowDefinition>,
    sessions: DashMap<SessionId, SessionRecord>,
    workflow_writes: Mutex<()>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_taken(&self, handle: &str, except: WorkflowId) -> bool {
        self.workflows
            .iter()
            .any(|w| w.id != except && w.handle == handle && !w.is_deleted())
    }
}

impl WorkflowRepository for MemoryRepository {
    async fn create_workflow(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let _guard = self.workflow_writes.lock().await;
        if self.workflows.contains_key(&def.id) {
            return Err(RepositoryError::Conflict(format!(
                "workflow {} already exists",
                def.id
            )));
        }
        if self.handle_taken(&def.handle, def.id) {
            return Err(RepositoryError::Conflict(format!(
                "handle '{}' already in use",
                def.handle
            )));
        }
        self.workflows.insert(def.id, def.clone());
        Ok(())
    }

    async fn update_workflow(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let _guard = self.workflow_writes.lock().await;
        if !self.workflows.contains_key(&def.id) {
            return Err(RepositoryError::NotFound);
        }
        if self.handle_taken(&def.handle, def.id) {
            return Err(RepositoryError::Conflict(format!(
                "handle '{}' already in use",
                def.handle
            )));
        }
        self.workflows.insert(def.id, def.clone());
        Ok(())
    }

    async fn lookup_workflow_by_id(
        &self,
        id: WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.workflows.get(&id).map(|w| w.clone()))
    }

    async fn lookup_workflow_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .workflows
            .iter()
            .find(|w| w.handle == handle && !w.is_deleted())
            .map(|w| w.clone()))
    }

    async fn search_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut found: Vec<WorkflowDefinition> = self
            .workflows
            .iter()
            .filter(|w| filter.matches(w))
            .map(|w| w.clone())
            .collect();
        found.sort_by_key(|w| w.id);
        if let Some(limit) = filter.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn update_workflow_with<F, E>(
        &self,
        id: WorkflowId,
        mutate: F,
    ) -> Result<WorkflowDefinition, E>
    where
        F: FnOnce(WorkflowDefinition) -> Result<WorkflowDefinition, E> + Send,
        E: From<RepositoryError> + Send,
    {
        let _guard = self.workflow_writes.lock().await;
        let current = self
            .workflows
            .get(&id)
            .map(|w| w.clone())
            .ok_or(RepositoryError::NotFound)?;

        let updated = mutate(current)?;
        if updated.id != id {
            return Err(RepositoryError::Conflict("workflow ID cannot change".into()).into());
        }
        if self.handle_taken(&updated.handle, id) {
            return Err(RepositoryError::Conflict(format!(
                "handle '{}' already in use",
                updated.handle
            ))
            .into());
        }
        self.workflows.insert(id, updated.clone());
        Ok(updated)
    }
}

impl SessionRepository for MemoryRepository {
    async fn create_session(&self, record: &SessionRecord) -> Result<(), RepositoryError> {
        match self.sessions.entry(record.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "session {} already exists",
                record.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn update_session(&self, record: &SessionRecord) -> Result<(), RepositoryError> {
        match self.sessions.get_mut(&record.id) {
            Some(mut existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn lookup_session(&self, id: SessionId) -> Result<Option<SessionRecord>, RepositoryError> {
        Ok(self.sessions.get(&id).map(|s| s.clone()))
    }

    async fn search_sessions(
        &self,
        filter: &SessionFilter,
    ) -> Result<Vec<SessionRecord>, RepositoryError> {
        let mut found: Vec<SessionRecord> = self
            .sessions
            .iter()
            .filter(|s| filter.matches(s))
            .map(|s| s.clone())
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            found.truncate(limit);
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayflow_types::identity::Identity;
    use wayflow_types::scope::Scope;
    use wayflow_types::session::SessionStatus;

    fn workflow(id: WorkflowId, handle: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            id,
            ..WorkflowDefinition::new(handle)
        }
    }

    #[tokio::test]
    async fn test_create_and_lookup_workflow() {
        let repo = MemoryRepository::new();
        repo.create_workflow(&workflow(1, "alpha")).await.unwrap();

        let by_id = repo.lookup_workflow_by_id(1).await.unwrap().unwrap();
        assert_eq!(by_id.handle, "alpha");
        let by_handle = repo.lookup_workflow_by_handle("alpha").await.unwrap();
        assert_eq!(by_handle.map(|w| w.id), Some(1));
        assert!(repo.lookup_workflow_by_id(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_handle_conflicts() {
        let repo = MemoryRepository::new();
        repo.create_workflow(&workflow(1, "alpha")).await.unwrap();
        assert!(matches!(
            repo.create_workflow(&workflow(2, "alpha")).await,
            Err(RepositoryError::Conflict(_))
        ));
        assert!(matches!(
            repo.create_workflow(&workflow(1, "beta")).await,
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_deleted_workflow_frees_handle() {
        let repo = MemoryRepository::new();
        let mut old = workflow(1, "alpha");
        old.deleted_at = Some(chrono::Utc::now());
        repo.create_workflow(&old).await.unwrap();

        assert!(repo.lookup_workflow_by_handle("alpha").await.unwrap().is_none());
        repo.create_workflow(&workflow(2, "alpha")).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_workflow_with_rejection_writes_nothing() {
        let repo = MemoryRepository::new();
        repo.create_workflow(&workflow(1, "alpha")).await.unwrap();

        let res: Result<_, RepositoryError> = repo
            .update_workflow_with(1, |_| Err(RepositoryError::Conflict("stale".into())))
            .await;
        assert!(res.is_err());

        let updated: WorkflowDefinition = repo
            .update_workflow_with(1, |mut w| {
                w.enabled = false;
                Ok::<_, RepositoryError>(w)
            })
            .await
            .unwrap();
        assert!(!updated.enabled);
        assert!(!repo.lookup_workflow_by_id(1).await.unwrap().unwrap().enabled);

        let missing: Result<_, RepositoryError> =
            repo.update_workflow_with(9, Ok::<_, RepositoryError>).await;
        assert_eq!(missing, Err(RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_search_workflows_orders_and_limits() {
        let repo = MemoryRepository::new();
        for (id, handle) in [(3, "gamma"), (1, "alpha"), (2, "beta")] {
            repo.create_workflow(&workflow(id, handle)).await.unwrap();
        }
        let found = repo
            .search_workflows(&WorkflowFilter {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let repo = MemoryRepository::new();
        let mut record = SessionRecord::new(5, 1, Scope::new(), &Identity::system());
        repo.create_session(&record).await.unwrap();
        assert!(repo.create_session(&record).await.is_err());

        record.status = SessionStatus::Completed;
        repo.update_session(&record).await.unwrap();
        let stored = repo.lookup_session(5).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);

        let other = SessionRecord::new(6, 2, Scope::new(), &Identity::system());
        assert_eq!(
            repo.update_session(&other).await,
            Err(RepositoryError::NotFound)
        );

        let found = repo
            .search_sessions(&SessionFilter {
                status: vec![SessionStatus::Completed],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }
}
