//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `wayflow-core` using sqlx with split
//! read/write pools. Definitions are stored as JSON blobs next to the
//! columns used for lookups (handle, enabled, deleted_at).

use chrono::{DateTime, Utc};
use sqlx::Row;
use wayflow_core::repository::WorkflowRepository;
use wayflow_types::error::RepositoryError;
use wayflow_types::workflow::{DeletedFilter, WorkflowDefinition, WorkflowFilter, WorkflowId};

use super::pool::DatabasePool;
use super::{db_id, map_write_error};

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowRow {
    definition: String,
}

impl WorkflowRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            definition: row.try_get("definition")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, RepositoryError> {
        serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))
    }
}

fn decode_rows(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
    rows.iter()
        .map(|row| {
            WorkflowRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_definition()
        })
        .collect()
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn encode(def: &WorkflowDefinition) -> Result<String, RepositoryError> {
    serde_json::to_string(def)
        .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

const UPDATE_SQL: &str = r#"UPDATE workflows
       SET handle = ?, enabled = ?, definition = ?, updated_at = ?, deleted_at = ?
     WHERE id = ?"#;

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn create_workflow(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = encode(def)?;

        sqlx::query(
            r#"INSERT INTO workflows (id, handle, enabled, definition, created_at, updated_at, deleted_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(db_id(def.id)?)
        .bind(&def.handle)
        .bind(def.enabled)
        .bind(&definition_json)
        .bind(format_datetime(&def.created_at))
        .bind(def.updated_at.as_ref().map(format_datetime))
        .bind(def.deleted_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(map_write_error)?;

        Ok(())
    }

    async fn update_workflow(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = encode(def)?;

        let result = sqlx::query(UPDATE_SQL)
            .bind(&def.handle)
            .bind(def.enabled)
            .bind(&definition_json)
            .bind(def.updated_at.as_ref().map(format_datetime))
            .bind(def.deleted_at.as_ref().map(format_datetime))
            .bind(db_id(def.id)?)
            .execute(&self.pool.writer)
            .await
            .map_err(map_write_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn lookup_workflow_by_id(
        &self,
        id: WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(db_id(id)?)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = WorkflowRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn lookup_workflow_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(
            "SELECT definition FROM workflows WHERE handle = ? AND deleted_at IS NULL",
        )
        .bind(handle)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = WorkflowRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn search_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut query =
            sqlx::QueryBuilder::<sqlx::Sqlite>::new("SELECT definition FROM workflows WHERE 1 = 1");
        match filter.deleted {
            DeletedFilter::Exclude => {
                query.push(" AND deleted_at IS NULL");
            }
            DeletedFilter::Only => {
                query.push(" AND deleted_at IS NOT NULL");
            }
            DeletedFilter::Include => {}
        }
        if filter.enabled_only {
            query.push(" AND enabled = 1");
        }
        if let Some(handle) = &filter.handle {
            query.push(" AND handle = ").push_bind(handle);
        }
        query.push(" ORDER BY id ASC");

        let rows = query
            .build()
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        // Substring matching on handle/name is left to the filter itself.
        let mut defs: Vec<WorkflowDefinition> = decode_rows(&rows)?
            .into_iter()
            .filter(|def| filter.matches(def))
            .collect();
        if let Some(limit) = filter.limit {
            defs.truncate(limit);
        }
        Ok(defs)
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
        let query_err = |e: sqlx::Error| RepositoryError::Query(e.to_string());

        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(db_id(id)?)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?
            .ok_or(RepositoryError::NotFound)?;
        let current = WorkflowRow::from_row(&row)
            .map_err(query_err)?
            .into_definition()?;

        // Returning early drops `tx`, which rolls back.
        let updated = mutate(current)?;
        if updated.id != id {
            return Err(RepositoryError::Conflict("workflow ID cannot change".into()).into());
        }

        sqlx::query(UPDATE_SQL)
            .bind(&updated.handle)
            .bind(updated.enabled)
            .bind(encode(&updated)?)
            .bind(updated.updated_at.as_ref().map(format_datetime))
            .bind(updated.deleted_at.as_ref().map(format_datetime))
            .bind(db_id(id)?)
            .execute(&mut *tx)
            .await
            .map_err(map_write_error)?;

        tx.commit().await.map_err(query_err)?;
        Ok(updated)
    }
}
