//! SQLite session repository implementation.
//!
//! Each session row carries the full `SessionRecord` as JSON plus the
//! columns searches filter on. Updates overwrite the whole record.

use chrono::{DateTime, Utc};
use sqlx::Row;
use wayflow_core::repository::SessionRepository;
use wayflow_types::error::RepositoryError;
use wayflow_types::session::{SessionFilter, SessionId, SessionRecord};

use super::pool::DatabasePool;
use super::{db_id, map_write_error};

/// SQLite-backed implementation of `SessionRepository`.
pub struct SqliteSessionRepository {
    pool: DatabasePool,
}

impl SqliteSessionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn encode(record: &SessionRecord) -> Result<String, RepositoryError> {
    serde_json::to_string(record)
        .map_err(|e| RepositoryError::Query(format!("serialize session: {e}")))
}

fn decode(row: &sqlx::sqlite::SqliteRow) -> Result<SessionRecord, RepositoryError> {
    let json: String = row
        .try_get("record")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    serde_json::from_str(&json)
        .map_err(|e| RepositoryError::Query(format!("invalid session record JSON: {e}")))
}

impl SessionRepository for SqliteSessionRepository {
    async fn create_session(&self, record: &SessionRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO sessions (id, workflow_id, status, created_by, record, created_at, completed_at, purge_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(db_id(record.id)?)
        .bind(db_id(record.workflow_id)?)
        .bind(record.status.as_str())
        .bind(db_id(record.created_by)?)
        .bind(encode(record)?)
        .bind(format_datetime(&record.created_at))
        .bind(record.completed_at.as_ref().map(format_datetime))
        .bind(record.purge_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(map_write_error)?;

        Ok(())
    }

    async fn update_session(&self, record: &SessionRecord) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE sessions
                  SET status = ?, record = ?, completed_at = ?, purge_at = ?
                WHERE id = ?"#,
        )
        .bind(record.status.as_str())
        .bind(encode(record)?)
        .bind(record.completed_at.as_ref().map(format_datetime))
        .bind(record.purge_at.as_ref().map(format_datetime))
        .bind(db_id(record.id)?)
        .execute(&self.pool.writer)
        .await
        .map_err(map_write_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn lookup_session(&self, id: SessionId) -> Result<Option<SessionRecord>, RepositoryError> {
        let row = sqlx::query("SELECT record FROM sessions WHERE id = ?")
            .bind(db_id(id)?)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(decode).transpose()
    }

    async fn search_sessions(
        &self,
        filter: &SessionFilter,
    ) -> Result<Vec<SessionRecord>, RepositoryError> {
        let mut query =
            sqlx::QueryBuilder::<sqlx::Sqlite>::new("SELECT record FROM sessions WHERE 1 = 1");
        if let Some(workflow_id) = filter.workflow_id {
            query.push(" AND workflow_id = ").push_bind(db_id(workflow_id)?);
        }
        if let Some(created_by) = filter.created_by {
            query.push(" AND created_by = ").push_bind(db_id(created_by)?);
        }
        if !filter.status.is_empty() {
            query.push(" AND status IN (");
            let mut statuses = query.separated(", ");
            for status in &filter.status {
                statuses.push_bind(status.as_str());
            }
            statuses.push_unseparated(")");
        }
        query.push(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            query
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = query
            .build()
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(decode).collect()
    }
}
