//! SQLite storage layer.
//!
//! Repository implementations backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod pool;
pub mod session;
pub mod workflow;

use wayflow_types::error::RepositoryError;

/// IDs are `u64` in the domain and `INTEGER` (i64) in SQLite.
fn db_id(id: u64) -> Result<i64, RepositoryError> {
    i64::try_from(id).map_err(|_| RepositoryError::Query(format!("ID {id} out of range")))
}

/// Unique-constraint violations become `Conflict`; everything else is a
/// query error.
fn map_write_error(e: sqlx::Error) -> RepositoryError {
    match e.as_database_error() {
        Some(db) if db.is_unique_violation() => RepositoryError::Conflict(db.message().to_string()),
        _ => RepositoryError::Query(e.to_string()),
    }
}
