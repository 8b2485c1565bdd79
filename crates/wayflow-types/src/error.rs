use thiserror::Error;

/// Errors from repository operations (used by trait definitions in wayflow-core).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
        assert_eq!(
            RepositoryError::Conflict("handle taken".to_string()).to_string(),
            "conflict: handle taken"
        );
    }
}
