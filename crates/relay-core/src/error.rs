//! Error types for core repository operations.
//!
//! Translates database failures into a small taxonomy that the delivery
//! engine can wrap without depending on sqlx error internals.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for internal operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Whether the failure is likely to clear up on its own.
    ///
    /// Connection and pool problems are transient; constraint and input
    /// errors will fail the same way on every retry.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested row not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            sqlx::Error::ColumnDecode { index, source } => {
                Self::InvalidInput(format!("column {index} could not be decoded: {source}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, CoreError::NotFound(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn pool_timeout_is_transient() {
        let err = CoreError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, CoreError::Database(_)));
        assert!(err.is_transient());
    }
}
