//! Common error types for LineCount

use thiserror::Error;

/// Common result type for LineCount operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the station
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Plan status change not allowed from the current state
    #[error("Invalid transition for plan {plan_id}: {from} -> {to}")]
    InvalidTransition {
        plan_id: i64,
        from: String,
        to: String,
    },

    /// Local store stayed locked after every retry
    #[error("Local store busy: {operation} failed after {attempts} attempts")]
    TransientStorage { operation: String, attempts: u32 },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the underlying SQLite error is a busy/locked condition.
    pub fn is_lock_contention(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(db_err)) => {
                matches!(db_err.code().as_deref(), Some("5") | Some("6"))
                    || db_err.message().contains("database is locked")
            }
            Error::Database(other) => other.to_string().contains("database is locked"),
            _ => false,
        }
    }

    /// True when the error is a UNIQUE constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
            _ => false,
        }
    }
}
