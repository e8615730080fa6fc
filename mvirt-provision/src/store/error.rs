//! Store error types.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Record not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The database rejected or failed the query.
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    /// Internal error.
    #[error("internal: {0}")]
    Internal(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
