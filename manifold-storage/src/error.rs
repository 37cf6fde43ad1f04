//! Storage error types

use thiserror::Error;

/// Storage result type
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database-level error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Row-to-entity conversion error
    #[error("Invalid row data: {0}")]
    InvalidRow(String),

    /// Migration error
    #[error("Migration failed: {0}")]
    Migration(String),
}
