//! Common error types for bibmerge

use thiserror::Error;

/// Common result type for bibmerge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the bibmerge crates
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

    /// Persisted schema does not match the published table contract
    #[error("Schema drift: {0}")]
    SchemaDrift(String),

    /// Invalid input or argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
