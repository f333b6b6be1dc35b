//! Error types shared across Zapflow crates.

use thiserror::Error;

/// Zapflow error type.
#[derive(Error, Debug)]
pub enum ZapflowError {
    /// Configuration could not be read, parsed or validated.
    #[error("Config error: {0}")]
    Config(String),

    /// The job store failed (connection, query or transaction).
    #[error("Store error: {0}")]
    Store(String),

    /// A record referenced by id does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A write-back came from a worker that no longer holds the job's lease.
    #[error("Lease lost: {0}")]
    LeaseLost(String),

    /// A payload failed validation at the boundary.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using ZapflowError.
pub type Result<T> = std::result::Result<T, ZapflowError>;
