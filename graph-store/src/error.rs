//! Error types for graph storage.

use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur at the storage boundary.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// The referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A stored value could not be interpreted.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The backing store failed.
    #[error("backend error: {0}")]
    Backend(String),
}
