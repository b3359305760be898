//! Error types for osprey-db-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    /// Collection or database not found in the catalog
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed namespace string
    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    /// Index spec failed shape validation
    #[error("Invalid index spec: {0}")]
    InvalidIndexSpec(String),

    /// A ready index with the same name and options already exists
    #[error("Index already exists: {0}")]
    IndexAlreadyExists(String),

    /// An index with the same name but different options exists
    #[error("Index options conflict: {0}")]
    IndexOptionsConflict(String),

    /// Index creation rejected (admission control, shard-key restrictions)
    #[error("Cannot create index: {0}")]
    CannotCreateIndex(String),

    /// Operation was killed
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// Operation was interrupted by process shutdown
    #[error("Interrupted at shutdown")]
    InterruptedAtShutdown,

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create an invalid namespace error
    pub fn invalid_namespace(msg: impl Into<String>) -> Self {
        Error::InvalidNamespace(msg.into())
    }

    /// Create an invalid index spec error
    pub fn invalid_index_spec(msg: impl Into<String>) -> Self {
        Error::InvalidIndexSpec(msg.into())
    }

    /// Create a cannot-create-index error
    pub fn cannot_create_index(msg: impl Into<String>) -> Self {
        Error::CannotCreateIndex(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// True when this error carries the shutdown interrupt.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::InterruptedAtShutdown)
    }
}
