//! Error types for the index build coordinator

use osprey_db_core::BuildId;
use thiserror::Error;

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Coordinator errors
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// An index with the same name is already being built on the collection
    #[error("Index build already in progress: {0}")]
    AlreadyInProgress(String),

    /// The build (or a colliding build) was aborted
    #[error("Index build aborted: {0}")]
    BuildAborted(String),

    /// Registration rejected: admission control or spec restrictions
    #[error("Cannot create index: {0}")]
    CannotCreateIndex(String),

    /// Duplicate keys (or similar) detected at constraint checking
    #[error("Index constraint violation: {0}")]
    ConstraintViolation(String),

    /// No build registered under the given UUID
    #[error("No index build with UUID: {0}")]
    NoSuchBuild(BuildId),

    /// A background operation is in progress where none was expected
    #[error("Background operation in progress: {0}")]
    BackgroundOperationInProgress(String),

    /// Error from osprey-db-core (catalog, interruption, spec validation)
    #[error(transparent)]
    Core(#[from] osprey_db_core::Error),

    /// Error from the replication layer
    #[error(transparent)]
    Repl(#[from] osprey_db_repl::ReplError),

    /// Broken internal invariant
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        CoordinatorError::Internal(msg.into())
    }

    /// True when this error is the shutdown interrupt.
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Core(osprey_db_core::Error::InterruptedAtShutdown)
        )
    }

    /// True when this error carries an abort signal for the build itself.
    pub fn is_build_aborted(&self) -> bool {
        matches!(self, CoordinatorError::BuildAborted(_))
    }

    /// True for the spec-subsumed classes that registration converts into
    /// an immediate success: an exact duplicate of an existing index, or an
    /// options conflict under relaxed constraint enforcement.
    pub fn converts_to_success(&self, constraints_relaxed: bool) -> bool {
        match self {
            CoordinatorError::Core(osprey_db_core::Error::IndexAlreadyExists(_)) => true,
            CoordinatorError::Core(osprey_db_core::Error::IndexOptionsConflict(_)) => {
                constraints_relaxed
            }
            _ => false,
        }
    }
}
