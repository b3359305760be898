//! Error types for osprey-db-repl

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, ReplError>;

/// Replication-layer errors
#[derive(Error, Debug)]
pub enum ReplError {
    /// Error from osprey-db-core
    #[error("Core error: {0}")]
    Core(#[from] osprey_db_core::Error),
}
