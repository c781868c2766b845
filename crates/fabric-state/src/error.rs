//! Error types for the fabric registry.

use thiserror::Error;

/// Result type alias for registry operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

impl StateError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StateError::Transaction(_)
                | StateError::Read(_)
                | StateError::Write(_)
                | StateError::Unavailable(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict(_))
    }
}
