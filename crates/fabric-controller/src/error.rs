//! Coordination error types.

use fabric_ring::RingError;
use fabric_state::StateError;
use thiserror::Error;

/// Result type alias for coordination operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// Key collisions persisted past the configured retry budget.
    #[error("registration of {controller_type} instance failed after {attempts} conflicting attempts")]
    RegistrationConflict {
        controller_type: String,
        attempts: u32,
    },

    /// The registry could not be reached (transient failure).
    #[error("registry unavailable: {0}")]
    StoreUnavailable(#[source] StateError),

    /// The registry rejected the operation.
    #[error("registry error: {0}")]
    Store(#[source] StateError),

    #[error("partition computation failed: {0}")]
    PartitionComputation(#[from] RingError),

    #[error("instance {0} is not registered")]
    NotRegistered(String),
}

impl From<StateError> for ControllerError {
    fn from(e: StateError) -> Self {
        if e.is_transient() {
            ControllerError::StoreUnavailable(e)
        } else {
            ControllerError::Store(e)
        }
    }
}

impl ControllerError {
    /// Whether a later retry of the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ControllerError::StoreUnavailable(_))
    }
}
