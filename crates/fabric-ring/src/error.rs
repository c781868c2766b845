//! Ring partitioner error types.

use thiserror::Error;

/// Violations of the ring invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("key space exhausted: lowest key {lowest} cannot be bisected")]
    KeySpaceExhausted { lowest: i64 },

    #[error("duplicate ring key {0}")]
    DuplicateKey(i64),

    #[error("ring key {0} is outside (0, i64::MAX]")]
    KeyOutOfRange(i64),

    #[error("ring key {0} is not on the ring")]
    UnknownKey(i64),

    #[error("ring keys are not sorted ascending")]
    NotSorted,

    #[error("ranges do not tile the key space: {0}")]
    TilingViolation(String),
}

pub type RingResult<T> = Result<T, RingError>;
