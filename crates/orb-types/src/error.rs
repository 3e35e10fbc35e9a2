use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid object id: {0} (ids must be positive)")]
    InvalidId(i64),

    #[error("value kind mismatch: expected {expected}, got {actual}")]
    KindMismatch { expected: String, actual: String },

    #[error("empty class name")]
    EmptyClassName,
}
