/// Errors from order-key planning.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    /// No free integer key between two neighbors.
    #[error("no room for {needed} key(s) between {lower} and {upper}")]
    DenseKeys { lower: i64, upper: i64, needed: usize },

    #[error("order increment must be positive, got {0}")]
    InvalidIncrement(i64),

    #[error("persisted order keys are not strictly increasing at {0}")]
    UnsortedKeys(i64),

    #[error("order key {0} is not positive")]
    NonPositiveKey(i64),

    #[error("order keys overflow past {0}")]
    Overflow(i64),
}

impl OrderError {
    /// `true` when the caller should fall back to rewriting the whole list.
    pub fn requires_rewrite(&self) -> bool {
        matches!(self, OrderError::DenseKeys { .. } | OrderError::Overflow(_))
    }
}

/// Result alias for order planning.
pub type OrderResult<T> = Result<T, OrderError>;
