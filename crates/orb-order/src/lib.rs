//! Order-number manager for persisted lists.
//!
//! List elements live in entry rows, each carrying a numeric order key.
//! Keys are sparse: fresh lists are spaced by [`DEFAULT_INCREMENT`] so that
//! later insertions can take the midpoint of their neighbors without
//! renumbering anything.
//!
//! [`plan`] compares the persisted `(key, value)` sequence with the desired
//! value sequence and returns an [`OrderPlan`]: the keys to delete, the key
//! rotations that reorder surviving elements, and the keys for new elements.
//! Applying the plan in that order never writes two rows to the same key,
//! using [`SENTINEL`] as the scratch key while a rotation cycle is open.
//!
//! When two neighbors are adjacent integers there is no key in between;
//! [`plan`] reports [`OrderError::DenseKeys`] and the caller rewrites the
//! whole list with [`initial_keys`].

pub mod error;
pub mod plan;

pub use error::{OrderError, OrderResult};
pub use plan::{initial_keys, plan, KeyMove, OrderPlan};

/// Spacing between fresh order keys.
pub const DEFAULT_INCREMENT: i64 = 1 << 32;

/// Scratch key used to break rotation cycles. Never a valid element key.
pub const SENTINEL: i64 = 0;
