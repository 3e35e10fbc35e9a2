//! Sources of fresh object ids.

use std::sync::atomic::{AtomicI64, Ordering};

use orb_types::ObjectId;

use crate::error::{CacheError, CacheResult};

/// Hands out ids for newly registered objects.
///
/// Ids must be unique per root class across every instance sharing a
/// database, so production sources draw from a database sequence.
pub trait IdSource: Send + Sync {
    fn next_id(&self) -> CacheResult<ObjectId>;
}

/// Process-local counter, for store-only use and tests.
#[derive(Debug)]
pub struct SequentialIds {
    next: AtomicI64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: i64) -> Self {
        Self {
            next: AtomicI64::new(first),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource for SequentialIds {
    fn next_id(&self) -> CacheResult<ObjectId> {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        ObjectId::new(raw).map_err(|e| CacheError::IdSource(e.to_string()))
    }
}
