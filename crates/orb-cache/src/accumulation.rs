//! Back-reference index from referenced objects to their referrers.
//!
//! An accumulation is the set of registered objects whose reference field
//! currently points at a given parent. The index is derived: it is never
//! persisted and can be rebuilt from the live reference fields. It is the
//! one structure in the store that tolerates uncoordinated concurrent
//! writers, so it carries its own lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::RwLock;

use orb_types::ClassName;

use crate::object::StoreKey;

/// A reference field, named by the class that declares it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldRef {
    pub class: ClassName,
    pub field: String,
}

impl FieldRef {
    pub fn new(class: impl Into<ClassName>, field: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class, self.field)
    }
}

impl fmt::Debug for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldRef({self})")
    }
}

type Referrers = BTreeMap<FieldRef, BTreeSet<StoreKey>>;

/// Concurrent parent -> (field -> children) index.
#[derive(Debug, Default)]
pub struct AccumulationIndex {
    parents: RwLock<HashMap<StoreKey, Referrers>>,
}

impl AccumulationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `child.field` points at `parent`. Returns `false` if the
    /// entry already existed.
    pub fn add(&self, parent: &StoreKey, field: &FieldRef, child: &StoreKey) -> bool {
        let mut parents = self.parents.write().expect("accumulation lock poisoned");
        parents
            .entry(parent.clone())
            .or_default()
            .entry(field.clone())
            .or_default()
            .insert(child.clone())
    }

    /// Drop `child` from `parent`'s accumulation for `field`. Returns `false`
    /// if it was not there.
    pub fn remove(&self, parent: &StoreKey, field: &FieldRef, child: &StoreKey) -> bool {
        let mut parents = self.parents.write().expect("accumulation lock poisoned");
        let Some(referrers) = parents.get_mut(parent) else {
            return false;
        };
        let removed = referrers
            .get_mut(field)
            .map(|children| children.remove(child))
            .unwrap_or(false);
        referrers.retain(|_, children| !children.is_empty());
        if referrers.is_empty() {
            parents.remove(parent);
        }
        removed
    }

    /// Children of `parent` through one field.
    pub fn children(&self, parent: &StoreKey, field: &FieldRef) -> Vec<StoreKey> {
        let parents = self.parents.read().expect("accumulation lock poisoned");
        parents
            .get(parent)
            .and_then(|r| r.get(field))
            .map(|children| children.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Children of `parent` through any field, without duplicates.
    pub fn all_children(&self, parent: &StoreKey) -> Vec<StoreKey> {
        let parents = self.parents.read().expect("accumulation lock poisoned");
        let mut children: BTreeSet<StoreKey> = BTreeSet::new();
        if let Some(referrers) = parents.get(parent) {
            for keys in referrers.values() {
                children.extend(keys.iter().cloned());
            }
        }
        children.into_iter().collect()
    }

    pub fn is_referenced(&self, parent: &StoreKey) -> bool {
        let parents = self.parents.read().expect("accumulation lock poisoned");
        parents.contains_key(parent)
    }

    /// Number of parents with at least one referrer.
    pub fn len(&self) -> usize {
        self.parents.read().expect("accumulation lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
