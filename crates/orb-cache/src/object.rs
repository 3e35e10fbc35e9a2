//! Domain objects and shared handles to them.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use orb_types::{ClassName, FieldError, FieldValue, ObjectId};

/// Identity of a registered object: root class of its hierarchy plus id.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreKey {
    pub root: ClassName,
    pub id: ObjectId,
}

impl StoreKey {
    pub fn new(root: impl Into<ClassName>, id: ObjectId) -> Self {
        Self {
            root: root.into(),
            id,
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.root, self.id)
    }
}

impl fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreKey({self})")
    }
}

/// Where an object is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Built but never registered.
    Transient,
    /// Visible in the store, never written.
    Registered,
    /// Visible in the store and written at least once.
    Stored,
    /// Removed from the store; may be reregistered.
    Unregistered,
}

/// A typed entity: class tag, immutable id, application fields, and the
/// diagnostics left by the last persistence attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct DomainObject {
    class: ClassName,
    id: Option<ObjectId>,
    fields: BTreeMap<String, FieldValue>,
    lifecycle: Lifecycle,
    stored: bool,
    errors: Vec<FieldError>,
    failure: Option<String>,
}

impl DomainObject {
    pub fn new(class: impl Into<ClassName>) -> Self {
        Self {
            class: class.into(),
            id: None,
            fields: BTreeMap::new(),
            lifecycle: Lifecycle::Transient,
            stored: false,
            errors: Vec::new(),
            failure: None,
        }
    }

    /// Builder-style field assignment for objects not yet registered.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn class(&self) -> &ClassName {
        &self.class
    }

    pub fn id(&self) -> Option<ObjectId> {
        self.id
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Target id of a reference field, if set.
    pub fn reference(&self, field: &str) -> Option<ObjectId> {
        self.fields.get(field).and_then(FieldValue::as_reference)
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Overwrite a field without touching the accumulation index.
    ///
    /// Callers mutating registered objects this way must follow up with
    /// [`ObjectStore::sync_accumulations`](crate::ObjectStore::sync_accumulations).
    pub fn set(&mut self, field: impl Into<String>, value: FieldValue) -> Option<FieldValue> {
        self.fields.insert(field.into(), value)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_registered(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Registered | Lifecycle::Stored)
    }

    /// `true` once at least one INSERT of this object committed.
    pub fn is_stored(&self) -> bool {
        self.stored
    }

    pub fn mark_stored(&mut self) {
        self.stored = true;
        if self.lifecycle == Lifecycle::Registered {
            self.lifecycle = Lifecycle::Stored;
        }
    }

    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    pub fn push_error(&mut self, error: FieldError) {
        self.errors.push(error);
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
        self.failure = None;
    }

    /// Attach the message of a failure that aborted the last save.
    pub fn set_failure(&mut self, message: impl Into<String>) {
        self.failure = Some(message.into());
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// An object is invalid while it carries a critical field error or a
    /// failure from its last save.
    pub fn is_valid(&self) -> bool {
        self.failure.is_none() && !self.errors.iter().any(FieldError::is_critical)
    }

    pub(crate) fn assign_id(&mut self, id: ObjectId) {
        self.id = Some(id);
    }

    pub(crate) fn set_registered(&mut self, registered: bool) {
        self.lifecycle = match (registered, self.stored) {
            (true, true) => Lifecycle::Stored,
            (true, false) => Lifecycle::Registered,
            (false, _) => Lifecycle::Unregistered,
        };
    }
}

/// Shared reference to a registered object.
///
/// Handles compare and hash by [`StoreKey`]. Never hold a handle's lock
/// while calling into the [`ObjectStore`](crate::ObjectStore).
#[derive(Clone)]
pub struct Handle {
    key: StoreKey,
    inner: Arc<RwLock<DomainObject>>,
}

impl Handle {
    pub(crate) fn new(key: StoreKey, object: DomainObject) -> Self {
        Self {
            key,
            inner: Arc::new(RwLock::new(object)),
        }
    }

    pub fn key(&self) -> &StoreKey {
        &self.key
    }

    pub fn id(&self) -> ObjectId {
        self.key.id
    }

    pub fn class(&self) -> ClassName {
        self.read().class.clone()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, DomainObject> {
        self.inner.read().expect("object lock poisoned")
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, DomainObject> {
        self.inner.write().expect("object lock poisoned")
    }

    /// Clone of a field's current value.
    pub fn get(&self, field: &str) -> Option<FieldValue> {
        self.read().get(field).cloned()
    }

    pub fn reference(&self, field: &str) -> Option<ObjectId> {
        self.read().reference(field)
    }

    pub fn is_valid(&self) -> bool {
        self.read().is_valid()
    }

    pub fn is_stored(&self) -> bool {
        self.read().is_stored()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.read().lifecycle()
    }

    /// `true` if both handles share the same underlying object.
    pub fn same_object(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Handle {}

impl Hash for Handle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.key)
    }
}
