//! The object store: registration, lookup, records and accumulations.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use orb_schema::Schema;
use orb_types::{ClassName, FieldValue, ObjectId};
use tracing::debug;

use crate::accumulation::{AccumulationIndex, FieldRef};
use crate::error::{CacheError, CacheResult};
use crate::ids::{IdSource, SequentialIds};
use crate::object::{DomainObject, Handle, StoreKey};
use crate::record::ObjectRecord;

struct Slot {
    handle: Handle,
    record: Option<ObjectRecord>,
    /// Parent each reference field was last accumulated under.
    shadows: BTreeMap<FieldRef, StoreKey>,
}

/// Identity-keyed cache of every live domain object.
///
/// Registration and unregistration are expected to be serialized per
/// related object graph by the caller; the accumulation index tolerates
/// concurrent writers on its own.
pub struct ObjectStore {
    schema: Arc<Schema>,
    slots: RwLock<HashMap<StoreKey, Slot>>,
    accumulations: AccumulationIndex,
    ids: Arc<dyn IdSource>,
}

impl ObjectStore {
    pub fn new(schema: Arc<Schema>, ids: Arc<dyn IdSource>) -> Self {
        Self {
            schema,
            slots: RwLock::new(HashMap::new()),
            accumulations: AccumulationIndex::new(),
            ids,
        }
    }

    /// A store drawing ids from a process-local counter.
    pub fn with_sequential_ids(schema: Arc<Schema>) -> Self {
        Self::new(schema, Arc::new(SequentialIds::new()))
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn accumulations(&self) -> &AccumulationIndex {
        &self.accumulations
    }

    pub fn next_id(&self) -> CacheResult<ObjectId> {
        self.ids.next_id()
    }

    /// Store key of `class` + `id`: the root class of the hierarchy.
    pub fn key_for(&self, class: &ClassName, id: ObjectId) -> CacheResult<StoreKey> {
        let root = self.schema.root_of(class)?;
        Ok(StoreKey::new(root.name.clone(), id))
    }

    fn validate(&self, object: &DomainObject) -> CacheResult<()> {
        self.schema.class(object.class())?;
        for (name, value) in object.fields() {
            let (_, def) = self.schema.field(object.class(), name)?;
            if !def.kind.accepts(value) {
                return Err(CacheError::KindMismatch {
                    class: object.class().clone(),
                    field: name.clone(),
                });
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Registration
    // ---------------------------------------------------------------

    /// Register an object, drawing a fresh id unless it already has one.
    pub fn register(&self, object: DomainObject) -> CacheResult<Handle> {
        let id = match object.id() {
            Some(id) => id,
            None => self.ids.next_id()?,
        };
        self.register_with_id(object, id)
    }

    /// Register an object under a given id. Fails with
    /// [`CacheError::IdTaken`] if the id is already registered for the
    /// object's hierarchy.
    pub fn register_with_id(&self, mut object: DomainObject, id: ObjectId) -> CacheResult<Handle> {
        self.validate(&object)?;
        let key = self.key_for(object.class(), id)?;
        if object.is_registered() {
            return Err(CacheError::AlreadyRegistered {
                class: object.class().clone(),
                id,
            });
        }
        if let Some(existing) = object.id() {
            if existing != id {
                return Err(CacheError::IdChange {
                    key: self.key_for(object.class(), existing)?,
                    requested: id,
                });
            }
        }
        object.assign_id(id);
        object.set_registered(true);
        let handle = Handle::new(key.clone(), object);
        {
            let mut slots = self.slots.write().expect("store lock poisoned");
            if slots.contains_key(&key) {
                return Err(CacheError::IdTaken(key));
            }
            slots.insert(
                key.clone(),
                Slot {
                    handle: handle.clone(),
                    record: None,
                    shadows: BTreeMap::new(),
                },
            );
        }
        self.sync_accumulations(&handle);
        debug!(key = %key, "registered object");
        Ok(handle)
    }

    /// Remove an object from the store. Returns `false` if this handle's
    /// object was not registered.
    pub fn unregister(&self, handle: &Handle) -> bool {
        let slot = {
            let mut slots = self.slots.write().expect("store lock poisoned");
            match slots.get(handle.key()) {
                Some(slot) if slot.handle.same_object(handle) => slots.remove(handle.key()),
                _ => None,
            }
        };
        let Some(slot) = slot else {
            return false;
        };
        for (field, parent) in &slot.shadows {
            self.accumulations.remove(parent, field, handle.key());
        }
        handle.write().set_registered(false);
        debug!(key = %handle.key(), "unregistered object");
        true
    }

    /// Put an unregistered object back under its retained id. Stored
    /// objects get a record rebuilt from their current field values.
    pub fn reregister(&self, handle: &Handle) -> CacheResult<()> {
        let record = {
            let object = handle.read();
            object
                .is_stored()
                .then(|| ObjectRecord::from_fields(object.fields()))
        };
        {
            let mut slots = self.slots.write().expect("store lock poisoned");
            if slots.contains_key(handle.key()) {
                return Err(CacheError::IdTaken(handle.key().clone()));
            }
            slots.insert(
                handle.key().clone(),
                Slot {
                    handle: handle.clone(),
                    record,
                    shadows: BTreeMap::new(),
                },
            );
        }
        handle.write().set_registered(true);
        self.sync_accumulations(handle);
        debug!(key = %handle.key(), "reregistered object");
        Ok(())
    }

    /// `true` if this handle's object is the one registered under its key.
    pub fn is_registered(&self, handle: &Handle) -> bool {
        let slots = self.slots.read().expect("store lock poisoned");
        slots
            .get(handle.key())
            .is_some_and(|slot| slot.handle.same_object(handle))
    }

    pub fn contains(&self, key: &StoreKey) -> bool {
        let slots = self.slots.read().expect("store lock poisoned");
        slots.contains_key(key)
    }

    // ---------------------------------------------------------------
    // Lookup
    // ---------------------------------------------------------------

    pub fn find_key(&self, key: &StoreKey) -> Option<Handle> {
        let slots = self.slots.read().expect("store lock poisoned");
        slots.get(key).map(|slot| slot.handle.clone())
    }

    /// Find the object with `id` whose class is `class` or a subclass.
    pub fn find(&self, class: &ClassName, id: ObjectId) -> Option<Handle> {
        let key = self.key_for(class, id).ok()?;
        let handle = self.find_key(&key)?;
        self.schema
            .is_a(&handle.class(), class)
            .then_some(handle)
    }

    /// All registered objects of `class` (or a subclass) matching
    /// `predicate`, ordered by id.
    pub fn find_all(&self, class: &ClassName, predicate: impl Fn(&DomainObject) -> bool) -> Vec<Handle> {
        let Ok(root) = self.schema.root_of(class) else {
            return Vec::new();
        };
        let candidates: Vec<Handle> = {
            let slots = self.slots.read().expect("store lock poisoned");
            slots
                .iter()
                .filter(|(key, _)| key.root == root.name)
                .map(|(_, slot)| slot.handle.clone())
                .collect()
        };
        let mut found: Vec<Handle> = candidates
            .into_iter()
            .filter(|handle| {
                let object = handle.read();
                self.schema.is_a(object.class(), class) && predicate(&object)
            })
            .collect();
        found.sort_by_key(Handle::id);
        found
    }

    /// Registered objects of `class` without critical errors or failures.
    pub fn find_all_valid(&self, class: &ClassName) -> Vec<Handle> {
        self.find_all(class, DomainObject::is_valid)
    }

    /// Every registered object, ordered by key.
    pub fn handles(&self) -> Vec<Handle> {
        let mut handles: Vec<Handle> = {
            let slots = self.slots.read().expect("store lock poisoned");
            slots.values().map(|slot| slot.handle.clone()).collect()
        };
        handles.sort_by(|a, b| a.key().cmp(b.key()));
        handles
    }

    pub fn len(&self) -> usize {
        self.slots.read().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ---------------------------------------------------------------
    // Records
    // ---------------------------------------------------------------

    /// Clone of the persisted record, `None` for never-stored objects.
    pub fn record(&self, key: &StoreKey) -> Option<ObjectRecord> {
        let slots = self.slots.read().expect("store lock poisoned");
        slots.get(key).and_then(|slot| slot.record.clone())
    }

    pub fn set_record(&self, key: &StoreKey, record: ObjectRecord) -> CacheResult<()> {
        self.update_record(key, |r| *r = record)
    }

    /// Swap in `record` wholesale, `None` included, and return the old one.
    pub fn replace_record(&self, key: &StoreKey, record: Option<ObjectRecord>) -> CacheResult<Option<ObjectRecord>> {
        let mut slots = self.slots.write().expect("store lock poisoned");
        let slot = slots
            .get_mut(key)
            .ok_or_else(|| CacheError::NotRegistered(key.clone()))?;
        Ok(std::mem::replace(&mut slot.record, record))
    }

    /// Edit the record in place, starting from an empty one if needed.
    pub fn update_record(&self, key: &StoreKey, edit: impl FnOnce(&mut ObjectRecord)) -> CacheResult<()> {
        let mut slots = self.slots.write().expect("store lock poisoned");
        let slot = slots
            .get_mut(key)
            .ok_or_else(|| CacheError::NotRegistered(key.clone()))?;
        edit(slot.record.get_or_insert_with(ObjectRecord::new));
        Ok(())
    }

    // ---------------------------------------------------------------
    // Fields and accumulations
    // ---------------------------------------------------------------

    /// Set one field of a registered object, keeping accumulations in step.
    pub fn set_field(
        &self,
        handle: &Handle,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> CacheResult<Option<FieldValue>> {
        let class = handle.class();
        let (_, def) = self.schema.field(&class, field)?;
        let value = value.into();
        if !def.kind.accepts(&value) {
            return Err(CacheError::KindMismatch {
                class,
                field: field.to_string(),
            });
        }
        let old = handle.write().set(field, value);
        if def.is_reference() {
            self.sync_accumulations(handle);
        }
        Ok(old)
    }

    /// Bring the accumulation index in line with `handle`'s reference
    /// fields by diffing each field against the parent it was last
    /// accumulated under. No-op for unregistered objects.
    pub fn sync_accumulations(&self, handle: &Handle) {
        let current: Vec<(FieldRef, Option<StoreKey>)> = {
            let object = handle.read();
            let Ok(fields) = self.schema.fields(object.class()) else {
                return;
            };
            fields
                .into_iter()
                .filter_map(|(layer, def)| {
                    let target = def.kind.reference_target()?;
                    let parent = object
                        .reference(&def.name)
                        .and_then(|id| self.key_for(target, id).ok());
                    Some((FieldRef::new(layer.name.clone(), def.name.clone()), parent))
                })
                .collect()
        };

        let mut slots = self.slots.write().expect("store lock poisoned");
        let Some(slot) = slots
            .get_mut(handle.key())
            .filter(|slot| slot.handle.same_object(handle))
        else {
            return;
        };
        for (field, parent) in current {
            let previous = slot.shadows.get(&field);
            if previous == parent.as_ref() {
                continue;
            }
            if let Some(previous) = previous {
                self.accumulations.remove(previous, &field, handle.key());
            }
            match parent {
                Some(parent) => {
                    self.accumulations.add(&parent, &field, handle.key());
                    slot.shadows.insert(field, parent);
                }
                None => {
                    slot.shadows.remove(&field);
                }
            }
        }
    }

    /// Registered objects referencing `parent` through any field.
    pub fn children(&self, parent: &StoreKey) -> Vec<Handle> {
        self.accumulations
            .all_children(parent)
            .iter()
            .filter_map(|key| self.find_key(key))
            .collect()
    }

    /// Registered objects referencing `parent` through one field.
    pub fn referrers(&self, parent: &StoreKey, field: &FieldRef) -> Vec<Handle> {
        self.accumulations
            .children(parent, field)
            .iter()
            .filter_map(|key| self.find_key(key))
            .collect()
    }

    pub fn is_referenced(&self, key: &StoreKey) -> bool {
        self.accumulations.is_referenced(key)
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("objects", &self.len())
            .field("referenced", &self.accumulations.len())
            .finish()
    }
}
