//! Loading with referential-integrity resolution.
//!
//! A load runs its selector once, absorbs the rows into the store, and then
//! loops: every reference whose target is not registered is left empty and
//! queued; each cycle fetches all queued targets in one select per root
//! class, absorbs them, and relinks the waiting fields. The loop ends when a
//! cycle queues nothing new, so after a load every reference to a
//! registered target is in place and every loaded reference has been
//! chased.

use std::collections::{BTreeMap, BTreeSet};

use orb_cache::{diff_fields, DomainObject, FieldChange, Handle, ObjectRecord, StoreKey};
use orb_schema::FieldDef;
use chrono::{DateTime, Utc};
use orb_sql::Transaction;
use orb_types::{ClassName, FieldError, FieldErrorKind, FieldValue, ObjectId, Value};
use tracing::{debug, info, warn};

use crate::convert::from_column;
use crate::engine::Engine;
use crate::error::EngineResult;
use crate::horizon::DataHorizon;
use crate::selector::{fetch_by_ids, RawBatch, RawRecord, SelectContext, Selector};

/// What a load saw.
#[derive(Clone, Debug, Default)]
pub struct LoadOutcome {
    /// `true` if any object was new or any persisted field changed.
    pub changed: bool,
    /// Every object the load read, including resolved reference targets.
    pub objects: Vec<Handle>,
}

impl LoadOutcome {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, key: &StoreKey) -> bool {
        self.objects.iter().any(|h| h.key() == key)
    }

    /// Fold another outcome into this one, keeping each object once.
    pub fn merge(&mut self, other: LoadOutcome) {
        self.changed |= other.changed;
        for handle in other.objects {
            if !self.contains(handle.key()) {
                self.objects.push(handle);
            }
        }
    }
}

/// A reference left empty because its target was not registered yet.
struct Unresolved {
    child: Handle,
    field: String,
    target: ClassName,
    id: ObjectId,
}

/// State of an object the load found already registered, as it was before
/// the load touched it.
struct Prior {
    handle: Handle,
    object: DomainObject,
    record: Option<ObjectRecord>,
}

struct LoadRun<'e> {
    engine: &'e Engine,
    changed: bool,
    touched: BTreeMap<StoreKey, Handle>,
    relinked: BTreeMap<StoreKey, Handle>,
    unresolved: Vec<Unresolved>,
    registered: BTreeMap<StoreKey, Handle>,
    prior: BTreeMap<StoreKey, Prior>,
}

impl Engine {
    /// Load the objects `selector` returns plus everything they reference.
    ///
    /// With a `horizon`, selectors that honor [`SelectContext::cutoff`] skip
    /// horizon-controlled objects not modified recently. Reference targets
    /// are fetched regardless of the horizon.
    ///
    /// On failure the transaction is rolled back and the store is left as
    /// it was: objects the load registered are removed again and objects it
    /// updated get their previous fields and records back.
    pub fn load<S>(&self, selector: &S, horizon: Option<&DataHorizon>) -> EngineResult<LoadOutcome>
    where
        S: Selector + ?Sized,
    {
        let cutoff = horizon.map(|h| h.cutoff(self.clock.now()));
        let mut tx = self.db.begin()?;
        let mut run = LoadRun::new(self);
        let cycles = match run.execute(tx.as_mut(), selector, cutoff) {
            Ok(cycles) => cycles,
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    warn!(error = %rollback, "rollback failed");
                }
                warn!(error = %e, "load failed; restoring store");
                run.repair();
                return Err(e);
            }
        };
        if let Err(e) = tx.commit() {
            warn!(error = %e, "load commit failed; restoring store");
            run.repair();
            return Err(e.into());
        }

        let outcome = run.finish();
        info!(
            objects = outcome.objects.len(),
            changed = outcome.changed,
            cycles,
            "load complete"
        );
        Ok(outcome)
    }
}

impl<'e> LoadRun<'e> {
    fn new(engine: &'e Engine) -> Self {
        Self {
            engine,
            changed: false,
            touched: BTreeMap::new(),
            relinked: BTreeMap::new(),
            unresolved: Vec::new(),
            registered: BTreeMap::new(),
            prior: BTreeMap::new(),
        }
    }

    /// Run the selector, then resolve references until nothing is queued.
    /// Each cycle fetches only keys not registered yet and registers every
    /// row it gets back, so the loop ends once a reference chain is
    /// exhausted however long it is.
    fn execute<S>(
        &mut self,
        tx: &mut dyn Transaction,
        selector: &S,
        cutoff: Option<DateTime<Utc>>,
    ) -> EngineResult<usize>
    where
        S: Selector + ?Sized,
    {
        let engine = self.engine;
        let ctx = SelectContext::new(&engine.schema, cutoff);
        let batch = selector.select(tx, &ctx)?;
        debug!(records = batch.len(), ?cutoff, "selector returned");
        self.absorb(batch)?;

        let mut cycles = 0;
        while !self.unresolved.is_empty() {
            cycles += 1;
            let pending = std::mem::take(&mut self.unresolved);
            let mut missing: BTreeMap<ClassName, BTreeSet<ObjectId>> = BTreeMap::new();
            for item in &pending {
                if engine.store.find(&item.target, item.id).is_none() {
                    let root = engine.schema.root_of(&item.target)?;
                    missing.entry(root.name.clone()).or_default().insert(item.id);
                }
            }
            debug!(cycle = cycles, pending = pending.len(), roots = missing.len(), "resolving references");
            for (root, ids) in missing {
                let ids: Vec<ObjectId> = ids.into_iter().collect();
                let batch = fetch_by_ids(tx, &engine.schema, &root, &ids, false)?;
                self.absorb(batch)?;
            }
            self.resolve(pending);
        }
        Ok(cycles)
    }

    /// Register every record first so references inside the batch resolve
    /// to each other, then apply the field values.
    fn absorb(&mut self, batch: RawBatch) -> EngineResult<()> {
        let store = &self.engine.store;
        let mut staged = Vec::with_capacity(batch.len());
        for record in batch {
            let key = store.key_for(&record.class, record.id)?;
            let (handle, is_new) = match store.find_key(&key) {
                Some(handle) => {
                    let cached = handle.class();
                    if cached != record.class {
                        warn!(%key, %cached, stored = %record.class, "class changed in database; keeping cached object");
                    }
                    if !self.registered.contains_key(&key) && !self.prior.contains_key(&key) {
                        let prior = Prior {
                            object: handle.read().clone(),
                            record: store.record(&key),
                            handle: handle.clone(),
                        };
                        self.prior.insert(key, prior);
                    }
                    (handle, false)
                }
                None => {
                    let handle = store.register_with_id(DomainObject::new(record.class.clone()), record.id)?;
                    self.registered.insert(key, handle.clone());
                    (handle, true)
                }
            };
            staged.push((handle, record, is_new));
        }
        for (handle, record, is_new) in staged {
            self.apply(handle, record, is_new)?;
        }
        Ok(())
    }

    fn apply(&mut self, handle: Handle, record: RawRecord, is_new: bool) -> EngineResult<()> {
        let engine = self.engine;
        let class = handle.class();
        let fields = engine.schema.fields(&class)?;
        let defs: Vec<&FieldDef> = fields.iter().map(|(_, def)| *def).collect();

        let mut incoming: BTreeMap<String, FieldValue> = BTreeMap::new();
        let mut order_keys: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        let mut errors = Vec::new();
        for def in &defs {
            match incoming_value(def, &record, &mut order_keys) {
                Ok(value) => {
                    incoming.insert(def.name.clone(), value);
                }
                Err(message) => {
                    warn!(key = %handle.key(), field = %def.name, %message, "cannot convert column value");
                    errors.push(FieldError::critical(&def.name, FieldErrorKind::Conversion(message)));
                }
            }
        }

        let baseline = if is_new { None } else { engine.store.record(handle.key()) };
        let mut changes = diff_fields(baseline.as_ref(), &incoming, defs.iter().copied());
        changes.retain(|change| incoming.contains_key(&change.field));
        if !is_new {
            self.heal_drift(&handle, &defs, &incoming, &mut changes);
        }

        let mut assignments = Vec::with_capacity(changes.len());
        let mut references_changed = false;
        for change in changes {
            let Some(def) = defs.iter().find(|def| def.name == change.field) else {
                continue;
            };
            let Some(target) = def.kind.reference_target() else {
                assignments.push((change.field, change.new));
                continue;
            };
            references_changed = true;
            match change.new.as_reference() {
                Some(id) if engine.store.find(target, id).is_none() => {
                    self.unresolved.push(Unresolved {
                        child: handle.clone(),
                        field: change.field.clone(),
                        target: target.clone(),
                        id,
                    });
                    assignments.push((change.field, FieldValue::Reference(None)));
                }
                _ => assignments.push((change.field, change.new)),
            }
        }

        if is_new || !assignments.is_empty() {
            self.changed = true;
        }
        {
            let mut object = handle.write();
            for (field, value) in assignments {
                object.set(field, value);
            }
            for error in errors {
                object.push_error(error);
            }
            object.mark_stored();
        }

        let snapshot = ObjectRecord {
            values: incoming,
            order_keys,
            last_modified: record.last_modified(),
        };
        engine.store.set_record(handle.key(), snapshot)?;

        if references_changed {
            self.relinked.insert(handle.key().clone(), handle.clone());
        }
        self.touched.insert(handle.key().clone(), handle);
        Ok(())
    }

    /// A reference unchanged in the database can still be wrong in memory:
    /// if its current target is no longer registered, queue the database
    /// value again so the target is re-fetched.
    fn heal_drift(
        &self,
        handle: &Handle,
        defs: &[&FieldDef],
        incoming: &BTreeMap<String, FieldValue>,
        changes: &mut Vec<FieldChange>,
    ) {
        let store = &self.engine.store;
        for def in defs {
            let Some(target) = def.kind.reference_target() else {
                continue;
            };
            if changes.iter().any(|change| change.field == def.name) {
                continue;
            }
            let Some(stored) = incoming.get(&def.name).and_then(FieldValue::as_reference) else {
                continue;
            };
            if let Some(current) = handle.reference(&def.name) {
                if store.find(target, current).is_none() {
                    warn!(key = %handle.key(), field = %def.name, %current, %stored, "reference target vanished; re-verifying");
                    changes.push(FieldChange {
                        field: def.name.clone(),
                        old: Some(FieldValue::Reference(Some(current))),
                        new: FieldValue::Reference(Some(stored)),
                    });
                }
            }
        }
    }

    fn resolve(&mut self, pending: Vec<Unresolved>) {
        let store = &self.engine.store;
        for item in pending {
            if store.find(&item.target, item.id).is_none() {
                warn!(
                    child = %item.child.key(),
                    field = %item.field,
                    target = %item.target,
                    id = %item.id,
                    "referenced object not found; reference left empty"
                );
                continue;
            }
            let mut object = item.child.write();
            if object.reference(&item.field).is_none() {
                object.set(item.field.clone(), FieldValue::Reference(Some(item.id)));
                drop(object);
                self.relinked.insert(item.child.key().clone(), item.child.clone());
            }
        }
    }

    /// Undo everything this run did to the store.
    fn repair(self) {
        let store = &self.engine.store;
        debug!(
            registered = self.registered.len(),
            restored = self.prior.len(),
            "restoring store after failed load"
        );
        for handle in self.registered.values() {
            store.unregister(handle);
        }
        for (key, prior) in self.prior {
            *prior.handle.write() = prior.object;
            if let Err(e) = store.replace_record(&key, prior.record) {
                warn!(%key, error = %e, "cannot restore record");
            }
            store.sync_accumulations(&prior.handle);
        }
    }

    fn finish(self) -> LoadOutcome {
        for handle in self.relinked.values() {
            self.engine.store.sync_accumulations(handle);
        }
        LoadOutcome {
            changed: self.changed,
            objects: self.touched.into_values().collect(),
        }
    }
}

fn incoming_value(
    def: &FieldDef,
    record: &RawRecord,
    order_keys: &mut BTreeMap<String, Vec<i64>>,
) -> Result<FieldValue, String> {
    if !def.is_complex() {
        return from_column(def, record.columns.get(&def.column).unwrap_or(&Value::Null));
    }
    let Some(data) = record.entries.get(&def.name) else {
        return Ok(def.kind.empty_value());
    };
    if !def.kind.accepts(&data.value) {
        return Err(format!("entries of {} do not fit the field kind", def.name));
    }
    if matches!(data.value, FieldValue::List(_)) {
        order_keys.insert(def.name.clone(), data.order_keys.clone());
    }
    Ok(data.value.clone())
}
