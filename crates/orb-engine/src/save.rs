//! Saving objects.
//!
//! A save writes the difference between an object's fields and its last
//! persisted record, one layer table at a time, inside one transaction.
//! New objects are inserted base layer first; existing ones are updated
//! derived layer first.
//!
//! References decide the order of inserts. An unsaved parent behind a
//! non-nullable reference is saved before the child row is inserted. An
//! unsaved parent behind a nullable reference is written as NULL, the
//! parent is saved after the child, and the column is set afterwards. A
//! chain of non-nullable references that loops back on itself cannot be
//! inserted and fails the save.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use orb_cache::{diff_fields, FieldChange, Handle, ObjectRecord, StoreKey};
use orb_schema::{ClassDef, FieldDef, CLASS_COLUMN, ID_COLUMN, LAST_MODIFIED_COLUMN};
use orb_sql::{DbError, Filter, Row, Select, Transaction};
use orb_types::{ClassName, FieldError, FieldErrorKind, FieldValue, Value};
use tracing::{debug, warn};

use crate::convert::{from_column, to_column, truncate};
use crate::engine::Engine;
use crate::entries::{sync_entries, Persisted};
use crate::error::{EngineError, EngineResult};

/// A nullable reference written as NULL until its parent is inserted.
struct Relink<'e> {
    child: Handle,
    layer: &'e ClassDef,
    def: &'e FieldDef,
    parent: Handle,
}

/// One column about to be written.
struct ColumnWrite<'e> {
    def: &'e FieldDef,
    value: Value,
    /// What the record holds once the write succeeds.
    recorded: FieldValue,
}

/// State of one save transaction.
struct SaveRun<'e, 't> {
    engine: &'e Engine,
    tx: &'t mut dyn Transaction,
    now: DateTime<Utc>,
    /// Objects whose save is in progress, innermost last.
    saving: Vec<StoreKey>,
    /// Objects finished in this run.
    done: BTreeSet<StoreKey>,
    /// Objects inserted in this run.
    inserted: BTreeSet<StoreKey>,
    /// Records to publish once the transaction commits.
    staged: BTreeMap<StoreKey, (Handle, ObjectRecord)>,
    relinks: Vec<Relink<'e>>,
    /// Objects whose references were reset from the database.
    resynced: Vec<Handle>,
    /// Truncated field values, applied to the objects after commit.
    truncated: BTreeMap<(StoreKey, String), (Handle, FieldValue)>,
}

/// What a successful run leaves to publish.
struct Staged {
    inserted: BTreeSet<StoreKey>,
    records: BTreeMap<StoreKey, (Handle, ObjectRecord)>,
    resynced: Vec<Handle>,
    truncated: BTreeMap<(StoreKey, String), (Handle, FieldValue)>,
}

impl Engine {
    /// Persist `handle` and whatever it needs inserted first.
    ///
    /// Returns `true` if any statement was written. On failure the
    /// transaction is rolled back, nothing is marked stored, and the
    /// object carries the reason in [`DomainObject::failure`] plus
    /// field-level errors where a column could be blamed.
    ///
    /// [`DomainObject::failure`]: orb_cache::DomainObject::failure
    pub fn save(&self, handle: &Handle) -> EngineResult<bool> {
        let mut tx = self.db.begin()?;
        let mut run = SaveRun::new(self, tx.as_mut());
        let result = run.save_object(handle);
        let staged = run.finish();

        let outcome = match result {
            Ok(changed) => tx.commit().map(|()| changed).map_err(EngineError::from),
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        };

        match outcome {
            Ok(changed) => {
                self.publish(staged);
                debug!(key = %handle.key(), changed, "saved");
                Ok(changed)
            }
            Err(e) => {
                if e.is_unique_violation() {
                    debug!(key = %handle.key(), error = %e, "save lost a uniqueness race");
                } else {
                    warn!(key = %handle.key(), error = %e, "save failed");
                }
                handle.write().set_failure(e.to_string());
                Err(e)
            }
        }
    }

    fn publish(&self, staged: Staged) {
        for (key, (handle, record)) in staged.records {
            if let Err(e) = self.store.set_record(&key, record) {
                warn!(%key, error = %e, "saved object left the store before its record was published");
                continue;
            }
            if staged.inserted.contains(&key) {
                handle.write().mark_stored();
            }
        }
        for ((_, field), (handle, value)) in staged.truncated {
            handle.write().set(field, value);
        }
        for handle in &staged.resynced {
            self.store.sync_accumulations(handle);
        }
    }
}

impl<'e, 't> SaveRun<'e, 't> {
    fn new(engine: &'e Engine, tx: &'t mut dyn Transaction) -> Self {
        Self {
            engine,
            tx,
            now: engine.clock.now(),
            saving: Vec::new(),
            done: BTreeSet::new(),
            inserted: BTreeSet::new(),
            staged: BTreeMap::new(),
            relinks: Vec::new(),
            resynced: Vec::new(),
            truncated: BTreeMap::new(),
        }
    }

    fn finish(self) -> Staged {
        for relink in &self.relinks {
            warn!(
                child = %relink.child.key(),
                field = %relink.def.name,
                parent = %relink.parent.key(),
                "deferred reference left empty: parent was never inserted"
            );
        }
        Staged {
            inserted: self.inserted,
            records: self.staged,
            resynced: self.resynced,
            truncated: self.truncated,
        }
    }

    fn is_persisted(&self, handle: &Handle) -> bool {
        self.inserted.contains(handle.key()) || handle.is_stored()
    }

    fn save_object(&mut self, handle: &Handle) -> EngineResult<bool> {
        let key = handle.key().clone();
        if self.saving.contains(&key) {
            debug!(%key, "already being saved further up");
            return Ok(false);
        }
        if self.done.contains(&key) {
            return Ok(false);
        }
        if !self.engine.store.is_registered(handle) {
            return Err(EngineError::NotRegistered(key));
        }

        handle.write().clear_errors();
        self.saving.push(key.clone());
        let result = self.write_object(handle);
        self.saving.pop();
        let changed = result?;
        self.done.insert(key);
        self.flush_relinks()?;
        Ok(changed)
    }

    fn write_object(&mut self, handle: &Handle) -> EngineResult<bool> {
        let engine = self.engine;
        let key = handle.key().clone();
        let (class, current) = {
            let object = handle.read();
            (object.class().clone(), object.fields().clone())
        };
        let is_new = !self.is_persisted(handle);
        let baseline = if is_new {
            None
        } else {
            self.staged
                .get(&key)
                .map(|(_, record)| record.clone())
                .or_else(|| engine.store.record(&key))
        };
        let mut record = baseline.clone().unwrap_or_default();

        let mut layers = engine.schema.layers(&class)?;
        if !is_new {
            layers.reverse();
        }

        let mut changed = false;
        let mut deferred = Vec::new();
        for layer in layers {
            let changes = diff_fields(baseline.as_ref(), &current, &layer.fields);
            let (complex, columns): (Vec<FieldChange>, Vec<FieldChange>) = changes
                .into_iter()
                .partition(|change| layer.get(&change.field).is_some_and(FieldDef::is_complex));

            let mut writes = Vec::with_capacity(columns.len());
            for change in &columns {
                let Some(def) = layer.get(&change.field) else {
                    continue;
                };
                if let Some(write) = self.prepare(handle, layer, def, change, is_new, &mut deferred)? {
                    writes.push(write);
                }
            }

            if is_new {
                self.insert_layer(handle, &class, layer, &writes)?;
                changed = true;
                for write in writes {
                    record.set(&write.def.name, write.recorded);
                }
            } else {
                let stamp = layer.is_base() && (changed || !writes.is_empty() || !complex.is_empty());
                if !writes.is_empty() || stamp {
                    changed |= self.update_layer(handle, layer, writes, stamp, &mut record)?;
                }
            }

            for change in &complex {
                let Some(def) = layer.get(&change.field) else {
                    continue;
                };
                let persisted = match (&baseline, is_new) {
                    (_, true) => Persisted::Nothing,
                    (Some(base), false) => match base.get(&def.name) {
                        Some(value) => Persisted::Known {
                            value,
                            order_keys: base.order_keys(&def.name),
                        },
                        None => Persisted::Unknown,
                    },
                    (None, false) => Persisted::Unknown,
                };
                let keys = sync_entries(
                    &mut *self.tx,
                    handle.id(),
                    def,
                    persisted,
                    &change.new,
                    engine.config.order_increment,
                )?;
                record.set(&def.name, change.new.clone());
                if let Some(keys) = keys {
                    record.set_order_keys(&def.name, keys);
                }
                changed = true;
            }
        }

        if is_new {
            record.last_modified = Some(self.now);
            self.inserted.insert(key.clone());
            debug!(%key, "inserted");
        }
        self.staged.insert(key, (handle.clone(), record));

        for parent in deferred {
            self.save_object(&parent)?;
        }
        Ok(changed)
    }

    /// Column value for one changed field, or `None` if the column must be
    /// skipped.
    fn prepare(
        &mut self,
        handle: &Handle,
        layer: &'e ClassDef,
        def: &'e FieldDef,
        change: &FieldChange,
        is_new: bool,
        deferred: &mut Vec<Handle>,
    ) -> EngineResult<Option<ColumnWrite<'e>>> {
        if let Some(target) = def.kind.reference_target() {
            if let Some(parent_id) = change.new.as_reference() {
                let parent = self.engine.store.find(target, parent_id).ok_or_else(|| {
                    EngineError::DanglingReference {
                        key: handle.key().clone(),
                        field: def.name.clone(),
                        target: target.clone(),
                        id: parent_id,
                    }
                })?;
                if !self.is_persisted(&parent) {
                    if def.nullable {
                        debug!(child = %handle.key(), field = %def.name, parent = %parent.key(), "deferring reference to unsaved parent");
                        self.relinks.push(Relink {
                            child: handle.clone(),
                            layer,
                            def,
                            parent: parent.clone(),
                        });
                        deferred.push(parent);
                        return Ok(Some(ColumnWrite {
                            def,
                            value: Value::Null,
                            recorded: FieldValue::Reference(None),
                        }));
                    }
                    self.save_object(&parent)?;
                    if !self.is_persisted(&parent) {
                        handle
                            .write()
                            .push_error(FieldError::critical(&def.name, FieldErrorKind::ForeignKey));
                        return Err(EngineError::UnsavableCycle {
                            key: handle.key().clone(),
                            field: def.name.clone(),
                            parent: parent.key().clone(),
                        });
                    }
                }
            }
        }

        let mut value = match to_column(def, &change.new) {
            Ok(value) => value,
            Err(message) => {
                handle
                    .write()
                    .push_error(FieldError::critical(&def.name, FieldErrorKind::Conversion(message)));
                return Ok(None);
            }
        };

        if value.is_null() && !def.nullable {
            handle
                .write()
                .push_error(FieldError::critical(&def.name, FieldErrorKind::NotNull));
            if is_new {
                return Err(DbError::NotNullViolation {
                    table: layer.table.clone(),
                    column: def.column.clone(),
                }
                .into());
            }
            return Ok(None);
        }

        let mut recorded = change.new.clone();
        if let Some(max) = def.max_length {
            if let Some(actual) = truncate(&mut value, max) {
                warn!(key = %handle.key(), field = %def.name, max, actual, "value truncated");
                recorded = FieldValue::Scalar(value.clone());
                self.truncated.insert(
                    (handle.key().clone(), def.name.clone()),
                    (handle.clone(), recorded.clone()),
                );
                handle
                    .write()
                    .push_error(FieldError::warning(&def.name, FieldErrorKind::Truncated { max, actual }));
            }
        }
        Ok(Some(ColumnWrite { def, value, recorded }))
    }

    fn insert_layer(
        &mut self,
        handle: &Handle,
        class: &ClassName,
        layer: &ClassDef,
        writes: &[ColumnWrite<'_>],
    ) -> EngineResult<()> {
        let mut row = Row::new();
        row.insert(ID_COLUMN.to_string(), Value::from(handle.id()));
        if layer.is_base() {
            row.insert(CLASS_COLUMN.to_string(), Value::from(class.as_str()));
            row.insert(LAST_MODIFIED_COLUMN.to_string(), Value::from(self.now));
        }
        for write in writes {
            row.insert(write.def.column.clone(), write.value.clone());
        }
        self.tx.insert(&layer.table, &row).map_err(|e| {
            blame(handle, layer, &e);
            EngineError::from(e)
        })
    }

    /// Update one layer row. A rejected multi-column update is retried one
    /// column at a time; columns the database still rejects get a field
    /// error and their field is reset to the value in the database.
    fn update_layer(
        &mut self,
        handle: &Handle,
        layer: &ClassDef,
        writes: Vec<ColumnWrite<'_>>,
        stamp: bool,
        record: &mut ObjectRecord,
    ) -> EngineResult<bool> {
        let filter = Filter::eq(ID_COLUMN, handle.id());
        let mut row: Row = writes
            .iter()
            .map(|write| (write.def.column.clone(), write.value.clone()))
            .collect();
        if stamp {
            row.insert(LAST_MODIFIED_COLUMN.to_string(), Value::from(self.now));
        }

        match self.tx.update(&layer.table, &row, &filter) {
            Ok(0) => Err(EngineError::MissingRow(handle.key().clone())),
            Ok(_) => {
                for write in writes {
                    record.set(&write.def.name, write.recorded);
                }
                if stamp {
                    record.last_modified = Some(self.now);
                }
                Ok(true)
            }
            Err(e) if e.is_constraint_violation() => {
                debug!(key = %handle.key(), table = %layer.table, error = %e, "update rejected; retrying column by column");
                let mut any = false;
                if stamp {
                    let single: Row = [(LAST_MODIFIED_COLUMN.to_string(), Value::from(self.now))]
                        .into_iter()
                        .collect();
                    self.tx.update(&layer.table, &single, &filter)?;
                    record.last_modified = Some(self.now);
                    any = true;
                }
                for write in writes {
                    let single: Row = [(write.def.column.clone(), write.value.clone())]
                        .into_iter()
                        .collect();
                    match self.tx.update(&layer.table, &single, &filter) {
                        Ok(_) => {
                            record.set(&write.def.name, write.recorded);
                            any = true;
                        }
                        Err(e) if e.is_constraint_violation() => {
                            warn!(key = %handle.key(), field = %write.def.name, error = %e, "column rejected");
                            handle
                                .write()
                                .push_error(FieldError::critical(&write.def.name, classify(&e)));
                            let actual = self.read_back(handle, layer, write.def)?;
                            self.truncated.remove(&(handle.key().clone(), write.def.name.clone()));
                            handle.write().set(write.def.name.clone(), actual.clone());
                            record.set(&write.def.name, actual);
                            if write.def.is_reference() {
                                self.resynced.push(handle.clone());
                            }
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(any)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read_back(&mut self, handle: &Handle, layer: &ClassDef, def: &FieldDef) -> EngineResult<FieldValue> {
        let rows = self.tx.select(
            &Select::from(&layer.table)
                .columns([def.column.as_str()])
                .filter(Filter::eq(ID_COLUMN, handle.id())),
        )?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::MissingRow(handle.key().clone()))?;
        from_column(def, row.get(&def.column).unwrap_or(&Value::Null)).map_err(|message| {
            EngineError::Conversion {
                class: layer.name.clone(),
                field: def.name.clone(),
                message,
            }
        })
    }

    /// Write deferred references whose child and parent now both exist.
    fn flush_relinks(&mut self) -> EngineResult<()> {
        let pending = std::mem::take(&mut self.relinks);
        for relink in pending {
            if !(self.is_persisted(&relink.child) && self.is_persisted(&relink.parent)) {
                self.relinks.push(relink);
                continue;
            }
            let row: Row = [(relink.def.column.clone(), Value::from(relink.parent.id()))]
                .into_iter()
                .collect();
            let updated = self
                .tx
                .update(&relink.layer.table, &row, &Filter::eq(ID_COLUMN, relink.child.id()))?;
            if updated == 0 {
                return Err(EngineError::MissingRow(relink.child.key().clone()));
            }
            debug!(child = %relink.child.key(), field = %relink.def.name, parent = %relink.parent.key(), "deferred reference written");
            if let Some((_, record)) = self.staged.get_mut(relink.child.key()) {
                record.set(&relink.def.name, FieldValue::Reference(Some(relink.parent.id())));
            }
        }
        Ok(())
    }
}

/// Attach a field error for a rejected statement to the field owning the
/// offending column.
fn blame(handle: &Handle, layer: &ClassDef, error: &DbError) {
    if !error.is_constraint_violation() {
        return;
    }
    let field = error
        .column()
        .map(|column| {
            layer
                .field_for_column(column)
                .map(|def| def.name.clone())
                .unwrap_or_else(|| column.to_string())
        })
        .unwrap_or_else(|| ID_COLUMN.to_string());
    handle
        .write()
        .push_error(FieldError::critical(field, classify(error)));
}

fn classify(error: &DbError) -> FieldErrorKind {
    match error {
        DbError::NotNullViolation { .. } => FieldErrorKind::NotNull,
        DbError::UniqueViolation { .. } => FieldErrorKind::Unique,
        DbError::ValueTooLong { max, actual, .. } => FieldErrorKind::TooLong {
            max: *max,
            actual: *actual,
        },
        DbError::ForeignKeyViolation { .. } | DbError::RestrictViolation { .. } => {
            FieldErrorKind::ForeignKey
        }
        other => FieldErrorKind::Database(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{self, id, row, seed};
    use crate::selector::IdSelector;
    use orb_cache::DomainObject;
    use orb_sql::StatementKind;

    fn customer(name: &str) -> DomainObject {
        DomainObject::new("Customer").with("name", name)
    }

    // ---- Inserts ----

    #[test]
    fn new_object_is_inserted_and_marked_stored() {
        let (engine, db) = fixture::engine();
        let handle = engine.store().register(customer("Ada").with("email", "ada@example.com")).unwrap();

        assert!(engine.save(&handle).unwrap());

        assert!(handle.is_stored());
        let stored = row(&db, "customers", handle.id().get()).unwrap();
        assert_eq!(stored["name"], Value::from("Ada"));
        assert_eq!(stored["class"], Value::from("Customer"));
        assert_eq!(stored["last_modified"], Value::from(fixture::start()));
        let record = engine.store().record(handle.key()).unwrap();
        assert_eq!(record.get("name"), Some(&FieldValue::from("Ada")));
        assert_eq!(record.last_modified, Some(fixture::start()));
    }

    #[test]
    fn saved_object_reloads_equal() {
        let (engine, db) = fixture::engine();
        let vip = DomainObject::new("VipCustomer")
            .with("name", "Grace")
            .with("tier", 2)
            .with("perks", FieldValue::List(vec!["lounge".into(), "parking".into()]))
            .with("tags", FieldValue::Set(["a".into(), "b".into()].into_iter().collect()));
        let handle = engine.create_and_save(vip).unwrap();
        let expected = handle.read().fields().clone();

        let other = fixture::engine_on(&db);
        other.load(&IdSelector::new("Customer", [handle.id()]), None).unwrap();

        let loaded = other.find("Customer", handle.id()).unwrap();
        assert_eq!(loaded.class(), ClassName::from("VipCustomer"));
        for (field, value) in expected {
            assert_eq!(loaded.get(&field).as_ref(), Some(&value), "field {field}");
        }
    }

    #[test]
    fn missing_required_field_fails_before_the_insert() {
        let (engine, db) = fixture::engine();
        let handle = engine.store().register(DomainObject::new("Customer")).unwrap();

        let err = engine.save(&handle).unwrap_err();

        assert!(matches!(err, EngineError::Db(DbError::NotNullViolation { .. })));
        assert!(!handle.is_stored());
        assert!(!handle.is_valid());
        assert_eq!(handle.read().errors()[0].kind, FieldErrorKind::NotNull);
        assert_eq!(db.row_count("customers").unwrap(), 0);
        assert_eq!(db.stats().inserts, 0);
    }

    #[test]
    fn long_text_is_truncated_with_a_warning() {
        let (engine, db) = fixture::engine();
        let handle = engine
            .store()
            .register(customer("Bartholomew Montgomery III"))
            .unwrap();

        engine.save(&handle).unwrap();

        let stored = row(&db, "customers", handle.id().get()).unwrap();
        assert_eq!(stored["name"], Value::from("Bartholomew Montgome"));
        assert_eq!(handle.get("name"), Some(FieldValue::from("Bartholomew Montgome")));
        assert!(handle.is_valid());
        let object = handle.read();
        assert_eq!(object.errors().len(), 1);
        assert!(!object.errors()[0].is_critical());
    }

    #[test]
    fn truncation_is_dropped_when_the_save_rolls_back() {
        let (engine, db) = fixture::engine();
        let handle = engine
            .store()
            .register(customer("Bartholomew Montgomery III"))
            .unwrap();
        db.inject_failure(StatementKind::Insert, "customers", 0);

        assert!(engine.save(&handle).is_err());
        assert_eq!(handle.get("name"), Some(FieldValue::from("Bartholomew Montgomery III")));
        assert_eq!(db.row_count("customers").unwrap(), 0);

        engine.save(&handle).unwrap();
        assert_eq!(handle.get("name"), Some(FieldValue::from("Bartholomew Montgome")));
    }

    // ---- Updates ----

    #[test]
    fn update_writes_only_changed_columns() {
        let (engine, db) = fixture::engine();
        let handle = engine.create_and_save(customer("Ada")).unwrap();
        assert!(!engine.save(&handle).unwrap());

        engine.set(&handle, "email", "ada@example.com").unwrap();
        db.reset_stats();
        assert!(engine.save(&handle).unwrap());

        let stats = db.stats();
        assert_eq!(stats.updates, 1);
        assert_eq!(stats.inserts, 0);
        let stored = row(&db, "customers", handle.id().get()).unwrap();
        assert_eq!(stored["email"], Value::from("ada@example.com"));
    }

    #[test]
    fn rejected_column_is_reset_while_the_rest_is_written() {
        let (engine, db) = fixture::engine();
        let ada = engine.create_and_save(customer("Ada").with("email", "a@x")).unwrap();
        let bob = engine.create_and_save(customer("Bob").with("email", "b@x")).unwrap();
        let _ = ada;

        engine.set(&bob, "email", "a@x").unwrap();
        engine.set(&bob, "name", "Robert").unwrap();
        assert!(engine.save(&bob).unwrap());

        let stored = row(&db, "customers", bob.id().get()).unwrap();
        assert_eq!(stored["name"], Value::from("Robert"));
        assert_eq!(stored["email"], Value::from("b@x"));
        assert_eq!(bob.get("email"), Some(FieldValue::from("b@x")));
        assert!(!bob.is_valid());
        let object = bob.read();
        assert_eq!(object.errors()[0].field, "email");
        assert_eq!(object.errors()[0].kind, FieldErrorKind::Unique);
    }

    #[test]
    fn list_reorder_touches_only_order_keys() {
        let (engine, db) = fixture::engine();
        let ada = engine.create_and_save(customer("Ada")).unwrap();
        let order = DomainObject::new("Order")
            .with("customer", ada.id())
            .with("lines", FieldValue::List(vec!["a".into(), "b".into(), "c".into()]));
        let order = engine.create_and_save(order).unwrap();

        engine
            .set(&order, "lines", FieldValue::List(vec!["c".into(), "a".into(), "b".into(), "d".into()]))
            .unwrap();
        db.reset_stats();
        engine.save(&order).unwrap();

        let stats = db.table_stats("orders_lines");
        assert_eq!((stats.inserts, stats.deletes, stats.updates), (1, 0, 4));

        let other = fixture::engine_on(&db);
        other.load(&IdSelector::new("Order", [order.id()]), None).unwrap();
        assert_eq!(
            other.find("Order", order.id()).unwrap().get("lines"),
            Some(FieldValue::List(vec!["c".into(), "a".into(), "b".into(), "d".into()]))
        );
    }

    // ---- Reference ordering ----

    #[test]
    fn unsaved_required_parent_is_inserted_first() {
        let (engine, db) = fixture::engine();
        let ada = engine.store().register(customer("Ada")).unwrap();
        let order = engine
            .store()
            .register(DomainObject::new("Order").with("customer", ada.id()))
            .unwrap();

        engine.save(&order).unwrap();

        assert!(ada.is_stored() && order.is_stored());
        let stored = row(&db, "orders", order.id().get()).unwrap();
        assert_eq!(stored["customer"], Value::from(ada.id()));
    }

    #[test]
    fn mutual_nullable_references_are_linked_after_both_inserts() {
        let (engine, db) = fixture::engine();
        let a = engine.store().register(DomainObject::new("Node").with("label", "a")).unwrap();
        let b = engine.store().register(DomainObject::new("Node").with("label", "b")).unwrap();
        engine.set(&a, "peer", b.id()).unwrap();
        engine.set(&b, "peer", a.id()).unwrap();

        engine.save(&a).unwrap();

        assert!(a.is_stored() && b.is_stored());
        assert_eq!(row(&db, "nodes", a.id().get()).unwrap()["peer"], Value::from(b.id()));
        assert_eq!(row(&db, "nodes", b.id().get()).unwrap()["peer"], Value::from(a.id()));
        assert!(!engine.save(&a).unwrap());
        assert!(!engine.save(&b).unwrap());
    }

    #[test]
    fn required_and_nullable_cycle_is_broken_on_the_nullable_side() {
        let (engine, db) = fixture::engine();
        let alpha = engine.store().register(DomainObject::new("Alpha").with("name", "a")).unwrap();
        let beta = engine.store().register(DomainObject::new("Beta").with("name", "b")).unwrap();
        engine.set(&alpha, "beta", beta.id()).unwrap();
        engine.set(&beta, "alpha", alpha.id()).unwrap();

        engine.save(&alpha).unwrap();

        assert_eq!(row(&db, "alphas", alpha.id().get()).unwrap()["beta"], Value::from(beta.id()));
        assert_eq!(row(&db, "betas", beta.id().get()).unwrap()["alpha"], Value::from(alpha.id()));
        let record = engine.store().record(beta.key()).unwrap();
        assert_eq!(record.get("alpha"), Some(&FieldValue::Reference(Some(alpha.id()))));
    }

    // ---- Failures ----

    #[test]
    fn failed_save_rolls_back_every_statement() {
        let (engine, db) = fixture::engine();
        let ada = engine.store().register(customer("Ada")).unwrap();
        let order = engine
            .store()
            .register(
                DomainObject::new("Order")
                    .with("customer", ada.id())
                    .with("lines", FieldValue::List(vec!["a".into()])),
            )
            .unwrap();
        db.inject_failure(StatementKind::Insert, "orders_lines", 0);

        let err = engine.save(&order).unwrap_err();

        assert!(matches!(err, EngineError::Db(DbError::Connection(_))));
        assert_eq!(db.row_count("customers").unwrap(), 0);
        assert_eq!(db.row_count("orders").unwrap(), 0);
        assert!(!ada.is_stored() && !order.is_stored());
        assert!(order.read().failure().is_some());

        engine.save(&order).unwrap();
        assert_eq!(db.row_count("orders_lines").unwrap(), 1);
    }

    #[test]
    fn create_and_save_unregisters_on_failure() {
        let (engine, _db) = fixture::engine();

        let err = engine.create_and_save(DomainObject::new("Customer"));

        assert!(err.is_err());
        assert!(engine.store().is_empty());
    }

    #[test]
    fn unique_clash_on_insert_is_reported_on_the_field() {
        let (engine, _db) = fixture::engine();
        engine.create_and_save(customer("Ada").with("email", "same@x")).unwrap();
        let twin = engine.store().register(customer("Eve").with("email", "same@x")).unwrap();

        let err = engine.save(&twin).unwrap_err();

        assert!(err.is_unique_violation());
        let object = twin.read();
        assert_eq!(object.errors()[0].field, "email");
        assert_eq!(object.errors()[0].kind, FieldErrorKind::Unique);
    }

    #[test]
    fn existing_rows_are_found_by_seeded_id() {
        let (engine, db) = fixture::engine();
        seed(&db, "customers", &[("id", 5.into()), ("class", "Customer".into()), ("name", "Ada".into())]);
        engine.load(&IdSelector::new("Customer", [id(5)]), None).unwrap();
        let ada = engine.find("Customer", id(5)).unwrap();

        engine.set(&ada, "name", "Ada L.").unwrap();
        engine.save(&ada).unwrap();

        assert_eq!(row(&db, "customers", 5).unwrap()["name"], Value::from("Ada L."));
    }
}
