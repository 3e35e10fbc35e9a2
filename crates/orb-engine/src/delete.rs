//! Deleting objects together with everything that references them.

use std::collections::BTreeSet;

use orb_cache::{Handle, ObjectRecord, StoreKey};
use orb_schema::{ID_COLUMN, OWNER_COLUMN};
use orb_sql::{Filter, Row, Transaction};
use orb_types::{FieldValue, Value};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::EngineResult;

impl Engine {
    /// Delete `handle` and, first, every registered object that references
    /// it, transitively.
    ///
    /// Returns `Ok(false)` without touching anything if the delete guard
    /// refuses any object in that set. Deleting an object that is no longer
    /// registered is a no-op returning `Ok(true)`. On failure the
    /// transaction is rolled back and every object is registered again.
    pub fn delete(&self, handle: &Handle) -> EngineResult<bool> {
        if !self.store.is_registered(handle) {
            debug!(key = %handle.key(), "object already gone");
            return Ok(true);
        }

        let doomed = self.dependents(handle);
        if let Some(refused) = doomed
            .iter()
            .find(|victim| !self.delete_guard.may_delete(&victim.read()))
        {
            info!(key = %handle.key(), refused = %refused.key(), "delete refused");
            return Ok(false);
        }

        let mut tx = self.db.begin()?;
        let mut removed = Vec::with_capacity(doomed.len());
        let outcome = match self.delete_all(tx.as_mut(), &doomed, &mut removed) {
            Ok(()) => tx.commit().map_err(Into::into),
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        };

        if let Err(e) = outcome {
            warn!(key = %handle.key(), error = %e, "delete failed; restoring objects");
            for (victim, record) in removed.into_iter().rev() {
                if let Err(err) = self.store.reregister(&victim) {
                    warn!(key = %victim.key(), error = %err, "cannot restore object");
                    continue;
                }
                if let Some(record) = record {
                    if let Err(err) = self.store.set_record(victim.key(), record) {
                        warn!(key = %victim.key(), error = %err, "cannot restore record");
                    }
                }
            }
            handle.write().set_failure(e.to_string());
            return Err(e);
        }

        info!(key = %handle.key(), objects = doomed.len(), "deleted");
        Ok(true)
    }

    /// `handle` and all registered objects referencing it, transitively,
    /// each after everything that references it.
    fn dependents(&self, handle: &Handle) -> Vec<Handle> {
        let mut seen: BTreeSet<StoreKey> = BTreeSet::new();
        let mut order = Vec::new();
        let mut stack = vec![(handle.clone(), false)];
        seen.insert(handle.key().clone());
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            let children = self.store.children(current.key());
            stack.push((current, true));
            for child in children {
                if seen.insert(child.key().clone()) {
                    stack.push((child, false));
                }
            }
        }
        order
    }

    fn delete_all(
        &self,
        tx: &mut dyn Transaction,
        doomed: &[Handle],
        removed: &mut Vec<(Handle, Option<ObjectRecord>)>,
    ) -> EngineResult<()> {
        for (position, victim) in doomed.iter().enumerate() {
            let record = self.store.record(victim.key());
            self.store.unregister(victim);
            let stored = victim.is_stored();
            removed.push((victim.clone(), record));
            if !stored {
                continue;
            }
            for other in &doomed[position + 1..] {
                self.clear_references(tx, other, victim)?;
            }
            self.delete_rows(tx, victim)?;
        }
        Ok(())
    }

    /// Null the columns of `referrer` that still point at `target`, so the
    /// target row can go before the referrer's.
    fn clear_references(&self, tx: &mut dyn Transaction, referrer: &Handle, target: &Handle) -> EngineResult<()> {
        if !referrer.is_stored() {
            return Ok(());
        }
        let persisted = self.store.record(referrer.key());
        let target_root = &target.key().root;
        for layer in self.schema.layers(&referrer.class())? {
            let mut row = Row::new();
            for def in layer.reference_fields() {
                let Some(class) = def.kind.reference_target() else {
                    continue;
                };
                if &self.schema.root_of(class)?.name != target_root {
                    continue;
                }
                let points_at = match &persisted {
                    Some(record) => record.get(&def.name).and_then(FieldValue::as_reference),
                    None => referrer.reference(&def.name),
                };
                if points_at == Some(target.id()) {
                    row.insert(def.column.clone(), Value::Null);
                }
            }
            if !row.is_empty() {
                debug!(referrer = %referrer.key(), target = %target.key(), table = %layer.table, "clearing references before delete");
                tx.update(&layer.table, &row, &Filter::eq(ID_COLUMN, referrer.id()))?;
            }
        }
        Ok(())
    }

    fn delete_rows(&self, tx: &mut dyn Transaction, victim: &Handle) -> EngineResult<()> {
        let layers = self.schema.layers(&victim.class())?;
        for layer in layers.iter().rev() {
            for def in layer.complex_fields() {
                if let Some(table) = def.entry_table_name() {
                    tx.delete(table, &Filter::eq(OWNER_COLUMN, victim.id()))?;
                }
            }
            let rows = tx.delete(&layer.table, &Filter::eq(ID_COLUMN, victim.id()))?;
            if rows == 0 {
                debug!(key = %victim.key(), table = %layer.table, "row already deleted");
            }
        }
        Ok(())
    }
}
