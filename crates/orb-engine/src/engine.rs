//! The engine facade and its construction.

use std::sync::Arc;

use orb_cache::{
    CacheError, CacheResult, DomainObject, Handle, IdSource, ObjectStore, StoreKey,
};
use orb_schema::Schema;
use orb_sql::Database;
use orb_types::{ClassName, FieldValue, ObjectId};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::guard::{AllowAll, DeleteGuard};
use crate::horizon::{Clock, SystemClock};
use crate::load::LoadOutcome;
use crate::selector::ClassSelector;

/// Draws object ids from a database sequence shared by every instance.
struct SequenceIds {
    db: Arc<dyn Database>,
    sequence: String,
}

impl IdSource for SequenceIds {
    fn next_id(&self) -> CacheResult<ObjectId> {
        let raw = self
            .db
            .next_id(&self.sequence)
            .map_err(|e| CacheError::IdSource(e.to_string()))?;
        ObjectId::new(raw).map_err(|e| CacheError::IdSource(e.to_string()))
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    schema: Arc<Schema>,
    db: Arc<dyn Database>,
    config: EngineConfig,
    delete_guard: Arc<dyn DeleteGuard>,
    clock: Arc<dyn Clock>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn delete_guard(mut self, guard: impl DeleteGuard + 'static) -> Self {
        self.delete_guard = Arc::new(guard);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> EngineResult<Engine> {
        self.config.validate()?;
        let ids = SequenceIds {
            db: Arc::clone(&self.db),
            sequence: self.config.id_sequence.clone(),
        };
        let store = ObjectStore::new(Arc::clone(&self.schema), Arc::new(ids));
        info!(instance = %self.config.instance_name, "engine ready");
        Ok(Engine {
            schema: self.schema,
            db: self.db,
            store,
            config: self.config,
            delete_guard: self.delete_guard,
            clock: self.clock,
        })
    }
}

/// One controller instance: schema, database, object store and policies.
///
/// Several engines may share a database; each has its own store.
pub struct Engine {
    pub(crate) schema: Arc<Schema>,
    pub(crate) db: Arc<dyn Database>,
    pub(crate) store: ObjectStore,
    pub(crate) config: EngineConfig,
    pub(crate) delete_guard: Arc<dyn DeleteGuard>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn builder(schema: impl Into<Arc<Schema>>, db: Arc<dyn Database>) -> EngineBuilder {
        EngineBuilder {
            schema: schema.into(),
            db,
            config: EngineConfig::default(),
            delete_guard: Arc::new(AllowAll),
            clock: Arc::new(SystemClock),
        }
    }

    /// Engine with default configuration and policies.
    pub fn new(schema: impl Into<Arc<Schema>>, db: Arc<dyn Database>) -> EngineResult<Self> {
        Self::builder(schema, db).build()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn find(&self, class: impl Into<ClassName>, id: ObjectId) -> Option<Handle> {
        self.store.find(&class.into(), id)
    }

    /// Set a field through the store so accumulations stay in step.
    pub fn set(
        &self,
        handle: &Handle,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> EngineResult<Option<FieldValue>> {
        Ok(self.store.set_field(handle, field, value)?)
    }

    /// Register a new object and save it. The object is unregistered again
    /// if the save fails.
    pub fn create_and_save(&self, object: DomainObject) -> EngineResult<Handle> {
        let handle = self.store.register(object)?;
        match self.save(&handle) {
            Ok(_) => Ok(handle),
            Err(e) => {
                self.store.unregister(&handle);
                Err(e)
            }
        }
    }

    /// Load every base class through the configured data horizon, then
    /// evict stored objects that were neither loaded nor referenced,
    /// repeating until no more qualify.
    pub fn synchronize(&self) -> EngineResult<LoadOutcome> {
        let horizon = self.config.data_horizon();
        let mut outcome = LoadOutcome::default();
        for class in self.schema.base_classes() {
            let loaded = self.load(&ClassSelector::new(class.name.clone()), horizon.as_ref())?;
            outcome.merge(loaded);
        }

        let kept: std::collections::BTreeSet<StoreKey> =
            outcome.objects.iter().map(|h| h.key().clone()).collect();
        let mut evicted = 0;
        loop {
            let victims: Vec<Handle> = self
                .store
                .handles()
                .into_iter()
                .filter(|h| {
                    h.is_stored() && !kept.contains(h.key()) && !self.store.is_referenced(h.key())
                })
                .collect();
            if victims.is_empty() {
                break;
            }
            for victim in victims {
                debug!(key = %victim.key(), "evicting object");
                if self.store.unregister(&victim) {
                    evicted += 1;
                }
            }
        }
        info!(
            loaded = outcome.objects.len(),
            evicted,
            changed = outcome.changed,
            "synchronized"
        );
        Ok(outcome)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("instance", &self.config.instance_name)
            .field("store", &self.store)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::fixture::{self, id, seed};
    use chrono::Duration;
    use orb_sql::{Filter, Transaction};

    fn remove_row(db: &orb_sql::InMemoryDatabase, table: &str, id: i64) {
        let mut tx = db.begin().unwrap();
        tx.delete(table, &Filter::eq("id", id)).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn builder_rejects_invalid_config() {
        let db = fixture::database();
        let config = EngineConfig {
            order_increment: 0,
            ..fixture::config("bad")
        };

        let err = fixture::builder(&db).config(config).build().unwrap_err();

        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn new_objects_draw_ids_from_the_shared_sequence() {
        let db = fixture::database();
        let first = fixture::engine_on(&db);
        let second = fixture::engine_on(&db);

        let a = first.create_and_save(DomainObject::new("Task").with("title", "a")).unwrap();
        let b = second.create_and_save(DomainObject::new("Task").with("title", "b")).unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(db.row_count("tasks").unwrap(), 2);
    }

    #[test]
    fn synchronize_loads_everything_and_evicts_deleted_rows() {
        let (engine, db) = fixture::engine();
        seed(&db, "customers", &[("id", 1.into()), ("class", "Customer".into()), ("name", "Ada".into())]);
        seed(&db, "customers", &[("id", 2.into()), ("class", "Customer".into()), ("name", "Bob".into())]);
        seed(&db, "orders", &[("id", 3.into()), ("class", "Order".into()), ("customer", 1.into())]);
        let pending = engine.store().register(DomainObject::new("Task").with("title", "draft")).unwrap();

        let outcome = engine.synchronize().unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.len(), 3);

        remove_row(&db, "customers", 2);
        remove_row(&db, "orders", 3);
        let outcome = engine.synchronize().unwrap();

        assert!(!outcome.changed);
        assert!(engine.find("Customer", id(1)).is_some());
        assert!(engine.find("Customer", id(2)).is_none());
        assert!(engine.find("Order", id(3)).is_none());
        assert!(engine.store().is_registered(&pending));
    }

    #[test]
    fn synchronize_keeps_stale_objects_that_are_still_referenced() {
        let db = fixture::database();
        let clock = Arc::new(crate::horizon::ManualClock::new(fixture::start()));
        let engine = fixture::builder(&db)
            .config(EngineConfig {
                data_horizon_secs: Some(7 * 24 * 3600),
                ..fixture::config("sync")
            })
            .clock(clock.clone())
            .build()
            .unwrap();
        let stale = fixture::start() - Duration::days(30);
        for (customer, name) in [(1, "Referenced"), (2, "Forgotten")] {
            seed(
                &db,
                "customers",
                &[("id", customer.into()), ("class", "Customer".into()), ("name", name.into()), ("last_modified", stale.into())],
            );
        }
        seed(&db, "orders", &[("id", 3.into()), ("class", "Order".into()), ("customer", 1.into())]);

        engine.synchronize().unwrap();

        assert!(engine.find("Customer", id(1)).is_some());
        assert!(engine.find("Customer", id(2)).is_none());

        clock.advance(Duration::days(1));
        engine.synchronize().unwrap();
        assert!(engine.find("Customer", id(1)).is_some());
    }
}
