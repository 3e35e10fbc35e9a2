//! Exclusive allocation of rows across independent instances.
//!
//! Each allocatable class is paired with a marker ("shadow") class whose
//! rows share the target's id. Claiming a target means inserting its
//! marker: the primary key lets exactly one instance win, and losers see a
//! unique violation. Releasing deletes the marker. No locks are held
//! between statements, so a crashed holder's markers stay until someone
//! deletes them.

use orb_cache::{CacheError, DomainObject, Handle};
use orb_schema::{ClassDef, ID_COLUMN};
use orb_sql::{Filter, Select};
use orb_types::{ClassName, ObjectId, Value};
use tracing::{debug, info};

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::selector::IdSelector;

/// What to allocate and which marker class guards it.
#[derive(Clone, Debug)]
pub struct AllocationRequest {
    class: ClassName,
    shadow: ClassName,
    filter: Filter,
    limit: Option<usize>,
    holder_field: Option<String>,
}

impl AllocationRequest {
    pub fn new(class: impl Into<ClassName>, shadow: impl Into<ClassName>) -> Self {
        Self {
            class: class.into(),
            shadow: shadow.into(),
            filter: Filter::All,
            limit: None,
            holder_field: None,
        }
    }

    /// Restrict candidates with a filter on the class's own table.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Text field of the marker class that receives this instance's name.
    pub fn holder_field(mut self, field: impl Into<String>) -> Self {
        self.holder_field = Some(field.into());
        self
    }

    pub fn class(&self) -> &ClassName {
        &self.class
    }

    pub fn shadow(&self) -> &ClassName {
        &self.shadow
    }
}

/// Result of one claim attempt.
#[derive(Clone, Debug)]
pub enum Allocation {
    /// This instance now holds the target.
    Acquired(Handle),
    /// Someone else, possibly this instance, holds it already.
    Contended,
    /// The target row does not exist.
    Missing,
}

impl Allocation {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Allocation::Acquired(_))
    }

    pub fn acquired(self) -> Option<Handle> {
        match self {
            Allocation::Acquired(handle) => Some(handle),
            Allocation::Contended | Allocation::Missing => None,
        }
    }
}

impl Engine {
    /// Claim up to `limit` unclaimed objects matching the request's filter.
    /// Candidates lost to another instance between select and claim are
    /// skipped, so fewer may be returned.
    pub fn allocate_exclusively(&self, request: &AllocationRequest) -> EngineResult<Vec<Handle>> {
        let shadow = self.shadow_class(request)?;
        let target = self.schema.class(&request.class)?;

        let mut tx = self.db.begin()?;
        let rows = tx.select(
            &Select::from(&target.table)
                .columns([ID_COLUMN])
                .filter(
                    request
                        .filter
                        .clone()
                        .and(Filter::not_exists_in(ID_COLUMN, &shadow.table, ID_COLUMN)),
                )
                .order_by(ID_COLUMN)
                .limit(request.limit),
        )?;
        tx.commit()?;

        let candidates: Vec<ObjectId> = rows
            .iter()
            .filter_map(|row| row.get(ID_COLUMN).and_then(Value::as_object_id))
            .collect();
        let mut acquired = Vec::with_capacity(candidates.len());
        for id in &candidates {
            if let Allocation::Acquired(handle) = self.try_allocate(request, *id)? {
                acquired.push(handle);
            }
        }
        info!(
            class = %request.class,
            candidates = candidates.len(),
            acquired = acquired.len(),
            "allocation finished"
        );
        Ok(acquired)
    }

    /// Claim one object by id.
    pub fn try_allocate(&self, request: &AllocationRequest, id: ObjectId) -> EngineResult<Allocation> {
        self.shadow_class(request)?;
        self.load(&IdSelector::new(request.class.clone(), [id]), None)?;
        let Some(target) = self.store.find(&request.class, id) else {
            debug!(class = %request.class, %id, "allocation target missing");
            return Ok(Allocation::Missing);
        };

        let mut marker = DomainObject::new(request.shadow.clone());
        if let Some(field) = &request.holder_field {
            marker = marker.with(field.clone(), self.config.instance_name.as_str());
        }
        let marker = match self.store.register_with_id(marker, id) {
            Ok(marker) => marker,
            Err(CacheError::IdTaken(key)) => {
                debug!(%key, "already held by this instance");
                return Ok(Allocation::Contended);
            }
            Err(e) => return Err(e.into()),
        };

        match self.save(&marker) {
            Ok(_) => {
                debug!(target = %target.key(), "allocated");
                Ok(Allocation::Acquired(target))
            }
            Err(e) => {
                self.store.unregister(&marker);
                if e.is_unique_violation() {
                    debug!(target = %target.key(), "held by another instance");
                    Ok(Allocation::Contended)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Give up a claim by deleting its marker. Returns `false` if there was
    /// no marker.
    pub fn release(&self, request: &AllocationRequest, target: &Handle) -> EngineResult<bool> {
        self.shadow_class(request)?;
        let marker = match self.store.find(&request.shadow, target.id()) {
            Some(marker) => marker,
            None => {
                self.load(&IdSelector::new(request.shadow.clone(), [target.id()]), None)?;
                match self.store.find(&request.shadow, target.id()) {
                    Some(marker) => marker,
                    None => return Ok(false),
                }
            }
        };
        let released = self.delete(&marker)?;
        debug!(target = %target.key(), released, "claim released");
        Ok(released)
    }

    /// Apply `update` to a claimed object, save it, then release the claim.
    /// The claim is kept if the update or the save fails.
    pub fn release_with<F>(&self, request: &AllocationRequest, target: &Handle, update: F) -> EngineResult<bool>
    where
        F: FnOnce(&Engine, &Handle) -> EngineResult<()>,
    {
        update(self, target)?;
        self.save(target)?;
        self.release(request, target)
    }

    fn shadow_class(&self, request: &AllocationRequest) -> EngineResult<&ClassDef> {
        let shadow = self.schema.class(&request.shadow)?;
        if !shadow.is_base() {
            return Err(EngineError::InvalidShadow(request.shadow.clone()));
        }
        Ok(shadow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{self, id, row, seed};

    fn seed_tasks(db: &orb_sql::InMemoryDatabase) {
        for (task, status) in [(1, "open"), (2, "open"), (3, "closed"), (4, "open"), (5, "open")] {
            seed(
                db,
                "tasks",
                &[("id", task.into()), ("class", "Task".into()), ("status", status.into())],
            );
        }
    }

    fn open_tasks() -> AllocationRequest {
        AllocationRequest::new("Task", "TaskClaim")
            .filter(Filter::eq("status", "open"))
            .holder_field("holder")
    }

    fn ids(handles: &[Handle]) -> Vec<i64> {
        handles.iter().map(|h| h.id().get()).collect()
    }

    #[test]
    fn instances_claim_disjoint_rows() {
        let db = fixture::database();
        seed_tasks(&db);
        let first = fixture::engine_on(&db);
        let second = fixture::builder(&db).config(fixture::config("second")).build().unwrap();

        let mine = first.allocate_exclusively(&open_tasks().limit(2)).unwrap();
        let theirs = second.allocate_exclusively(&open_tasks()).unwrap();

        assert_eq!(ids(&mine), vec![1, 2]);
        assert_eq!(ids(&theirs), vec![4, 5]);
        assert_eq!(row(&db, "task_claims", 1).unwrap()["holder"], Value::from("test"));
        assert_eq!(row(&db, "task_claims", 4).unwrap()["holder"], Value::from("second"));
        assert!(first.allocate_exclusively(&open_tasks()).unwrap().is_empty());
    }

    #[test]
    fn racing_instances_produce_one_winner() {
        let db = fixture::database();
        seed_tasks(&db);
        let engines: Vec<Engine> = (0..8)
            .map(|n| fixture::builder(&db).config(fixture::config(&format!("worker-{n}"))).build().unwrap())
            .collect();

        let results: Vec<Allocation> = std::thread::scope(|scope| {
            let workers: Vec<_> = engines
                .iter()
                .map(|engine| scope.spawn(move || engine.try_allocate(&open_tasks(), id(1)).unwrap()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_acquired()).count(), 1);
        assert!(results
            .iter()
            .all(|r| matches!(r, Allocation::Acquired(_) | Allocation::Contended)));
        assert_eq!(db.row_count("task_claims").unwrap(), 1);
    }

    #[test]
    fn claiming_twice_in_one_instance_is_contended() {
        let db = fixture::database();
        seed_tasks(&db);
        let engine = fixture::engine_on(&db);

        assert!(engine.try_allocate(&open_tasks(), id(2)).unwrap().is_acquired());
        assert!(matches!(
            engine.try_allocate(&open_tasks(), id(2)).unwrap(),
            Allocation::Contended
        ));
        assert!(matches!(
            engine.try_allocate(&open_tasks(), id(99)).unwrap(),
            Allocation::Missing
        ));
    }

    #[test]
    fn released_rows_can_be_claimed_again() {
        let db = fixture::database();
        seed_tasks(&db);
        let first = fixture::engine_on(&db);
        let second = fixture::builder(&db).config(fixture::config("second")).build().unwrap();
        let task = first.try_allocate(&open_tasks(), id(1)).unwrap().acquired().unwrap();

        assert!(first.release(&open_tasks(), &task).unwrap());

        assert!(row(&db, "task_claims", 1).is_none());
        assert!(second.try_allocate(&open_tasks(), id(1)).unwrap().is_acquired());
    }

    #[test]
    fn release_with_saves_the_target_first() {
        let db = fixture::database();
        seed_tasks(&db);
        let engine = fixture::engine_on(&db);
        let task = engine.try_allocate(&open_tasks(), id(4)).unwrap().acquired().unwrap();

        let released = engine
            .release_with(&open_tasks(), &task, |engine, task| {
                engine.set(task, "status", "done")?;
                Ok(())
            })
            .unwrap();

        assert!(released);
        assert_eq!(row(&db, "tasks", 4).unwrap()["status"], Value::from("done"));
        assert!(row(&db, "task_claims", 4).is_none());
        let rest = engine.allocate_exclusively(&open_tasks()).unwrap();
        assert_eq!(ids(&rest), vec![1, 2, 5]);
    }

    #[test]
    fn derived_marker_classes_are_rejected() {
        let (engine, _db) = fixture::engine();
        let request = AllocationRequest::new("Customer", "VipCustomer");

        let err = engine.allocate_exclusively(&request).unwrap_err();

        assert!(matches!(err, EngineError::InvalidShadow(_)));
    }
}
