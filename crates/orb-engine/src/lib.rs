//! Persistence engine for orb.
//!
//! An [`Engine`] ties a [`Schema`](orb_schema::Schema), a
//! [`Database`](orb_sql::Database) and an [`ObjectStore`](orb_cache::ObjectStore)
//! together and keeps the in-memory object graph in step with the rows:
//!
//! - [`Engine::load`] runs a [`Selector`] and then keeps fetching missing
//!   reference targets until the loaded subgraph is referentially complete.
//! - [`Engine::save`] writes field diffs inside one transaction, saving
//!   unsaved parents first and deferring nullable references that would
//!   otherwise form an insert cycle.
//! - [`Engine::delete`] removes an object and every object referencing it,
//!   breaking circular references before each row goes.
//! - [`Engine::allocate_exclusively`] lets independent instances claim
//!   disjoint rows by racing on a unique marker insert.
//! - [`Engine::synchronize`] reloads everything through the data horizon and
//!   evicts objects nobody needs any more.

pub mod allocate;
pub mod config;
mod convert;
pub mod delete;
pub mod engine;
mod entries;
pub mod error;
pub mod guard;
pub mod horizon;
pub mod load;
pub mod save;
pub mod selector;

#[cfg(test)]
pub(crate) mod fixture;

pub use allocate::{Allocation, AllocationRequest};
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, EngineResult};
pub use guard::{AllowAll, DeleteGuard};
pub use horizon::{Clock, DataHorizon, ManualClock, SystemClock};
pub use load::LoadOutcome;
pub use selector::{
    fetch_by_ids, ClassSelector, EntryData, IdSelector, RawBatch, RawRecord, SelectContext, Selector,
};
