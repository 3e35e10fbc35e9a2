//! Object store for orb.
//!
//! The [`ObjectStore`] is the process-wide arena of live domain objects.
//! Objects are identified by their root class and id ([`StoreKey`]), so a
//! lookup through any class of an inheritance stack reaches the same object.
//! References between objects are ids resolved through the store; nothing
//! holds a pointer to another object.
//!
//! # Key Types
//!
//! - [`DomainObject`] - Class tag, id, typed fields and diagnostics
//! - [`Handle`] - Shared, lockable reference to a registered object
//! - [`ObjectRecord`] - Last-known persisted field values, the diff baseline
//! - [`AccumulationIndex`] - Derived back-reference index (parent -> children)
//! - [`IdSource`] - Where fresh object ids come from

pub mod accumulation;
pub mod error;
pub mod ids;
pub mod object;
pub mod record;
pub mod store;

pub use accumulation::{AccumulationIndex, FieldRef};
pub use error::{CacheError, CacheResult};
pub use ids::{IdSource, SequentialIds};
pub use object::{DomainObject, Handle, Lifecycle, StoreKey};
pub use record::{diff_fields, FieldChange, ObjectRecord};
pub use store::ObjectStore;
