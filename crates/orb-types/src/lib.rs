//! Foundation types for orb, the object-relational bridge.
//!
//! This crate provides the identity, value and diagnostic types shared by
//! every other orb crate. It has no knowledge of tables, schemas or caches.
//!
//! # Key Types
//!
//! - [`ObjectId`] - Immutable numeric identity of a domain object
//! - [`ClassName`] - Domain-class tag used for dispatch and discrimination
//! - [`Value`] / [`ScalarKind`] - A single column value and its kind
//! - [`FieldValue`] - The typed value of one domain-object field
//! - [`FieldError`] - Warning or error attached to an object field after a
//!   failed or lossy persistence attempt

pub mod error;
pub mod field;
pub mod identity;
pub mod value;

pub use error::TypeError;
pub use field::{FieldError, FieldErrorKind, FieldValue, Severity};
pub use identity::{ClassName, ObjectId};
pub use value::{ScalarKind, Value};
