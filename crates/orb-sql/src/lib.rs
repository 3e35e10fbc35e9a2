//! Relational access layer for orb.
//!
//! The engine never talks SQL text. It describes statements with the small
//! query model in [`query`] and hands them to a [`Transaction`] obtained from
//! a [`Database`]. Dialect quoting, pooling and statement preparation are the
//! backend's business.
//!
//! # Backends
//!
//! All backends implement the [`Database`] and [`Transaction`] traits:
//!
//! - [`InMemoryDatabase`] -- table store for tests and embedding; enforces
//!   primary keys, unique, not-null, max-length and foreign-key constraints
//!
//! # Design Rules
//!
//! 1. Every statement is atomic: a failed statement leaves no partial rows.
//! 2. Constraint violations are reported as typed [`DbError`] variants so
//!    callers can attach them to the offending field.
//! 3. A transaction that is dropped without `commit` is rolled back.

pub mod error;
pub mod memory;
pub mod query;
pub mod table;
pub mod traits;

pub use error::{DbError, DbResult};
pub use memory::{InMemoryDatabase, StatementKind, StatementStats};
pub use query::{Filter, OrderBy, Row, Select};
pub use table::{ColumnDef, ForeignKey, TableDef};
pub use traits::{Database, Transaction};
