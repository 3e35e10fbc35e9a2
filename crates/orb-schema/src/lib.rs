//! Schema descriptors for orb.
//!
//! A [`Schema`] is built once at startup from [`ClassDef`]s and answers every
//! metadata question the engine asks: which table holds a class, which
//! column holds a field, whether a field is a scalar, a reference or an
//! entry-table backed collection, and how a class stacks onto its parents.
//!
//! # Standard columns
//!
//! Every object table has an [`ID_COLUMN`]. Base (root) tables additionally
//! carry the [`CLASS_COLUMN`] discriminator and the [`LAST_MODIFIED_COLUMN`]
//! housekeeping timestamp. Entry tables carry [`OWNER_COLUMN`] plus either
//! [`ELEMENT_COLUMN`] (and [`ORDER_COLUMN`] for lists) or
//! [`KEY_COLUMN`]/[`VALUE_COLUMN`] for maps.

pub mod class;
pub mod error;
pub mod schema;

pub use class::{ClassDef, FieldDef, FieldKind};
pub use error::{SchemaError, SchemaResult};
pub use schema::{Schema, SchemaBuilder};

pub const ID_COLUMN: &str = "id";
pub const CLASS_COLUMN: &str = "class";
pub const LAST_MODIFIED_COLUMN: &str = "last_modified";
pub const OWNER_COLUMN: &str = "owner_id";
pub const ELEMENT_COLUMN: &str = "element";
pub const ORDER_COLUMN: &str = "order_no";
pub const KEY_COLUMN: &str = "entry_key";
pub const VALUE_COLUMN: &str = "entry_value";
