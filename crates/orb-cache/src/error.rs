use orb_schema::SchemaError;
use orb_types::{ClassName, ObjectId};

use crate::object::StoreKey;

/// Errors raised by the object store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Another object is registered under the same root class and id.
    #[error("id already registered: {0}")]
    IdTaken(StoreKey),

    #[error("object not registered: {0}")]
    NotRegistered(StoreKey),

    #[error("object {class}{id} is already registered")]
    AlreadyRegistered { class: ClassName, id: ObjectId },

    #[error("id of {key} cannot change to {requested}")]
    IdChange { key: StoreKey, requested: ObjectId },

    #[error("value for {class}.{field} does not match the field kind")]
    KindMismatch { class: ClassName, field: String },

    #[error("id source failed: {0}")]
    IdSource(String),
}

/// Result alias for store operations.
pub type CacheResult<T> = Result<T, CacheError>;
