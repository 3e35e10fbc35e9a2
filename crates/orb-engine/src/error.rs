use orb_cache::{CacheError, StoreKey};
use orb_order::OrderError;
use orb_schema::SchemaError;
use orb_sql::DbError;
use orb_types::{ClassName, ObjectId};

/// Errors raised by the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot convert {class}.{field}: {message}")]
    Conversion {
        class: ClassName,
        field: String,
        message: String,
    },

    #[error("object not registered: {0}")]
    NotRegistered(StoreKey),

    #[error("{key}.{field} points at {target}{id}, which is not registered")]
    DanglingReference {
        key: StoreKey,
        field: String,
        target: ClassName,
        id: ObjectId,
    },

    /// A non-nullable reference needs a parent that is itself waiting on
    /// this object higher up the same save.
    #[error("{key}.{field} needs {parent} inserted first, but {parent} is already being saved")]
    UnsavableCycle {
        key: StoreKey,
        field: String,
        parent: StoreKey,
    },

    #[error("row for {0} no longer exists")]
    MissingRow(StoreKey),

    #[error("class {0} cannot hold allocation markers: it must be a base class")]
    InvalidShadow(ClassName),
}

impl EngineError {
    /// `true` if the failure was a unique-constraint clash, i.e. another
    /// writer already holds the value.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, EngineError::Db(e) if e.is_unique_violation())
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
