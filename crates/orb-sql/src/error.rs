//! Error types for relational access.

/// Errors raised by a [`Database`](crate::Database) backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DbError {
    #[error("null value in column {table}.{column} violates not-null constraint")]
    NotNullViolation { table: String, column: String },

    #[error("duplicate value {value} in column {table}.{column} violates unique constraint")]
    UniqueViolation {
        table: String,
        column: String,
        value: String,
    },

    #[error("value too long for column {table}.{column} ({actual} > {max})")]
    ValueTooLong {
        table: String,
        column: String,
        max: usize,
        actual: usize,
    },

    #[error("value {value} in column {table}.{column} has no matching row in {target}")]
    ForeignKeyViolation {
        table: String,
        column: String,
        value: String,
        target: String,
    },

    #[error("row in {table} is still referenced from {referenced_by}")]
    RestrictViolation {
        table: String,
        referenced_by: String,
    },

    #[error("no such table: {0}")]
    NoSuchTable(String),

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("no such column: {table}.{column}")]
    NoSuchColumn { table: String, column: String },

    #[error("transaction already finished")]
    TransactionFinished,

    #[error("connection error: {0}")]
    Connection(String),
}

impl DbError {
    /// `true` if another writer already holds the unique value.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, DbError::UniqueViolation { .. })
    }

    /// `true` for violations local to one column or row, as opposed to
    /// structural or transport failures.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            DbError::NotNullViolation { .. }
                | DbError::UniqueViolation { .. }
                | DbError::ValueTooLong { .. }
                | DbError::ForeignKeyViolation { .. }
                | DbError::RestrictViolation { .. }
        )
    }

    /// The column a constraint violation refers to, if any.
    pub fn column(&self) -> Option<&str> {
        match self {
            DbError::NotNullViolation { column, .. }
            | DbError::UniqueViolation { column, .. }
            | DbError::ValueTooLong { column, .. }
            | DbError::ForeignKeyViolation { column, .. }
            | DbError::NoSuchColumn { column, .. } => Some(column),
            _ => None,
        }
    }
}

/// Result alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
