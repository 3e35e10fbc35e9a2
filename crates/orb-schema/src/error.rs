use orb_types::ClassName;

/// Errors raised while building or querying a schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("unknown class: {0}")]
    UnknownClass(ClassName),

    #[error("duplicate class: {0}")]
    DuplicateClass(ClassName),

    #[error("class {class} extends unknown class {parent}")]
    UnknownParent { class: ClassName, parent: ClassName },

    #[error("inheritance cycle through {0}")]
    InheritanceCycle(ClassName),

    #[error("field {class}.{field} references unknown class {target}")]
    UnknownTarget {
        class: ClassName,
        field: String,
        target: ClassName,
    },

    #[error("duplicate field or column {name} in hierarchy of {class}")]
    DuplicateField { class: ClassName, name: String },

    #[error("field name {name} in {class} collides with a standard column")]
    ReservedColumn { class: ClassName, name: String },

    #[error("table {table} is used by both {first} and {second}")]
    DuplicateTable {
        table: String,
        first: String,
        second: String,
    },

    #[error("unknown field {class}.{field}")]
    UnknownField { class: ClassName, field: String },
}

/// Result alias for schema operations.
pub type SchemaResult<T> = Result<T, SchemaError>;
