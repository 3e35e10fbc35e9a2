//! Table definitions understood by backends that enforce constraints.

use serde::{Deserialize, Serialize};

/// A foreign-key target: `table.column`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
}

/// One column and its constraints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub nullable: bool,
    pub unique: bool,
    pub max_length: Option<usize>,
    pub references: Option<ForeignKey>,
}

impl ColumnDef {
    /// A nullable, unconstrained column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nullable: true,
            unique: false,
            max_length: None,
            references: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some(ForeignKey {
            table: table.into(),
            column: column.into(),
        });
        self
    }
}

/// A table: ordered columns plus an optional single-column primary key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Option<String>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: None,
        }
    }

    /// Add the primary-key column (implicitly not-null and unique).
    pub fn primary_key(mut self, column: ColumnDef) -> Self {
        self.primary_key = Some(column.name.clone());
        self.columns.push(column.not_null().unique());
        self
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn get(&self, column: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == column)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.get(column).is_some()
    }
}
