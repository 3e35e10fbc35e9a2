//! Statement description model.
//!
//! [`Filter`] is the WHERE clause, [`Select`] a complete SELECT. Filters
//! follow SQL null semantics: comparing anything with `NULL` is false, so
//! null elements must be matched with [`Filter::IsNull`].

use std::cmp::Ordering;
use std::collections::BTreeMap;

use orb_types::Value;

/// One row: column name to value.
pub type Row = BTreeMap<String, Value>;

/// A WHERE clause.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    /// Matches every row.
    All,
    Eq(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
    Ge(String, Value),
    Lt(String, Value),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    /// `column NOT IN (SELECT foreign_column FROM table)`.
    NotExistsIn {
        column: String,
        table: String,
        foreign_column: String,
    },
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(column.into(), value.into())
    }

    pub fn is_in(column: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In(column.into(), values)
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Filter::IsNull(column.into())
    }

    pub fn ge(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ge(column.into(), value.into())
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lt(column.into(), value.into())
    }

    pub fn not_exists_in(
        column: impl Into<String>,
        table: impl Into<String>,
        foreign_column: impl Into<String>,
    ) -> Self {
        Filter::NotExistsIn {
            column: column.into(),
            table: table.into(),
            foreign_column: foreign_column.into(),
        }
    }

    /// Conjunction that flattens nested `And`s and drops `All`.
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut a), Filter::And(b)) => {
                a.extend(b);
                Filter::And(a)
            }
            (Filter::And(mut a), f) => {
                a.push(f);
                Filter::And(a)
            }
            (f, Filter::And(mut b)) => {
                b.insert(0, f);
                Filter::And(b)
            }
            (a, b) => Filter::And(vec![a, b]),
        }
    }

    pub fn negate(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Evaluate against `row`. `exists(table, column, value)` answers
    /// sub-select lookups for [`Filter::NotExistsIn`].
    pub fn matches(&self, row: &Row, exists: &dyn Fn(&str, &str, &Value) -> bool) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(col, value) => cell(row, col).is_some_and(|v| !value.is_null() && v == value),
            Filter::In(col, values) => {
                cell(row, col).is_some_and(|v| values.iter().any(|c| !c.is_null() && c == v))
            }
            Filter::IsNull(col) => row.get(col).map_or(true, Value::is_null),
            Filter::Ge(col, value) => compare(row, col, value)
                .is_some_and(|ord| ord != Ordering::Less),
            Filter::Lt(col, value) => compare(row, col, value)
                .is_some_and(|ord| ord == Ordering::Less),
            Filter::And(parts) => parts.iter().all(|f| f.matches(row, exists)),
            Filter::Or(parts) => parts.iter().any(|f| f.matches(row, exists)),
            Filter::Not(inner) => !inner.matches(row, exists),
            Filter::NotExistsIn {
                column,
                table,
                foreign_column,
            } => match cell(row, column) {
                Some(v) => !exists(table, foreign_column, v),
                None => true,
            },
        }
    }

    /// Columns of the filtered table this filter reads.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Filter::All => {}
            Filter::Eq(c, _)
            | Filter::In(c, _)
            | Filter::IsNull(c)
            | Filter::Ge(c, _)
            | Filter::Lt(c, _) => out.push(c),
            Filter::NotExistsIn { column, .. } => out.push(column),
            Filter::And(parts) | Filter::Or(parts) => {
                for p in parts {
                    p.collect_columns(out);
                }
            }
            Filter::Not(inner) => inner.collect_columns(out),
        }
    }
}

/// Non-null cell value.
fn cell<'r>(row: &'r Row, column: &str) -> Option<&'r Value> {
    row.get(column).filter(|v| !v.is_null())
}

fn compare(row: &Row, column: &str, value: &Value) -> Option<Ordering> {
    let v = cell(row, column)?;
    if value.is_null() || v.kind() != value.kind() {
        return None;
    }
    Some(v.cmp(value))
}

/// One ORDER BY term.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

/// A single-table SELECT.
#[derive(Clone, Debug, PartialEq)]
pub struct Select {
    pub table: String,
    /// Projected columns; `None` selects every column.
    pub columns: Option<Vec<String>>,
    pub filter: Filter,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    /// Request row locks (`FOR UPDATE`) where the backend supports them.
    pub for_update: bool,
}

impl Select {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: None,
            filter: Filter::All,
            order_by: Vec::new(),
            limit: None,
            for_update: false,
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            descending: false,
        });
        self
    }

    pub fn order_by_desc(mut self, column: impl Into<String>) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            descending: true,
        });
        self
    }

    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn for_update(mut self, for_update: bool) -> Self {
        self.for_update = for_update;
        self
    }
}
