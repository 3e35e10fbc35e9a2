//! The [`Database`] and [`Transaction`] traits defining the relational
//! access interface.

use crate::error::DbResult;
use crate::query::{Filter, Row, Select};

/// A source of transactions and id sequences.
///
/// Implementations must be thread-safe (`Send + Sync`); each engine call
/// checks out one transaction and runs all of its statements on it.
pub trait Database: Send + Sync {
    /// Check out a connection and open a transaction on it.
    fn begin(&self) -> DbResult<Box<dyn Transaction + '_>>;

    /// Draw the next value of a named sequence. Sequences are not
    /// transactional: a value drawn is never handed out again.
    fn next_id(&self, sequence: &str) -> DbResult<i64>;
}

/// Statements executed within one transaction.
///
/// Dropping a transaction without calling [`commit`](Transaction::commit)
/// rolls it back.
pub trait Transaction {
    fn select(&mut self, query: &Select) -> DbResult<Vec<Row>>;

    /// Insert one row. Columns missing from `row` are written as `NULL`.
    fn insert(&mut self, table: &str, row: &Row) -> DbResult<()>;

    /// Insert several rows.
    ///
    /// Default implementation calls `insert()` for each row. Backends may
    /// override with a multi-row statement.
    fn insert_batch(&mut self, table: &str, rows: &[Row]) -> DbResult<()> {
        rows.iter().try_for_each(|row| self.insert(table, row))
    }

    /// Assign `values` to every row matching `filter`; returns rows affected.
    fn update(&mut self, table: &str, values: &Row, filter: &Filter) -> DbResult<usize>;

    /// Delete every row matching `filter`; returns rows affected.
    fn delete(&mut self, table: &str, filter: &Filter) -> DbResult<usize>;

    fn commit(self: Box<Self>) -> DbResult<()>;

    fn rollback(self: Box<Self>) -> DbResult<()>;
}
