//! In-memory relational backend for tests and embedding.
//!
//! [`InMemoryDatabase`] keeps every table in a `BTreeMap` behind one mutex.
//! Statements are applied immediately and recorded in a per-transaction undo
//! log; rollback replays the log backwards. There is no isolation between
//! concurrent transactions (reads are uncommitted), but every statement is
//! atomic and constraint checks see all rows, which is what the exclusive
//! allocation protocol relies on. `FOR UPDATE` is accepted and ignored.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use orb_types::Value;
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::query::{Filter, Row, Select};
use crate::table::TableDef;
use crate::traits::{Database, Transaction};

/// Statement kinds, for statistics and failure injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Number of statements executed, per kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatementStats {
    pub selects: usize,
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl StatementStats {
    /// Inserts + updates + deletes.
    pub fn mutations(&self) -> usize {
        self.inserts + self.updates + self.deletes
    }

    fn record(&mut self, kind: StatementKind) {
        match kind {
            StatementKind::Select => self.selects += 1,
            StatementKind::Insert => self.inserts += 1,
            StatementKind::Update => self.updates += 1,
            StatementKind::Delete => self.deletes += 1,
        }
    }
}

struct Table {
    def: TableDef,
    rows: BTreeMap<u64, Row>,
    next_rowid: u64,
}

struct InjectedFailure {
    kind: StatementKind,
    table: String,
    skip: usize,
}

#[derive(Default)]
struct DbState {
    tables: BTreeMap<String, Table>,
    sequences: HashMap<String, i64>,
    stats: BTreeMap<String, StatementStats>,
    failures: Vec<InjectedFailure>,
}

impl DbState {
    fn table(&self, name: &str) -> DbResult<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| DbError::NoSuchTable(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> DbResult<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| DbError::NoSuchTable(name.to_string()))
    }

    /// Count the statement and fire any armed failure for it.
    fn enter(&mut self, kind: StatementKind, table: &str) -> DbResult<()> {
        self.stats.entry(table.to_string()).or_default().record(kind);
        let armed = self
            .failures
            .iter()
            .position(|f| f.kind == kind && f.table == table);
        if let Some(index) = armed {
            if self.failures[index].skip == 0 {
                self.failures.remove(index);
                debug!(%kind, table, "injected statement failure");
                return Err(DbError::Connection(format!(
                    "injected failure on {kind} {table}"
                )));
            }
            self.failures[index].skip -= 1;
        }
        Ok(())
    }

    fn exists(&self, table: &str, column: &str, value: &Value) -> bool {
        self.tables
            .get(table)
            .is_some_and(|t| t.rows.values().any(|r| r.get(column) == Some(value)))
    }

    fn check_columns<'c>(
        table: &Table,
        columns: impl IntoIterator<Item = &'c str>,
    ) -> DbResult<()> {
        for column in columns {
            if !table.def.has_column(column) {
                return Err(DbError::NoSuchColumn {
                    table: table.def.name.clone(),
                    column: column.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Validate a complete row about to be written. `own` is the rowid being
    /// replaced (updates), `batch` are sibling rows written by the same
    /// statement.
    fn check_row(&self, table: &Table, row: &Row, own: Option<u64>, batch: &[&Row]) -> DbResult<()> {
        let name = &table.def.name;
        for col in &table.def.columns {
            let value = row.get(&col.name).unwrap_or(&Value::Null);
            if value.is_null() {
                if !col.nullable {
                    return Err(DbError::NotNullViolation {
                        table: name.clone(),
                        column: col.name.clone(),
                    });
                }
                continue;
            }
            if let (Some(max), Some(actual)) = (col.max_length, value.text_len()) {
                if actual > max {
                    return Err(DbError::ValueTooLong {
                        table: name.clone(),
                        column: col.name.clone(),
                        max,
                        actual,
                    });
                }
            }
            if col.unique {
                let clash_stored = table
                    .rows
                    .iter()
                    .any(|(rowid, r)| Some(*rowid) != own && r.get(&col.name) == Some(value));
                let clash_batch = batch.iter().any(|r| r.get(&col.name) == Some(value));
                if clash_stored || clash_batch {
                    return Err(DbError::UniqueViolation {
                        table: name.clone(),
                        column: col.name.clone(),
                        value: value.to_string(),
                    });
                }
            }
            if let Some(fk) = &col.references {
                let self_reference =
                    fk.table == *name && row.get(&fk.column) == Some(value);
                if !self_reference && !self.exists(&fk.table, &fk.column, value) {
                    return Err(DbError::ForeignKeyViolation {
                        table: name.clone(),
                        column: col.name.clone(),
                        value: value.to_string(),
                        target: fk.table.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// First foreign key still pointing at one of `doomed` rows of `table`.
    fn restricting_reference(&self, table: &str, doomed: &BTreeMap<u64, Row>) -> Option<String> {
        for other in self.tables.values() {
            for col in &other.def.columns {
                let Some(fk) = &col.references else { continue };
                if fk.table != table {
                    continue;
                }
                let targets: BTreeSet<&Value> = doomed
                    .values()
                    .filter_map(|r| r.get(&fk.column))
                    .filter(|v| !v.is_null())
                    .collect();
                let referenced = other.rows.iter().any(|(rowid, r)| {
                    let deleted_too = other.def.name == table && doomed.contains_key(rowid);
                    !deleted_too && r.get(&col.name).is_some_and(|v| targets.contains(v))
                });
                if referenced {
                    return Some(format!("{}.{}", other.def.name, col.name));
                }
            }
        }
        None
    }

    fn matching(&self, table: &Table, filter: &Filter) -> Vec<(u64, Row)> {
        let exists = |t: &str, c: &str, v: &Value| self.exists(t, c, v);
        table
            .rows
            .iter()
            .filter(|(_, r)| filter.matches(r, &exists))
            .map(|(rowid, r)| (*rowid, r.clone()))
            .collect()
    }
}

/// In-memory, mutex-guarded relational database.
///
/// Intended for tests and embedding. Besides the [`Database`] interface it
/// offers inspection helpers (`rows`, `stats`) and failure injection so that
/// rollback paths can be exercised deterministically.
pub struct InMemoryDatabase {
    state: Mutex<DbState>,
}

impl InMemoryDatabase {
    /// Create an empty database with no tables.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DbState::default()),
        }
    }

    /// Create a database with the given tables.
    pub fn with_tables(tables: impl IntoIterator<Item = TableDef>) -> DbResult<Self> {
        let db = Self::new();
        for def in tables {
            db.create_table(def)?;
        }
        Ok(db)
    }

    fn lock(&self) -> MutexGuard<'_, DbState> {
        self.state.lock().expect("database lock poisoned")
    }

    pub fn create_table(&self, def: TableDef) -> DbResult<()> {
        let mut state = self.lock();
        if state.tables.contains_key(&def.name) {
            return Err(DbError::TableExists(def.name));
        }
        state.tables.insert(
            def.name.clone(),
            Table {
                def,
                rows: BTreeMap::new(),
                next_rowid: 1,
            },
        );
        Ok(())
    }

    /// All rows of `table` in insertion order.
    pub fn rows(&self, table: &str) -> DbResult<Vec<Row>> {
        let state = self.lock();
        Ok(state.table(table)?.rows.values().cloned().collect())
    }

    pub fn row_count(&self, table: &str) -> DbResult<usize> {
        let state = self.lock();
        Ok(state.table(table)?.rows.len())
    }

    /// Statements executed across all tables since the last reset.
    pub fn stats(&self) -> StatementStats {
        let state = self.lock();
        state
            .stats
            .values()
            .fold(StatementStats::default(), |mut acc, s| {
                acc.selects += s.selects;
                acc.inserts += s.inserts;
                acc.updates += s.updates;
                acc.deletes += s.deletes;
                acc
            })
    }

    /// Statements executed against one table since the last reset.
    pub fn table_stats(&self, table: &str) -> StatementStats {
        self.lock().stats.get(table).copied().unwrap_or_default()
    }

    pub fn reset_stats(&self) {
        self.lock().stats.clear();
    }

    /// Make the `skip + 1`-th future `kind` statement on `table` fail with a
    /// connection error.
    pub fn inject_failure(&self, kind: StatementKind, table: &str, skip: usize) {
        self.lock().failures.push(InjectedFailure {
            kind,
            table: table.to_string(),
            skip,
        });
    }
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        let rows: usize = state.tables.values().map(|t| t.rows.len()).sum();
        f.debug_struct("InMemoryDatabase")
            .field("table_count", &state.tables.len())
            .field("row_count", &rows)
            .finish()
    }
}

impl Database for InMemoryDatabase {
    fn begin(&self) -> DbResult<Box<dyn Transaction + '_>> {
        Ok(Box::new(MemoryTransaction {
            db: self,
            undo: Vec::new(),
            finished: false,
        }))
    }

    fn next_id(&self, sequence: &str) -> DbResult<i64> {
        let mut state = self.lock();
        let next = state.sequences.entry(sequence.to_string()).or_insert(0);
        *next += 1;
        Ok(*next)
    }
}

enum Undo {
    Inserted { table: String, rowid: u64 },
    Updated { table: String, rowid: u64, previous: Row },
    Deleted { table: String, rowid: u64, row: Row },
}

/// A transaction on an [`InMemoryDatabase`].
pub struct MemoryTransaction<'a> {
    db: &'a InMemoryDatabase,
    undo: Vec<Undo>,
    finished: bool,
}

impl MemoryTransaction<'_> {
    fn ensure_open(&self) -> DbResult<()> {
        if self.finished {
            return Err(DbError::TransactionFinished);
        }
        Ok(())
    }

    fn undo_all(&mut self) {
        let mut state = self.db.lock();
        for step in self.undo.drain(..).rev() {
            match step {
                Undo::Inserted { table, rowid } => {
                    if let Some(t) = state.tables.get_mut(&table) {
                        t.rows.remove(&rowid);
                    }
                }
                Undo::Updated {
                    table,
                    rowid,
                    previous,
                } => {
                    if let Some(t) = state.tables.get_mut(&table) {
                        t.rows.insert(rowid, previous);
                    }
                }
                Undo::Deleted { table, rowid, row } => {
                    if let Some(t) = state.tables.get_mut(&table) {
                        t.rows.insert(rowid, row);
                    }
                }
            }
        }
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn select(&mut self, query: &Select) -> DbResult<Vec<Row>> {
        self.ensure_open()?;
        let mut state = self.db.lock();
        state.enter(StatementKind::Select, &query.table)?;
        let table = state.table(&query.table)?;
        if let Some(columns) = &query.columns {
            DbState::check_columns(table, columns.iter().map(String::as_str))?;
        }
        let mut rows: Vec<Row> = state
            .matching(table, &query.filter)
            .into_iter()
            .map(|(_, r)| r)
            .collect();
        if !query.order_by.is_empty() {
            rows.sort_by(|a, b| {
                for term in &query.order_by {
                    let left = a.get(&term.column).unwrap_or(&Value::Null);
                    let right = b.get(&term.column).unwrap_or(&Value::Null);
                    let ord = if term.descending {
                        right.cmp(left)
                    } else {
                        left.cmp(right)
                    };
                    if ord.is_ne() {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        if let Some(columns) = &query.columns {
            rows = rows
                .into_iter()
                .map(|r| {
                    columns
                        .iter()
                        .map(|c| (c.clone(), r.get(c).cloned().unwrap_or(Value::Null)))
                        .collect()
                })
                .collect();
        }
        Ok(rows)
    }

    fn insert(&mut self, table: &str, row: &Row) -> DbResult<()> {
        self.ensure_open()?;
        let mut state = self.db.lock();
        state.enter(StatementKind::Insert, table)?;
        let t = state.table(table)?;
        DbState::check_columns(t, row.keys().map(String::as_str))?;
        let full: Row = t
            .def
            .columns
            .iter()
            .map(|c| (c.name.clone(), row.get(&c.name).cloned().unwrap_or(Value::Null)))
            .collect();
        state.check_row(t, &full, None, &[])?;

        let t = state.table_mut(table)?;
        let rowid = t.next_rowid;
        t.next_rowid += 1;
        t.rows.insert(rowid, full);
        self.undo.push(Undo::Inserted {
            table: table.to_string(),
            rowid,
        });
        Ok(())
    }

    fn update(&mut self, table: &str, values: &Row, filter: &Filter) -> DbResult<usize> {
        self.ensure_open()?;
        let mut state = self.db.lock();
        state.enter(StatementKind::Update, table)?;
        let t = state.table(table)?;
        DbState::check_columns(t, values.keys().map(String::as_str))?;
        DbState::check_columns(t, filter.columns())?;

        let matched = state.matching(t, filter);
        let updated: Vec<(u64, Row, Row)> = matched
            .into_iter()
            .map(|(rowid, previous)| {
                let mut next = previous.clone();
                next.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
                (rowid, previous, next)
            })
            .collect();
        // Updated rows are checked against each other's new values and
        // against the untouched rows' stored values.
        let mut view = Table {
            def: t.def.clone(),
            rows: t.rows.clone(),
            next_rowid: t.next_rowid,
        };
        for (rowid, _, _) in &updated {
            view.rows.remove(rowid);
        }
        for (index, (rowid, _, next)) in updated.iter().enumerate() {
            let siblings: Vec<&Row> = updated
                .iter()
                .enumerate()
                .filter(|(other, _)| *other != index)
                .map(|(_, (_, _, r))| r)
                .collect();
            state.check_row(&view, next, Some(*rowid), &siblings)?;
        }

        let count = updated.len();
        let t = state.table_mut(table)?;
        for (rowid, previous, next) in updated {
            t.rows.insert(rowid, next);
            self.undo.push(Undo::Updated {
                table: table.to_string(),
                rowid,
                previous,
            });
        }
        Ok(count)
    }

    fn delete(&mut self, table: &str, filter: &Filter) -> DbResult<usize> {
        self.ensure_open()?;
        let mut state = self.db.lock();
        state.enter(StatementKind::Delete, table)?;
        let t = state.table(table)?;
        DbState::check_columns(t, filter.columns())?;

        let doomed: BTreeMap<u64, Row> = state.matching(t, filter).into_iter().collect();
        if let Some(referenced_by) = state.restricting_reference(table, &doomed) {
            return Err(DbError::RestrictViolation {
                table: table.to_string(),
                referenced_by,
            });
        }

        let count = doomed.len();
        let t = state.table_mut(table)?;
        for (rowid, row) in doomed {
            t.rows.remove(&rowid);
            self.undo.push(Undo::Deleted {
                table: table.to_string(),
                rowid,
                row,
            });
        }
        Ok(count)
    }

    fn commit(mut self: Box<Self>) -> DbResult<()> {
        self.ensure_open()?;
        self.undo.clear();
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> DbResult<()> {
        self.ensure_open()?;
        self.undo_all();
        self.finished = true;
        Ok(())
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.undo.is_empty() {
            debug!(statements = self.undo.len(), "rolling back abandoned transaction");
            self.undo_all();
        }
    }
}
