//! Writing complex fields to their entry tables.
//!
//! Lists are kept in order through sparse order keys: the minimal set of
//! deletes, key moves and inserts comes from [`orb_order::plan`]. When the
//! persisted keys are unknown or too dense to fit new elements, the
//! owner's rows are rewritten from scratch. Sets and maps are diffed by
//! element or key.

use std::collections::{BTreeMap, BTreeSet};

use orb_order::{initial_keys, OrderPlan};
use orb_schema::{FieldDef, ELEMENT_COLUMN, KEY_COLUMN, ORDER_COLUMN, OWNER_COLUMN, VALUE_COLUMN};
use orb_sql::{Filter, Row, Transaction};
use orb_types::{FieldValue, ObjectId, Value};
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// What is known about a complex field's persisted state.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Persisted<'a> {
    /// Nothing has been written for this owner yet.
    Nothing,
    /// Last known value and, for lists, its order keys.
    Known {
        value: &'a FieldValue,
        order_keys: Option<&'a [i64]>,
    },
    /// The rows may hold anything.
    Unknown,
}

/// Bring the entry rows of `owner`'s `def` field in line with `new`.
/// Returns the order keys now persisted when `def` is a list.
pub(crate) fn sync_entries(
    tx: &mut dyn Transaction,
    owner: ObjectId,
    def: &FieldDef,
    persisted: Persisted<'_>,
    new: &FieldValue,
    increment: i64,
) -> EngineResult<Option<Vec<i64>>> {
    let Some(table) = def.entry_table_name() else {
        return Err(EngineError::Config(format!(
            "field {} has no entry table",
            def.name
        )));
    };
    let owned = Filter::eq(OWNER_COLUMN, owner);
    match new {
        FieldValue::List(items) => {
            let old = match persisted {
                Persisted::Nothing => Some(Vec::new()),
                Persisted::Known { value, order_keys } => known_list(value, order_keys),
                Persisted::Unknown => None,
            };
            sync_list(tx, table, owner, &owned, old, items, increment).map(Some)
        }
        FieldValue::Set(items) => {
            let old = match persisted {
                Persisted::Nothing => Some(None),
                Persisted::Known { value, .. } => value.as_set().map(Some),
                Persisted::Unknown => None,
            };
            sync_set(tx, table, owner, &owned, old, items)?;
            Ok(None)
        }
        FieldValue::Map(entries) => {
            let old = match persisted {
                Persisted::Nothing => Some(None),
                Persisted::Known { value, .. } => value.as_map().map(Some),
                Persisted::Unknown => None,
            };
            sync_map(tx, table, owner, &owned, old, entries)?;
            Ok(None)
        }
        FieldValue::Scalar(_) | FieldValue::Reference(_) => Err(EngineError::Config(format!(
            "field {} is not a collection",
            def.name
        ))),
    }
}

/// Persisted `(key, element)` pairs, when the keys match the elements.
fn known_list(value: &FieldValue, order_keys: Option<&[i64]>) -> Option<Vec<(i64, Value)>> {
    let items = value.as_list()?;
    match order_keys {
        Some(keys) if keys.len() == items.len() => {
            Some(keys.iter().copied().zip(items.iter().cloned()).collect())
        }
        _ if items.is_empty() => Some(Vec::new()),
        _ => None,
    }
}

fn sync_list(
    tx: &mut dyn Transaction,
    table: &str,
    owner: ObjectId,
    owned: &Filter,
    old: Option<Vec<(i64, Value)>>,
    new: &[Value],
    increment: i64,
) -> EngineResult<Vec<i64>> {
    match old {
        Some(old) => match orb_order::plan(&old, new, increment) {
            Ok(plan) => {
                apply_plan(tx, table, owner, owned, &plan)?;
                return Ok(plan.result_keys);
            }
            Err(e) if e.requires_rewrite() => {
                debug!(table, %owner, error = %e, "order keys exhausted; rewriting list");
            }
            Err(e) => return Err(e.into()),
        },
        None => debug!(table, %owner, "persisted order keys unknown; rewriting list"),
    }

    tx.delete(table, owned)?;
    let keys = initial_keys(new.len(), increment)?;
    let rows: Vec<Row> = keys
        .iter()
        .zip(new)
        .map(|(key, element)| list_row(owner, *key, element))
        .collect();
    tx.insert_batch(table, &rows)?;
    Ok(keys)
}

fn apply_plan(
    tx: &mut dyn Transaction,
    table: &str,
    owner: ObjectId,
    owned: &Filter,
    plan: &OrderPlan<Value>,
) -> EngineResult<()> {
    for key in &plan.removals {
        tx.delete(table, &owned.clone().and(Filter::eq(ORDER_COLUMN, *key)))?;
    }
    for step in &plan.moves {
        let row: Row = [(ORDER_COLUMN.to_string(), Value::from(step.to))].into_iter().collect();
        tx.update(table, &row, &owned.clone().and(Filter::eq(ORDER_COLUMN, step.from)))?;
    }
    let rows: Vec<Row> = plan
        .insertions
        .iter()
        .map(|(key, element)| list_row(owner, *key, element))
        .collect();
    tx.insert_batch(table, &rows)?;
    debug!(
        table,
        %owner,
        removed = plan.removals.len(),
        moved = plan.moves.len(),
        inserted = plan.insertions.len(),
        "list synchronized"
    );
    Ok(())
}

fn list_row(owner: ObjectId, key: i64, element: &Value) -> Row {
    [
        (OWNER_COLUMN.to_string(), Value::from(owner)),
        (ELEMENT_COLUMN.to_string(), element.clone()),
        (ORDER_COLUMN.to_string(), Value::from(key)),
    ]
    .into_iter()
    .collect()
}

/// `None` for unknown persisted state, `Some(None)` for nothing persisted.
fn sync_set(
    tx: &mut dyn Transaction,
    table: &str,
    owner: ObjectId,
    owned: &Filter,
    old: Option<Option<&BTreeSet<Value>>>,
    new: &BTreeSet<Value>,
) -> EngineResult<()> {
    let empty = BTreeSet::new();
    let old = match old {
        Some(old) => old.unwrap_or(&empty),
        None => {
            tx.delete(table, owned)?;
            &empty
        }
    };

    let removed: Vec<&Value> = old.difference(new).collect();
    if !removed.is_empty() {
        tx.delete(table, &owned.clone().and(matching(ELEMENT_COLUMN, &removed)))?;
    }
    let rows: Vec<Row> = new
        .difference(old)
        .map(|element| {
            [
                (OWNER_COLUMN.to_string(), Value::from(owner)),
                (ELEMENT_COLUMN.to_string(), element.clone()),
            ]
            .into_iter()
            .collect()
        })
        .collect();
    tx.insert_batch(table, &rows)?;
    Ok(())
}

fn sync_map(
    tx: &mut dyn Transaction,
    table: &str,
    owner: ObjectId,
    owned: &Filter,
    old: Option<Option<&BTreeMap<Value, Value>>>,
    new: &BTreeMap<Value, Value>,
) -> EngineResult<()> {
    let empty = BTreeMap::new();
    let old = match old {
        Some(old) => old.unwrap_or(&empty),
        None => {
            tx.delete(table, owned)?;
            &empty
        }
    };

    let removed: Vec<&Value> = old.keys().filter(|key| !new.contains_key(*key)).collect();
    if !removed.is_empty() {
        tx.delete(table, &owned.clone().and(matching(KEY_COLUMN, &removed)))?;
    }
    let mut rows: Vec<Row> = Vec::new();
    for (key, value) in new {
        match old.get(key) {
            Some(previous) if previous == value => {}
            Some(_) => {
                let row: Row = [(VALUE_COLUMN.to_string(), value.clone())].into_iter().collect();
                tx.update(table, &row, &owned.clone().and(matching(KEY_COLUMN, &[key])))?;
            }
            None => rows.push(
                [
                    (OWNER_COLUMN.to_string(), Value::from(owner)),
                    (KEY_COLUMN.to_string(), key.clone()),
                    (VALUE_COLUMN.to_string(), value.clone()),
                ]
                .into_iter()
                .collect(),
            ),
        }
    }
    tx.insert_batch(table, &rows)?;
    Ok(())
}

/// Rows whose `column` holds any of `values`; `Null` matches through
/// `IS NULL`.
fn matching(column: &str, values: &[&Value]) -> Filter {
    let present: Vec<Value> = values
        .iter()
        .filter(|value| !value.is_null())
        .map(|value| (*value).clone())
        .collect();
    let has_null = values.iter().any(|value| value.is_null());
    match (present.is_empty(), has_null) {
        (false, false) => Filter::is_in(column, present),
        (true, true) => Filter::is_null(column),
        (false, true) => Filter::Or(vec![Filter::is_in(column, present), Filter::is_null(column)]),
        (true, false) => Filter::All.negate(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orb_schema::{ClassDef, Schema};
    use orb_sql::{Database, InMemoryDatabase, StatementKind};
    use orb_types::ScalarKind;

    fn setup() -> (InMemoryDatabase, Schema) {
        let schema = Schema::builder()
            .class(
                ClassDef::new("Order", "orders")
                    .field(FieldDef::list("lines", ScalarKind::Text))
                    .field(FieldDef::set("tags", ScalarKind::Text))
                    .field(FieldDef::map("notes", ScalarKind::Text, ScalarKind::Text)),
            )
            .build()
            .unwrap();
        let db = InMemoryDatabase::with_tables(schema.tables()).unwrap();
        let mut tx = db.begin().unwrap();
        let row: Row = [
            ("id".to_string(), Value::from(1)),
            ("class".to_string(), Value::from("Order")),
            ("last_modified".to_string(), Value::from(chrono::Utc::now())),
        ]
        .into_iter()
        .collect();
        tx.insert("orders", &row).unwrap();
        tx.commit().unwrap();
        (db, schema)
    }

    fn owner() -> ObjectId {
        ObjectId::new(1).unwrap()
    }

    fn texts(items: &[&str]) -> Vec<Value> {
        items.iter().map(|s| Value::from(*s)).collect()
    }

    fn def<'s>(schema: &'s Schema, field: &str) -> &'s FieldDef {
        schema.field(&"Order".into(), field).unwrap().1
    }

    /// Elements of the owner's list as stored, in key order.
    fn stored_list(db: &InMemoryDatabase) -> Vec<Value> {
        let mut rows = db.rows("orders_lines").unwrap();
        rows.sort_by_key(|row| row.get(ORDER_COLUMN).and_then(Value::as_int));
        rows.into_iter()
            .map(|row| row.get(ELEMENT_COLUMN).cloned().unwrap_or(Value::Null))
            .collect()
    }

    fn write(
        db: &InMemoryDatabase,
        def: &FieldDef,
        persisted: Persisted<'_>,
        new: &FieldValue,
        increment: i64,
    ) -> Option<Vec<i64>> {
        let mut tx = db.begin().unwrap();
        let keys = sync_entries(tx.as_mut(), owner(), def, persisted, new, increment).unwrap();
        tx.commit().unwrap();
        keys
    }

    // ---- Lists ----

    #[test]
    fn rotating_a_list_and_appending_moves_keys_only() {
        let (db, schema) = setup();
        let lines = def(&schema, "lines");
        let first = FieldValue::List(texts(&["a", "b", "c"]));
        let keys = write(&db, lines, Persisted::Nothing, &first, 100).unwrap();
        assert_eq!(keys, vec![100, 200, 300]);

        db.reset_stats();
        let second = FieldValue::List(texts(&["c", "a", "b", "d"]));
        let persisted = Persisted::Known {
            value: &first,
            order_keys: Some(&keys),
        };
        let keys = write(&db, lines, persisted, &second, 100).unwrap();

        let stats = db.table_stats("orders_lines");
        assert_eq!(stats.inserts, 1);
        assert_eq!(stats.deletes, 0);
        assert_eq!(stats.updates, 4);
        assert_eq!(keys.len(), 4);
        assert_eq!(stored_list(&db), texts(&["c", "a", "b", "d"]));
    }

    #[test]
    fn dense_keys_fall_back_to_a_rewrite() {
        let (db, schema) = setup();
        let lines = def(&schema, "lines");
        let first = FieldValue::List(texts(&["a", "b"]));
        let keys = write(&db, lines, Persisted::Nothing, &first, 1).unwrap();
        assert_eq!(keys, vec![1, 2]);

        db.reset_stats();
        let second = FieldValue::List(texts(&["a", "x", "b"]));
        let persisted = Persisted::Known {
            value: &first,
            order_keys: Some(&keys),
        };
        let keys = write(&db, lines, persisted, &second, 1).unwrap();

        assert_eq!(keys, vec![1, 2, 3]);
        assert_eq!(db.table_stats("orders_lines").deletes, 1);
        assert_eq!(stored_list(&db), texts(&["a", "x", "b"]));
    }

    #[test]
    fn unknown_keys_rewrite_the_list() {
        let (db, schema) = setup();
        let lines = def(&schema, "lines");
        write(&db, lines, Persisted::Nothing, &FieldValue::List(texts(&["a", "b"])), 10);

        let keys = write(&db, lines, Persisted::Unknown, &FieldValue::List(texts(&["z"])), 10).unwrap();

        assert_eq!(keys, vec![10]);
        assert_eq!(stored_list(&db), texts(&["z"]));
    }

    #[test]
    fn failed_statement_leaves_rows_untouched_after_rollback() {
        let (db, schema) = setup();
        let lines = def(&schema, "lines");
        let first = FieldValue::List(texts(&["a", "b"]));
        let keys = write(&db, lines, Persisted::Nothing, &first, 10).unwrap();
        db.inject_failure(StatementKind::Insert, "orders_lines", 0);

        let mut tx = db.begin().unwrap();
        let persisted = Persisted::Known {
            value: &first,
            order_keys: Some(&keys),
        };
        let result = sync_entries(
            tx.as_mut(),
            owner(),
            lines,
            persisted,
            &FieldValue::List(texts(&["b", "c"])),
            10,
        );
        assert!(result.is_err());
        tx.rollback().unwrap();

        assert_eq!(stored_list(&db), texts(&["a", "b"]));
    }

    // ---- Sets and maps ----

    #[test]
    fn sets_add_and_remove_elements_including_null() {
        let (db, schema) = setup();
        let tags = def(&schema, "tags");
        let first = FieldValue::Set([Value::from("x"), Value::Null].into_iter().collect());
        write(&db, tags, Persisted::Nothing, &first, 10);
        assert_eq!(db.row_count("orders_tags").unwrap(), 2);

        db.reset_stats();
        let second = FieldValue::Set([Value::from("y")].into_iter().collect());
        write(&db, tags, Persisted::Known { value: &first, order_keys: None }, &second, 10);

        let stats = db.table_stats("orders_tags");
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.inserts, 1);
        let rows = db.rows("orders_tags").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(ELEMENT_COLUMN), Some(&Value::from("y")));
    }

    #[test]
    fn maps_update_changed_values_in_place() {
        let (db, schema) = setup();
        let notes = def(&schema, "notes");
        let first = FieldValue::Map(
            [
                (Value::from("color"), Value::from("red")),
                (Value::from("size"), Value::from("L")),
            ]
            .into_iter()
            .collect(),
        );
        write(&db, notes, Persisted::Nothing, &first, 10);

        db.reset_stats();
        let second = FieldValue::Map(
            [
                (Value::from("color"), Value::from("blue")),
                (Value::from("fit"), Value::from("slim")),
            ]
            .into_iter()
            .collect(),
        );
        write(&db, notes, Persisted::Known { value: &first, order_keys: None }, &second, 10);

        let stats = db.table_stats("orders_notes");
        assert_eq!((stats.deletes, stats.updates, stats.inserts), (1, 1, 1));
        let mut pairs: Vec<(Value, Value)> = db
            .rows("orders_notes")
            .unwrap()
            .into_iter()
            .map(|row| (row[KEY_COLUMN].clone(), row[VALUE_COLUMN].clone()))
            .collect();
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                (Value::from("color"), Value::from("blue")),
                (Value::from("fit"), Value::from("slim")),
            ]
        );
    }
}
