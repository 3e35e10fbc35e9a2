//! Shared schema and helpers for engine tests.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use orb_schema::{ClassDef, FieldDef, Schema, CLASS_COLUMN, LAST_MODIFIED_COLUMN};
use orb_sql::{Database, Filter, InMemoryDatabase, Row, Transaction};
use orb_types::{ObjectId, ScalarKind, Value};

use crate::config::EngineConfig;
use crate::engine::{Engine, EngineBuilder};
use crate::horizon::ManualClock;

pub(crate) fn schema() -> Schema {
    Schema::builder()
        .class(
            ClassDef::new("Customer", "customers")
                .horizon_controlled()
                .field(FieldDef::text("name").not_null().max_length(20))
                .field(FieldDef::text("email").unique())
                .field(FieldDef::set("tags", ScalarKind::Text))
                .field(FieldDef::map("limits", ScalarKind::Text, ScalarKind::Int)),
        )
        .class(
            ClassDef::new("VipCustomer", "vip_customers")
                .extends("Customer")
                .field(FieldDef::int("tier"))
                .field(FieldDef::list("perks", ScalarKind::Text)),
        )
        .class(
            ClassDef::new("Order", "orders")
                .field(FieldDef::text("number"))
                .field(FieldDef::reference("customer", "Customer").not_null())
                .field(FieldDef::list("lines", ScalarKind::Text)),
        )
        .class(
            ClassDef::new("Invoice", "invoices")
                .field(FieldDef::reference("order", "Order").not_null().column("order_id"))
                .field(FieldDef::int("amount")),
        )
        .class(
            ClassDef::new("Node", "nodes")
                .field(FieldDef::text("label"))
                .field(FieldDef::reference("peer", "Node"))
                .field(FieldDef::reference("parent", "Node")),
        )
        .class(
            ClassDef::new("Alpha", "alphas")
                .field(FieldDef::text("name"))
                .field(FieldDef::reference("beta", "Beta").not_null()),
        )
        .class(
            ClassDef::new("Beta", "betas")
                .field(FieldDef::text("name"))
                .field(FieldDef::reference("alpha", "Alpha")),
        )
        .class(
            ClassDef::new("Task", "tasks")
                .field(FieldDef::text("title"))
                .field(FieldDef::text("status")),
        )
        .class(ClassDef::new("TaskClaim", "task_claims").field(FieldDef::text("holder")))
        .build()
        .expect("fixture schema is valid")
}

pub(crate) fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub(crate) fn id(raw: i64) -> ObjectId {
    ObjectId::new(raw).unwrap()
}

pub(crate) fn database() -> Arc<InMemoryDatabase> {
    Arc::new(InMemoryDatabase::with_tables(schema().tables()).unwrap())
}

pub(crate) fn config(instance: &str) -> EngineConfig {
    EngineConfig {
        instance_name: instance.into(),
        ..EngineConfig::default()
    }
}

pub(crate) fn builder(db: &Arc<InMemoryDatabase>) -> EngineBuilder {
    let shared: Arc<dyn Database> = db.clone();
    Engine::builder(schema(), shared)
        .config(config("test"))
        .clock(Arc::new(ManualClock::new(start())))
}

pub(crate) fn engine_on(db: &Arc<InMemoryDatabase>) -> Engine {
    builder(db).build().unwrap()
}

pub(crate) fn engine() -> (Engine, Arc<InMemoryDatabase>) {
    let db = database();
    (engine_on(&db), db)
}

/// Insert a row directly. Base-table rows get a last-modified stamp unless
/// one is given.
pub(crate) fn seed(db: &InMemoryDatabase, table: &str, pairs: &[(&str, Value)]) {
    let mut row: Row = pairs
        .iter()
        .map(|(column, value)| (column.to_string(), value.clone()))
        .collect();
    if row.contains_key(CLASS_COLUMN) {
        row.entry(LAST_MODIFIED_COLUMN.to_string())
            .or_insert_with(|| Value::from(start()));
    }
    let mut tx = db.begin().unwrap();
    tx.insert(table, &row).unwrap();
    tx.commit().unwrap();
}

/// Point `column` of row `id` at `target`.
pub(crate) fn link(db: &InMemoryDatabase, table: &str, id: i64, column: &str, target: i64) {
    let row: Row = [(column.to_string(), Value::from(target))].into_iter().collect();
    let mut tx = db.begin().unwrap();
    tx.update(table, &row, &Filter::eq("id", id)).unwrap();
    tx.commit().unwrap();
}

/// The single row of `table` with the given id.
pub(crate) fn row(db: &InMemoryDatabase, table: &str, id: i64) -> Option<Row> {
    db.rows(table)
        .unwrap()
        .into_iter()
        .find(|row| row.get("id") == Some(&Value::from(id)))
}
