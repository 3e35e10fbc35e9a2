//! Selectors: caller-supplied logic that reads raw rows for a load.
//!
//! A selector runs one or more SELECTs on the load's transaction and
//! returns [`RawRecord`]s: one per object, with every layer's columns merged
//! and entry-table data already converted to typed collections. The
//! built-in [`ClassSelector`] and [`IdSelector`] cover the common cases;
//! any function or closure with the right signature is a selector too.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use orb_schema::{
    ClassDef, FieldDef, FieldKind, Schema, CLASS_COLUMN, ELEMENT_COLUMN, ID_COLUMN, KEY_COLUMN,
    LAST_MODIFIED_COLUMN, ORDER_COLUMN, OWNER_COLUMN, VALUE_COLUMN,
};
use orb_sql::{Filter, Row, Select, Transaction};
use orb_types::{ClassName, FieldValue, ObjectId, Value};
use tracing::warn;

use crate::error::EngineResult;

/// Typed contents of one complex field, with list order keys.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryData {
    pub value: FieldValue,
    /// Persisted order keys, parallel to a list value; empty otherwise.
    pub order_keys: Vec<i64>,
}

/// Everything read from the database for one object.
#[derive(Clone, Debug, PartialEq)]
pub struct RawRecord {
    /// Concrete class, from the discriminator column.
    pub class: ClassName,
    pub id: ObjectId,
    /// Columns of every layer table, merged.
    pub columns: Row,
    /// Complex fields by field name.
    pub entries: BTreeMap<String, EntryData>,
}

impl RawRecord {
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.columns.get(LAST_MODIFIED_COLUMN).and_then(Value::as_time)
    }
}

/// Raw records returned by one selector call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawBatch {
    records: Vec<RawRecord>,
}

impl RawBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: RawRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RawRecord> {
        self.records.iter()
    }

    /// Records grouped by class, then id.
    pub fn by_class(&self) -> BTreeMap<&ClassName, BTreeMap<ObjectId, &RawRecord>> {
        let mut grouped: BTreeMap<&ClassName, BTreeMap<ObjectId, &RawRecord>> = BTreeMap::new();
        for record in &self.records {
            grouped
                .entry(&record.class)
                .or_default()
                .insert(record.id, record);
        }
        grouped
    }
}

impl From<Vec<RawRecord>> for RawBatch {
    fn from(records: Vec<RawRecord>) -> Self {
        Self { records }
    }
}

impl Extend<RawRecord> for RawBatch {
    fn extend<T: IntoIterator<Item = RawRecord>>(&mut self, iter: T) {
        self.records.extend(iter);
    }
}

impl IntoIterator for RawBatch {
    type Item = RawRecord;
    type IntoIter = std::vec::IntoIter<RawRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// What a selector may consult besides its transaction.
pub struct SelectContext<'a> {
    schema: &'a Schema,
    cutoff: Option<DateTime<Utc>>,
}

impl<'a> SelectContext<'a> {
    pub fn new(schema: &'a Schema, cutoff: Option<DateTime<Utc>>) -> Self {
        Self { schema, cutoff }
    }

    pub fn schema(&self) -> &'a Schema {
        self.schema
    }

    /// Data-horizon cutoff of this load, if one applies.
    pub fn cutoff(&self) -> Option<DateTime<Utc>> {
        self.cutoff
    }

    /// Horizon restriction for the base table of `class`: `Filter::All`
    /// unless a cutoff is set and some layer of `class` is horizon
    /// controlled.
    pub fn horizon_filter(&self, class: &ClassName) -> EngineResult<Filter> {
        let Some(cutoff) = self.cutoff else {
            return Ok(Filter::All);
        };
        let controlled = self
            .schema
            .layers(class)?
            .iter()
            .any(|layer| layer.horizon_controlled);
        Ok(if controlled {
            Filter::ge(LAST_MODIFIED_COLUMN, cutoff)
        } else {
            Filter::All
        })
    }

    /// Read complete records for `ids` of `class` (or its subclasses).
    pub fn fetch(
        &self,
        tx: &mut dyn Transaction,
        class: &ClassName,
        ids: &[ObjectId],
        for_update: bool,
    ) -> EngineResult<RawBatch> {
        fetch_by_ids(tx, self.schema, class, ids, for_update)
    }
}

/// Pluggable row source for [`Engine::load`](crate::Engine::load).
pub trait Selector {
    fn select(&self, tx: &mut dyn Transaction, ctx: &SelectContext<'_>) -> EngineResult<RawBatch>;
}

impl<F> Selector for F
where
    F: Fn(&mut dyn Transaction, &SelectContext<'_>) -> EngineResult<RawBatch>,
{
    fn select(&self, tx: &mut dyn Transaction, ctx: &SelectContext<'_>) -> EngineResult<RawBatch> {
        self(tx, ctx)
    }
}

/// Objects of one class (and subclasses) matching a filter on the class's
/// own table.
#[derive(Clone, Debug)]
pub struct ClassSelector {
    class: ClassName,
    filter: Filter,
    limit: Option<usize>,
    for_update: bool,
}

impl ClassSelector {
    pub fn new(class: impl Into<ClassName>) -> Self {
        Self {
            class: class.into(),
            filter: Filter::All,
            limit: None,
            for_update: false,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn for_update(mut self) -> Self {
        self.for_update = true;
        self
    }

    fn select_ids(&self, tx: &mut dyn Transaction, ctx: &SelectContext<'_>) -> EngineResult<Vec<ObjectId>> {
        let schema = ctx.schema();
        let own = schema.class(&self.class)?;
        let horizon = ctx.horizon_filter(&self.class)?;

        if own.is_base() {
            let rows = tx.select(
                &Select::from(&own.table)
                    .columns([ID_COLUMN])
                    .filter(self.filter.clone().and(horizon))
                    .order_by(ID_COLUMN)
                    .limit(self.limit)
                    .for_update(self.for_update),
            )?;
            return Ok(row_ids(&rows));
        }

        let rows = tx.select(
            &Select::from(&own.table)
                .columns([ID_COLUMN])
                .filter(self.filter.clone())
                .order_by(ID_COLUMN)
                .for_update(self.for_update),
        )?;
        let mut ids = row_ids(&rows);
        if !matches!(horizon, Filter::All) && !ids.is_empty() {
            let root = schema.root_of(&self.class)?;
            let inside = tx.select(
                &Select::from(&root.table)
                    .columns([ID_COLUMN])
                    .filter(Filter::is_in(ID_COLUMN, id_values(&ids)).and(horizon))
                    .order_by(ID_COLUMN),
            )?;
            ids = row_ids(&inside);
        }
        if let Some(limit) = self.limit {
            ids.truncate(limit);
        }
        Ok(ids)
    }
}

impl Selector for ClassSelector {
    fn select(&self, tx: &mut dyn Transaction, ctx: &SelectContext<'_>) -> EngineResult<RawBatch> {
        let ids = self.select_ids(tx, ctx)?;
        ctx.fetch(tx, &self.class, &ids, self.for_update)
    }
}

/// Objects of one class by id.
#[derive(Clone, Debug)]
pub struct IdSelector {
    class: ClassName,
    ids: Vec<ObjectId>,
    for_update: bool,
}

impl IdSelector {
    pub fn new(class: impl Into<ClassName>, ids: impl IntoIterator<Item = ObjectId>) -> Self {
        Self {
            class: class.into(),
            ids: ids.into_iter().collect(),
            for_update: false,
        }
    }

    pub fn for_update(mut self) -> Self {
        self.for_update = true;
        self
    }
}

impl Selector for IdSelector {
    fn select(&self, tx: &mut dyn Transaction, ctx: &SelectContext<'_>) -> EngineResult<RawBatch> {
        ctx.fetch(tx, &self.class, &self.ids, self.for_update)
    }
}

fn row_ids(rows: &[Row]) -> Vec<ObjectId> {
    rows.iter()
        .filter_map(|row| row.get(ID_COLUMN).and_then(Value::as_object_id))
        .collect()
}

fn id_values(ids: &[ObjectId]) -> Vec<Value> {
    ids.iter().map(|id| Value::from(*id)).collect()
}

/// Read complete records for `ids`, resolving each row's concrete class
/// through the base table's discriminator column.
pub fn fetch_by_ids(
    tx: &mut dyn Transaction,
    schema: &Schema,
    class: &ClassName,
    ids: &[ObjectId],
    for_update: bool,
) -> EngineResult<RawBatch> {
    if ids.is_empty() {
        return Ok(RawBatch::new());
    }
    let root = schema.root_of(class)?;
    let base_rows = tx.select(
        &Select::from(&root.table)
            .filter(Filter::is_in(ID_COLUMN, id_values(ids)))
            .order_by(ID_COLUMN)
            .for_update(for_update),
    )?;

    let mut records: BTreeMap<ObjectId, RawRecord> = BTreeMap::new();
    for row in base_rows {
        let Some(id) = row.get(ID_COLUMN).and_then(Value::as_object_id) else {
            warn!(table = %root.table, "skipping row without a valid id");
            continue;
        };
        let concrete = row
            .get(CLASS_COLUMN)
            .and_then(Value::as_text)
            .map(ClassName::from);
        let Some(concrete) = concrete.filter(|c| schema.contains(c)) else {
            warn!(table = %root.table, %id, "skipping row with unknown class discriminator");
            continue;
        };
        if !schema.is_a(&concrete, class) {
            warn!(%id, found = %concrete, expected = %class, "row has an unrelated class");
            continue;
        }
        records.insert(
            id,
            RawRecord {
                class: concrete,
                id,
                columns: row,
                entries: BTreeMap::new(),
            },
        );
    }

    // Owners per layer, base layer included.
    let mut owners: BTreeMap<ClassName, Vec<ObjectId>> = BTreeMap::new();
    for record in records.values() {
        for layer in schema.layers(&record.class)? {
            owners.entry(layer.name.clone()).or_default().push(record.id);
        }
    }

    for (layer_name, layer_ids) in &owners {
        let layer = schema.class(layer_name)?;
        if !layer.is_base() {
            merge_layer_rows(tx, layer, layer_ids, &mut records)?;
        }
        for def in layer.complex_fields() {
            read_entries(tx, def, layer_ids, &mut records)?;
        }
    }

    Ok(records.into_values().collect::<Vec<_>>().into())
}

fn merge_layer_rows(
    tx: &mut dyn Transaction,
    layer: &ClassDef,
    ids: &[ObjectId],
    records: &mut BTreeMap<ObjectId, RawRecord>,
) -> EngineResult<()> {
    let rows = tx.select(&Select::from(&layer.table).filter(Filter::is_in(ID_COLUMN, id_values(ids))))?;
    let mut seen = 0;
    for row in rows {
        let Some(record) = row
            .get(ID_COLUMN)
            .and_then(Value::as_object_id)
            .and_then(|id| records.get_mut(&id))
        else {
            continue;
        };
        seen += 1;
        for (column, value) in row {
            if column != ID_COLUMN {
                record.columns.insert(column, value);
            }
        }
    }
    if seen < ids.len() {
        warn!(table = %layer.table, missing = ids.len() - seen, "objects without a row in a layer table");
    }
    Ok(())
}

fn read_entries(
    tx: &mut dyn Transaction,
    def: &FieldDef,
    ids: &[ObjectId],
    records: &mut BTreeMap<ObjectId, RawRecord>,
) -> EngineResult<()> {
    let Some(table) = def.entry_table_name() else {
        return Ok(());
    };
    let mut query = Select::from(table).filter(Filter::is_in(OWNER_COLUMN, id_values(ids)));
    if matches!(def.kind, FieldKind::List(_)) {
        query = query.order_by(ORDER_COLUMN);
    }
    let rows = tx.select(&query)?;

    let mut grouped: BTreeMap<ObjectId, EntryData> = ids
        .iter()
        .map(|id| {
            let empty = EntryData {
                value: def.kind.empty_value(),
                order_keys: Vec::new(),
            };
            (*id, empty)
        })
        .collect();
    for row in rows {
        let Some(data) = row
            .get(OWNER_COLUMN)
            .and_then(Value::as_object_id)
            .and_then(|owner| grouped.get_mut(&owner))
        else {
            continue;
        };
        let cell = |column: &str| row.get(column).cloned().unwrap_or(Value::Null);
        match &mut data.value {
            FieldValue::List(items) => {
                items.push(cell(ELEMENT_COLUMN));
                data.order_keys
                    .push(row.get(ORDER_COLUMN).and_then(Value::as_int).unwrap_or_default());
            }
            FieldValue::Set(items) => {
                items.insert(cell(ELEMENT_COLUMN));
            }
            FieldValue::Map(entries) => {
                entries.insert(cell(KEY_COLUMN), cell(VALUE_COLUMN));
            }
            FieldValue::Scalar(_) | FieldValue::Reference(_) => {}
        }
    }
    for (owner, data) in grouped {
        if let Some(record) = records.get_mut(&owner) {
            record.entries.insert(def.name.clone(), data);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{self, id, seed};
    use chrono::Duration;
    use orb_sql::Database;

    fn shop() -> (Schema, std::sync::Arc<orb_sql::InMemoryDatabase>) {
        let db = fixture::database();
        seed(&db, "customers", &[("id", 1.into()), ("class", "Customer".into()), ("name", "Ada".into())]);
        seed(&db, "customers", &[("id", 2.into()), ("class", "VipCustomer".into()), ("name", "Grace".into())]);
        seed(&db, "vip_customers", &[("id", 2.into()), ("tier", 1.into())]);
        seed(&db, "customers", &[("id", 3.into()), ("class", "VipCustomer".into()), ("name", "Hedy".into())]);
        seed(&db, "vip_customers", &[("id", 3.into()), ("tier", 2.into())]);
        (fixture::schema(), db)
    }

    fn run(selector: &dyn Selector, schema: &Schema, db: &orb_sql::InMemoryDatabase, cutoff: Option<DateTime<Utc>>) -> RawBatch {
        let mut tx = db.begin().unwrap();
        let batch = selector.select(tx.as_mut(), &SelectContext::new(schema, cutoff)).unwrap();
        tx.commit().unwrap();
        batch
    }

    #[test]
    fn class_selector_includes_subclasses_with_merged_columns() {
        let (schema, db) = shop();

        let batch = run(&ClassSelector::new("Customer"), &schema, &db, None);

        assert_eq!(batch.len(), 3);
        let grouped = batch.by_class();
        let vips = &grouped[&ClassName::from("VipCustomer")];
        assert_eq!(vips[&id(2)].columns["tier"], Value::from(1));
        assert_eq!(vips[&id(2)].columns["name"], Value::from("Grace"));
    }

    #[test]
    fn derived_selector_filters_its_own_table() {
        let (schema, db) = shop();

        let selector = ClassSelector::new("VipCustomer").filter(Filter::ge("tier", 2));
        let batch = run(&selector, &schema, &db, None);

        let ids: Vec<ObjectId> = batch.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![id(3)]);
    }

    #[test]
    fn limit_and_horizon_narrow_the_selection() {
        let (schema, db) = shop();
        let later = fixture::start() + Duration::days(1);

        let limited = run(&ClassSelector::new("Customer").limit(2), &schema, &db, None);
        assert_eq!(limited.len(), 2);

        let none = run(&ClassSelector::new("VipCustomer"), &schema, &db, Some(later));
        assert!(none.is_empty());
    }

    #[test]
    fn fetch_skips_rows_of_unrelated_classes() {
        let (schema, db) = shop();
        let mut tx = db.begin().unwrap();

        let batch = fetch_by_ids(tx.as_mut(), &schema, &"VipCustomer".into(), &[id(1), id(2)], false).unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.iter().next().unwrap().class, ClassName::from("VipCustomer"));
        assert_eq!(batch.iter().next().unwrap().entries["perks"].value, FieldValue::List(Vec::new()));
    }
}
