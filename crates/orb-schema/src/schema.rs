//! The validated schema and its queries.

use std::collections::{BTreeMap, BTreeSet};

use orb_sql::{ColumnDef, TableDef};
use orb_types::ClassName;

use crate::class::{ClassDef, FieldDef, FieldKind};
use crate::error::{SchemaError, SchemaResult};
use crate::{
    CLASS_COLUMN, ELEMENT_COLUMN, ID_COLUMN, KEY_COLUMN, LAST_MODIFIED_COLUMN, ORDER_COLUMN,
    OWNER_COLUMN, VALUE_COLUMN,
};

const RESERVED: [&str; 3] = [ID_COLUMN, CLASS_COLUMN, LAST_MODIFIED_COLUMN];

/// Collects class definitions and validates them into a [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    classes: Vec<ClassDef>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn class(mut self, class: ClassDef) -> Self {
        self.classes.push(class);
        self
    }

    /// Validate and freeze the schema.
    ///
    /// Rejects duplicate classes and tables, unknown parents and reference
    /// targets, inheritance cycles, and field or column names that repeat
    /// within one hierarchy or shadow a standard column.
    pub fn build(self) -> SchemaResult<Schema> {
        let mut classes = BTreeMap::new();
        for class in self.classes {
            if classes.contains_key(&class.name) {
                return Err(SchemaError::DuplicateClass(class.name));
            }
            classes.insert(class.name.clone(), class);
        }
        let schema = Schema { classes };
        schema.validate()?;
        Ok(schema)
    }
}

/// Immutable class-to-table mapping, shared by the whole engine.
#[derive(Clone, Debug)]
pub struct Schema {
    classes: BTreeMap<ClassName, ClassDef>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    fn validate(&self) -> SchemaResult<()> {
        for class in self.classes.values() {
            if let Some(parent) = &class.parent {
                if !self.classes.contains_key(parent) {
                    return Err(SchemaError::UnknownParent {
                        class: class.name.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }
        for class in self.classes.values() {
            let mut seen = BTreeSet::new();
            let mut cursor = Some(&class.name);
            while let Some(name) = cursor {
                if !seen.insert(name) {
                    return Err(SchemaError::InheritanceCycle(class.name.clone()));
                }
                cursor = self.classes.get(name).and_then(|c| c.parent.as_ref());
            }
        }
        for class in self.classes.values() {
            for field in class.reference_fields() {
                if let Some(target) = field.kind.reference_target() {
                    if !self.classes.contains_key(target) {
                        return Err(SchemaError::UnknownTarget {
                            class: class.name.clone(),
                            field: field.name.clone(),
                            target: target.clone(),
                        });
                    }
                }
            }
            let mut names = BTreeSet::new();
            let mut columns = BTreeSet::new();
            for (_, field) in self.fields(&class.name)? {
                if RESERVED.contains(&field.name.as_str())
                    || (!field.is_complex() && RESERVED.contains(&field.column.as_str()))
                {
                    return Err(SchemaError::ReservedColumn {
                        class: class.name.clone(),
                        name: field.name.clone(),
                    });
                }
                let column_clash = !field.is_complex() && !columns.insert(field.column.as_str());
                if !names.insert(field.name.as_str()) || column_clash {
                    return Err(SchemaError::DuplicateField {
                        class: class.name.clone(),
                        name: field.name.clone(),
                    });
                }
            }
        }
        let mut tables: BTreeMap<&str, String> = BTreeMap::new();
        for class in self.classes.values() {
            let owners = std::iter::once((class.table.as_str(), class.name.to_string())).chain(
                class.complex_fields().filter_map(|f| {
                    f.entry_table_name()
                        .map(|t| (t, format!("{}.{}", class.name, f.name)))
                }),
            );
            for (table, owner) in owners {
                if let Some(first) = tables.insert(table, owner.clone()) {
                    return Err(SchemaError::DuplicateTable {
                        table: table.to_string(),
                        first,
                        second: owner,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn class(&self, name: &ClassName) -> SchemaResult<&ClassDef> {
        self.classes
            .get(name)
            .ok_or_else(|| SchemaError::UnknownClass(name.clone()))
    }

    /// Look a class up by its discriminator string.
    pub fn class_named(&self, name: &str) -> SchemaResult<&ClassDef> {
        self.class(&ClassName::new(name))
    }

    pub fn contains(&self, name: &ClassName) -> bool {
        self.classes.contains_key(name)
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassDef> {
        self.classes.values()
    }

    /// Classes without a parent, i.e. owners of a base table.
    pub fn base_classes(&self) -> impl Iterator<Item = &ClassDef> {
        self.classes.values().filter(|c| c.is_base())
    }

    /// Inheritance layers of `name`, base class first.
    pub fn layers(&self, name: &ClassName) -> SchemaResult<Vec<&ClassDef>> {
        let mut layers = Vec::new();
        let mut cursor = Some(name);
        while let Some(current) = cursor {
            let class = self.class(current)?;
            layers.push(class);
            cursor = class.parent.as_ref();
        }
        layers.reverse();
        Ok(layers)
    }

    /// The base class at the top of `name`'s hierarchy.
    pub fn root_of(&self, name: &ClassName) -> SchemaResult<&ClassDef> {
        let mut class = self.class(name)?;
        while let Some(parent) = &class.parent {
            class = self.class(parent)?;
        }
        Ok(class)
    }

    /// `true` if `class` is `ancestor` or derives from it.
    pub fn is_a(&self, class: &ClassName, ancestor: &ClassName) -> bool {
        let mut cursor = self.classes.get(class);
        while let Some(current) = cursor {
            if &current.name == ancestor {
                return true;
            }
            cursor = current.parent.as_ref().and_then(|p| self.classes.get(p));
        }
        false
    }

    /// Every field of `name` including inherited ones, base layer first,
    /// paired with the layer that declares it.
    pub fn fields(&self, name: &ClassName) -> SchemaResult<Vec<(&ClassDef, &FieldDef)>> {
        Ok(self
            .layers(name)?
            .into_iter()
            .flat_map(|layer| layer.fields.iter().map(move |f| (layer, f)))
            .collect())
    }

    /// Look up one field of `class` (own or inherited).
    pub fn field(&self, class: &ClassName, field: &str) -> SchemaResult<(&ClassDef, &FieldDef)> {
        self.fields(class)?
            .into_iter()
            .find(|(_, f)| f.name == field)
            .ok_or_else(|| SchemaError::UnknownField {
                class: class.clone(),
                field: field.to_string(),
            })
    }

    /// Table definitions for every class and entry table, suitable for
    /// creating the tables in a constraint-enforcing backend.
    pub fn tables(&self) -> Vec<TableDef> {
        let mut tables = Vec::new();
        for class in self.classes.values() {
            let mut table = TableDef::new(&class.table);
            match &class.parent {
                None => {
                    table = table
                        .primary_key(ColumnDef::new(ID_COLUMN))
                        .column(ColumnDef::new(CLASS_COLUMN).not_null())
                        .column(ColumnDef::new(LAST_MODIFIED_COLUMN).not_null());
                }
                Some(parent) => {
                    let parent_table = self
                        .classes
                        .get(parent)
                        .map(|p| p.table.clone())
                        .unwrap_or_default();
                    table = table
                        .primary_key(ColumnDef::new(ID_COLUMN).references(parent_table, ID_COLUMN));
                }
            }
            for field in class.column_fields() {
                table = table.column(self.column_def(field));
            }
            tables.push(table);

            for field in class.complex_fields() {
                if let Some(entry) = self.entry_table_def(class, field) {
                    tables.push(entry);
                }
            }
        }
        tables
    }

    fn column_def(&self, field: &FieldDef) -> ColumnDef {
        let mut column = ColumnDef::new(&field.column);
        if !field.nullable {
            column = column.not_null();
        }
        if field.unique {
            column = column.unique();
        }
        if let Some(max) = field.max_length {
            column = column.max_length(max);
        }
        if let Some(target) = field.kind.reference_target() {
            if let Some(target) = self.classes.get(target) {
                column = column.references(&target.table, ID_COLUMN);
            }
        }
        column
    }

    fn entry_table_def(&self, class: &ClassDef, field: &FieldDef) -> Option<TableDef> {
        let name = field.entry_table_name()?;
        let owner = ColumnDef::new(OWNER_COLUMN)
            .not_null()
            .references(&class.table, ID_COLUMN);
        let table = TableDef::new(name).column(owner);
        Some(match field.kind {
            FieldKind::List(_) => table
                .column(ColumnDef::new(ELEMENT_COLUMN))
                .column(ColumnDef::new(ORDER_COLUMN).not_null()),
            FieldKind::Set(_) => table.column(ColumnDef::new(ELEMENT_COLUMN)),
            FieldKind::Map { .. } => table
                .column(ColumnDef::new(KEY_COLUMN))
                .column(ColumnDef::new(VALUE_COLUMN)),
            FieldKind::Scalar(_) | FieldKind::Reference { .. } => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orb_types::ScalarKind;

    fn shop() -> Schema {
        Schema::builder()
            .class(
                ClassDef::new("Customer", "customers")
                    .field(FieldDef::text("name").not_null())
                    .field(FieldDef::set("tags", ScalarKind::Text)),
            )
            .class(
                ClassDef::new("VipCustomer", "vip_customers")
                    .extends("Customer")
                    .field(FieldDef::int("tier")),
            )
            .class(
                ClassDef::new("Order", "orders")
                    .field(FieldDef::reference("customer", "Customer").not_null())
                    .field(FieldDef::list("lines", ScalarKind::Text)),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn layers_are_base_first() {
        let schema = shop();
        let layers = schema.layers(&"VipCustomer".into()).unwrap();
        let names: Vec<&str> = layers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["Customer", "VipCustomer"]);
        assert_eq!(schema.root_of(&"VipCustomer".into()).unwrap().table, "customers");
    }

    #[test]
    fn is_a_follows_parents() {
        let schema = shop();
        assert!(schema.is_a(&"VipCustomer".into(), &"Customer".into()));
        assert!(schema.is_a(&"Customer".into(), &"Customer".into()));
        assert!(!schema.is_a(&"Customer".into(), &"VipCustomer".into()));
        assert!(!schema.is_a(&"Order".into(), &"Customer".into()));
    }

    #[test]
    fn field_lookup_includes_inherited() {
        let schema = shop();
        let (layer, field) = schema.field(&"VipCustomer".into(), "name").unwrap();
        assert_eq!(layer.name.as_str(), "Customer");
        assert_eq!(field.column, "name");
        assert!(matches!(
            schema.field(&"Customer".into(), "tier"),
            Err(SchemaError::UnknownField { .. })
        ));
    }

    #[test]
    fn base_classes() {
        let schema = shop();
        let names: Vec<&str> = schema.base_classes().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["Customer", "Order"]);
    }

    #[test]
    fn tables_carry_standard_columns_and_constraints() {
        let schema = shop();
        let tables = schema.tables();
        let find = |name: &str| tables.iter().find(|t| t.name == name).unwrap();

        let customers = find("customers");
        assert!(customers.has_column(CLASS_COLUMN));
        assert!(customers.has_column(LAST_MODIFIED_COLUMN));
        assert!(!customers.get("name").unwrap().nullable);

        let vip = find("vip_customers");
        assert!(!vip.has_column(CLASS_COLUMN));
        assert_eq!(vip.get(ID_COLUMN).unwrap().references.as_ref().unwrap().table, "customers");

        let orders = find("orders");
        let customer = orders.get("customer").unwrap();
        assert_eq!(customer.references.as_ref().unwrap().table, "customers");

        let lines = find("orders_lines");
        assert!(lines.has_column(ORDER_COLUMN));
        let tags = find("customers_tags");
        assert!(!tags.has_column(ORDER_COLUMN));
        assert!(tags.has_column(OWNER_COLUMN));
    }

    #[test]
    fn rejects_unknown_parent() {
        let err = Schema::builder()
            .class(ClassDef::new("A", "a").extends("Missing"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownParent { .. }));
    }

    #[test]
    fn rejects_inheritance_cycle() {
        let err = Schema::builder()
            .class(ClassDef::new("A", "a").extends("B"))
            .class(ClassDef::new("B", "b").extends("A"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::InheritanceCycle(_)));
    }

    #[test]
    fn rejects_unknown_reference_target() {
        let err = Schema::builder()
            .class(ClassDef::new("A", "a").field(FieldDef::reference("b", "B")))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownTarget { .. }));
    }

    #[test]
    fn rejects_duplicate_field_across_layers() {
        let err = Schema::builder()
            .class(ClassDef::new("A", "a").field(FieldDef::text("x")))
            .class(ClassDef::new("B", "b").extends("A").field(FieldDef::int("x")))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateField { .. }));
    }

    #[test]
    fn rejects_reserved_column() {
        let err = Schema::builder()
            .class(ClassDef::new("A", "a").field(FieldDef::text("label").column("class")))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::ReservedColumn { .. }));
    }

    #[test]
    fn rejects_shared_table() {
        let err = Schema::builder()
            .class(ClassDef::new("A", "things"))
            .class(ClassDef::new("B", "things"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateTable { .. }));
    }
}
