//! Class and field descriptors.

use orb_types::{ClassName, FieldValue, ScalarKind, Value};
use serde::{Deserialize, Serialize};

/// The closed set of field shapes the engine knows how to persist.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    /// A plain column.
    Scalar(ScalarKind),
    /// An id column pointing at an object of `target` (or a subclass).
    Reference { target: ClassName },
    /// Ordered elements in an entry table with sparse order keys.
    List(ScalarKind),
    /// Unordered distinct elements in an entry table.
    Set(ScalarKind),
    /// Key/value pairs in an entry table.
    Map { key: ScalarKind, value: ScalarKind },
}

impl FieldKind {
    /// `true` for entry-table backed kinds.
    pub fn is_complex(&self) -> bool {
        matches!(
            self,
            FieldKind::List(_) | FieldKind::Set(_) | FieldKind::Map { .. }
        )
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, FieldKind::Reference { .. })
    }

    pub fn reference_target(&self) -> Option<&ClassName> {
        match self {
            FieldKind::Reference { target } => Some(target),
            _ => None,
        }
    }

    /// Value of a field that was never set: null, no target, or an empty
    /// collection.
    pub fn empty_value(&self) -> FieldValue {
        match self {
            FieldKind::Scalar(_) => FieldValue::Scalar(Value::Null),
            FieldKind::Reference { .. } => FieldValue::Reference(None),
            FieldKind::List(_) => FieldValue::List(Vec::new()),
            FieldKind::Set(_) => FieldValue::Set(Default::default()),
            FieldKind::Map { .. } => FieldValue::Map(Default::default()),
        }
    }

    /// Whether `value` has this kind's shape and element kinds.
    pub fn accepts(&self, value: &FieldValue) -> bool {
        match (self, value) {
            (FieldKind::Scalar(kind), FieldValue::Scalar(v)) => kind.accepts(v),
            (FieldKind::Reference { .. }, FieldValue::Reference(_)) => true,
            (FieldKind::List(kind), FieldValue::List(items)) => {
                items.iter().all(|v| kind.accepts(v))
            }
            (FieldKind::Set(kind), FieldValue::Set(items)) => items.iter().all(|v| kind.accepts(v)),
            (FieldKind::Map { key, value }, FieldValue::Map(entries)) => entries
                .iter()
                .all(|(k, v)| key.accepts(k) && value.accepts(v)),
            _ => false,
        }
    }
}

/// One declared field of a class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    /// Column in the class table; unused for complex fields.
    pub column: String,
    pub kind: FieldKind,
    pub nullable: bool,
    pub unique: bool,
    pub max_length: Option<usize>,
    /// Entry table for complex fields; defaults to `<table>_<field>`.
    pub entry_table: Option<String>,
}

impl FieldDef {
    fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            kind,
            nullable: true,
            unique: false,
            max_length: None,
            entry_table: None,
        }
    }

    pub fn scalar(name: impl Into<String>, kind: ScalarKind) -> Self {
        Self::new(name, FieldKind::Scalar(kind))
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarKind::Text)
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarKind::Int)
    }

    pub fn reference(name: impl Into<String>, target: impl Into<ClassName>) -> Self {
        Self::new(
            name,
            FieldKind::Reference {
                target: target.into(),
            },
        )
    }

    pub fn list(name: impl Into<String>, element: ScalarKind) -> Self {
        Self::new(name, FieldKind::List(element))
    }

    pub fn set(name: impl Into<String>, element: ScalarKind) -> Self {
        Self::new(name, FieldKind::Set(element))
    }

    pub fn map(name: impl Into<String>, key: ScalarKind, value: ScalarKind) -> Self {
        Self::new(name, FieldKind::Map { key, value })
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
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

    pub fn entry_table(mut self, table: impl Into<String>) -> Self {
        self.entry_table = Some(table.into());
        self
    }

    pub fn is_complex(&self) -> bool {
        self.kind.is_complex()
    }

    pub fn is_reference(&self) -> bool {
        self.kind.is_reference()
    }

    /// Entry table name; `None` for column-backed fields.
    pub fn entry_table_name(&self) -> Option<&str> {
        self.entry_table.as_deref()
    }
}

/// One domain class: its own table and the fields declared on it.
///
/// Inherited fields live in the parent's table; an object of a derived
/// class has one row per layer, all sharing the same id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: ClassName,
    pub table: String,
    pub parent: Option<ClassName>,
    pub fields: Vec<FieldDef>,
    /// Whether the data horizon filters initial loads of this class.
    pub horizon_controlled: bool,
}

impl ClassDef {
    pub fn new(name: impl Into<ClassName>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            parent: None,
            fields: Vec::new(),
            horizon_controlled: false,
        }
    }

    pub fn extends(mut self, parent: impl Into<ClassName>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Declare a field. Complex fields without an explicit entry table get
    /// `<table>_<field>`.
    pub fn field(mut self, mut field: FieldDef) -> Self {
        if field.is_complex() && field.entry_table.is_none() {
            field.entry_table = Some(format!("{}_{}", self.table, field.name));
        }
        self.fields.push(field);
        self
    }

    pub fn horizon_controlled(mut self) -> Self {
        self.horizon_controlled = true;
        self
    }

    pub fn is_base(&self) -> bool {
        self.parent.is_none()
    }

    pub fn get(&self, field: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == field)
    }

    /// Column-backed fields (scalars and references).
    pub fn column_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| !f.is_complex())
    }

    pub fn complex_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.is_complex())
    }

    pub fn reference_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.is_reference())
    }

    /// Field owning `column`, if any.
    pub fn field_for_column(&self, column: &str) -> Option<&FieldDef> {
        self.column_fields().find(|f| f.column == column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complex_fields_get_default_entry_table() {
        let class = ClassDef::new("Order", "orders")
            .field(FieldDef::list("lines", ScalarKind::Text))
            .field(FieldDef::set("tags", ScalarKind::Text).entry_table("order_tags"))
            .field(FieldDef::text("number"));
        assert_eq!(
            class.get("lines").unwrap().entry_table_name(),
            Some("orders_lines")
        );
        assert_eq!(
            class.get("tags").unwrap().entry_table_name(),
            Some("order_tags")
        );
        assert_eq!(class.get("number").unwrap().entry_table_name(), None);
    }

    #[test]
    fn field_partitions() {
        let class = ClassDef::new("Order", "orders")
            .field(FieldDef::reference("customer", "Customer"))
            .field(FieldDef::text("number").column("order_number"))
            .field(FieldDef::map("attrs", ScalarKind::Text, ScalarKind::Int));
        assert_eq!(class.column_fields().count(), 2);
        assert_eq!(class.complex_fields().count(), 1);
        assert_eq!(class.reference_fields().count(), 1);
        assert_eq!(
            class.field_for_column("order_number").map(|f| f.name.as_str()),
            Some("number")
        );
    }

    #[test]
    fn kinds_accept_matching_values() {
        let text = FieldKind::Scalar(ScalarKind::Text);
        assert!(text.accepts(&FieldValue::from("x")));
        assert!(text.accepts(&FieldValue::Scalar(Value::Null)));
        assert!(!text.accepts(&FieldValue::from(3)));
        assert!(!text.accepts(&FieldValue::Reference(None)));

        let list = FieldKind::List(ScalarKind::Int);
        assert!(list.accepts(&FieldValue::List(vec![Value::Int(1), Value::Null])));
        assert!(!list.accepts(&FieldValue::List(vec![Value::from("a")])));
        assert!(list.empty_value().is_empty());
    }

    #[test]
    fn defaults() {
        let f = FieldDef::text("name");
        assert!(f.nullable);
        assert!(!f.unique);
        assert_eq!(f.column, "name");
        let g = f.not_null().unique().max_length(10);
        assert!(!g.nullable && g.unique);
        assert_eq!(g.max_length, Some(10));
    }
}
