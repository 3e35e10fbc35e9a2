//! Persisted snapshots and field-level diffs.
//!
//! An [`ObjectRecord`] holds the last values actually written to or read
//! from the database for one object. It is the baseline for both directions:
//! save diffs the live fields against it, load diffs incoming rows against
//! it. Values are compared in their typed form, so sets and maps compare
//! logically regardless of row order.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use orb_schema::FieldDef;
use orb_types::FieldValue;

/// Last-known persisted state of one object, keyed by field name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectRecord {
    pub values: BTreeMap<String, FieldValue>,
    /// Persisted order keys of list fields, parallel to the list values.
    pub order_keys: BTreeMap<String, Vec<i64>>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ObjectRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a record from current field values. List order keys are
    /// unknown afterwards, so the next list change rewrites the list.
    pub fn from_fields(fields: &BTreeMap<String, FieldValue>) -> Self {
        Self {
            values: fields.clone(),
            ..Self::default()
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: FieldValue) {
        self.values.insert(field.into(), value);
    }

    pub fn order_keys(&self, field: &str) -> Option<&[i64]> {
        self.order_keys.get(field).map(Vec::as_slice)
    }

    pub fn set_order_keys(&mut self, field: impl Into<String>, keys: Vec<i64>) {
        self.order_keys.insert(field.into(), keys);
    }
}

/// One changed field: its name, the baseline value and the new value.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldChange {
    pub field: String,
    /// Baseline value; `None` when there was no record.
    pub old: Option<FieldValue>,
    pub new: FieldValue,
}

/// Diff `current` against `record` over the given field definitions.
///
/// Absent values count as the field kind's empty value. Without a record
/// (a new object) every field is reported as changed.
pub fn diff_fields<'a>(
    record: Option<&ObjectRecord>,
    current: &BTreeMap<String, FieldValue>,
    fields: impl IntoIterator<Item = &'a FieldDef>,
) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    for def in fields {
        let new = current
            .get(&def.name)
            .cloned()
            .unwrap_or_else(|| def.kind.empty_value());
        match record {
            None => changes.push(FieldChange {
                field: def.name.clone(),
                old: None,
                new,
            }),
            Some(record) => {
                let old = record
                    .get(&def.name)
                    .cloned()
                    .unwrap_or_else(|| def.kind.empty_value());
                if old != new {
                    changes.push(FieldChange {
                        field: def.name.clone(),
                        old: Some(old),
                        new,
                    });
                }
            }
        }
    }
    changes
}
