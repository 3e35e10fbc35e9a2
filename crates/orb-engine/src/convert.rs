//! Conversion between field values and column values.

use orb_schema::{FieldDef, FieldKind};
use orb_types::{FieldValue, ObjectId, Value};

/// Column value persisted for a column-backed field.
pub(crate) fn to_column(def: &FieldDef, value: &FieldValue) -> Result<Value, String> {
    match (&def.kind, value) {
        (FieldKind::Scalar(kind), FieldValue::Scalar(v)) if kind.accepts(v) => Ok(v.clone()),
        (FieldKind::Reference { .. }, FieldValue::Reference(target)) => {
            Ok(target.map(Value::from).unwrap_or(Value::Null))
        }
        (kind, _) if kind.is_complex() => Err("stored in an entry table".into()),
        (kind, other) => Err(format!("{other:?} does not fit a {kind:?} field")),
    }
}

/// Field value of a column-backed field read from the database.
pub(crate) fn from_column(def: &FieldDef, value: &Value) -> Result<FieldValue, String> {
    match &def.kind {
        FieldKind::Scalar(kind) => {
            if kind.accepts(value) {
                Ok(FieldValue::Scalar(value.clone()))
            } else {
                Err(format!("expected {kind}, found {value}"))
            }
        }
        FieldKind::Reference { .. } => match value {
            Value::Null => Ok(FieldValue::Reference(None)),
            Value::Int(raw) => ObjectId::new(*raw)
                .map(|id| FieldValue::Reference(Some(id)))
                .map_err(|e| e.to_string()),
            other => Err(format!("expected an id, found {other}")),
        },
        _ => Err("stored in an entry table".into()),
    }
}

/// Cut `value` to `max` characters if it is longer. Returns the original
/// length when truncation happened.
pub(crate) fn truncate(value: &mut Value, max: usize) -> Option<usize> {
    let Value::Text(text) = value else {
        return None;
    };
    let actual = text.chars().count();
    if actual <= max {
        return None;
    }
    *text = text.chars().take(max).collect();
    Some(actual)
}
