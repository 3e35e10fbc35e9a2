//! Field values and field-level diagnostics.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::ObjectId;
use crate::value::Value;

/// The typed value of one domain-object field.
///
/// This is the canonical representation used for diffing: sets and maps
/// compare logically (by content), lists compare by sequence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    /// A plain column value.
    Scalar(Value),
    /// The id of a registered target object, or `None`.
    Reference(Option<ObjectId>),
    /// An ordered sequence persisted with sparse order keys.
    List(Vec<Value>),
    Set(BTreeSet<Value>),
    Map(BTreeMap<Value, Value>),
}

impl FieldValue {
    /// Returns `true` for list, set and map values (entry-table backed).
    pub fn is_complex(&self) -> bool {
        matches!(
            self,
            FieldValue::List(_) | FieldValue::Set(_) | FieldValue::Map(_)
        )
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            FieldValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<ObjectId> {
        match self {
            FieldValue::Reference(target) => *target,
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            FieldValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&BTreeSet<Value>> {
        match self {
            FieldValue::Set(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<Value, Value>> {
        match self {
            FieldValue::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// `true` for null scalars, null references and empty collections.
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Scalar(v) => v.is_null(),
            FieldValue::Reference(target) => target.is_none(),
            FieldValue::List(items) => items.is_empty(),
            FieldValue::Set(items) => items.is_empty(),
            FieldValue::Map(entries) => entries.is_empty(),
        }
    }
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        FieldValue::Scalar(v)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Scalar(Value::from(s))
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Scalar(Value::Int(i))
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Scalar(Value::Bool(b))
    }
}

impl From<ObjectId> for FieldValue {
    fn from(id: ObjectId) -> Self {
        FieldValue::Reference(Some(id))
    }
}

/// How severe a [`FieldError`] is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Lossy but accepted, e.g. truncation. The object stays valid.
    Warning,
    /// The value was not persisted. The object is invalid until corrected.
    Critical,
}

/// What went wrong with a field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldErrorKind {
    NotNull,
    Unique,
    TooLong { max: usize, actual: usize },
    Truncated { max: usize, actual: usize },
    ForeignKey,
    Conversion(String),
    Database(String),
}

impl fmt::Display for FieldErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldErrorKind::NotNull => f.write_str("value must not be null"),
            FieldErrorKind::Unique => f.write_str("value must be unique"),
            FieldErrorKind::TooLong { max, actual } => {
                write!(f, "value too long ({actual} > {max})")
            }
            FieldErrorKind::Truncated { max, actual } => {
                write!(f, "value truncated from {actual} to {max} characters")
            }
            FieldErrorKind::ForeignKey => f.write_str("referenced row does not exist"),
            FieldErrorKind::Conversion(reason) => write!(f, "conversion failed: {reason}"),
            FieldErrorKind::Database(reason) => write!(f, "database error: {reason}"),
        }
    }
}

/// A warning or error attached to one field of one object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub severity: Severity,
    pub kind: FieldErrorKind,
}

impl FieldError {
    pub fn critical(field: impl Into<String>, kind: FieldErrorKind) -> Self {
        Self {
            field: field.into(),
            severity: Severity::Critical,
            kind,
        }
    }

    pub fn warning(field: impl Into<String>, kind: FieldErrorKind) -> Self {
        Self {
            field: field.into(),
            severity: Severity::Warning,
            kind,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Warning => "warning",
            Severity::Critical => "error",
        };
        write!(f, "{level} on field '{}': {}", self.field, self.kind)
    }
}
