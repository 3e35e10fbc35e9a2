use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::identity::ObjectId;

/// Kind of a scalar column or collection element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    Bool,
    Int,
    Text,
    Time,
}

impl ScalarKind {
    /// Returns `true` if `value` may be stored in a column of this kind.
    /// `Null` is accepted by every kind; nullability is a column property.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (ScalarKind::Bool, Value::Bool(_))
                | (ScalarKind::Int, Value::Int(_))
                | (ScalarKind::Text, Value::Text(_))
                | (ScalarKind::Time, Value::Time(_))
        )
    }

    /// Check `value` against this kind.
    pub fn check(&self, value: &Value) -> Result<(), TypeError> {
        if self.accepts(value) {
            Ok(())
        } else {
            Err(TypeError::KindMismatch {
                expected: self.to_string(),
                actual: value.kind_name().to_string(),
            })
        }
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarKind::Bool => "bool",
            ScalarKind::Int => "int",
            ScalarKind::Text => "text",
            ScalarKind::Time => "time",
        };
        f.write_str(name)
    }
}

/// A single column value.
///
/// Values are totally ordered so they can key sets and maps; the ordering
/// across kinds is the declaration order of the variants, with `Null` first.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Time(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Time(t) => Some(*t),
            _ => None,
        }
    }

    /// Interpret an integer column as an object id.
    pub fn as_object_id(&self) -> Option<ObjectId> {
        self.as_int().and_then(|raw| ObjectId::new(raw).ok())
    }

    /// The scalar kind of this value, or `None` for `Null`.
    pub fn kind(&self) -> Option<ScalarKind> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ScalarKind::Bool),
            Value::Int(_) => Some(ScalarKind::Int),
            Value::Text(_) => Some(ScalarKind::Text),
            Value::Time(_) => Some(ScalarKind::Time),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Text(_) => "text",
            Value::Time(_) => "time",
        }
    }

    /// Length in characters for text values.
    pub fn text_len(&self) -> Option<usize> {
        self.as_text().map(|s| s.chars().count())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Text(s) => write!(f, "'{s}'"),
            Value::Time(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Time(t)
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::Int(id.get())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
