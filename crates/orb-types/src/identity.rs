use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Immutable numeric identity of a domain object.
///
/// Ids are strictly positive. Once assigned to an object an id never
/// changes, and `(class, id)` is unique within one object store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct ObjectId(i64);

impl ObjectId {
    /// Create an id, rejecting zero and negative values.
    pub fn new(raw: i64) -> Result<Self, TypeError> {
        if raw <= 0 {
            return Err(TypeError::InvalidId(raw));
        }
        Ok(Self(raw))
    }

    /// The raw numeric value as stored in the id column.
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for ObjectId {
    type Error = TypeError;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<ObjectId> for i64 {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Name of a domain class, e.g. `"Customer"`.
///
/// The same string is written to the class-discriminator column of the base
/// table, so it doubles as the key for resolving polymorphic ids.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassName(String);

impl ClassName {
    /// Create a class name without validation. Empty names are rejected by
    /// [`ClassName::parse`] and by schema validation.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Create a class name, rejecting the empty string.
    pub fn parse(name: &str) -> Result<Self, TypeError> {
        if name.trim().is_empty() {
            return Err(TypeError::EmptyClassName);
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClassName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassName({})", self.0)
    }
}

impl fmt::Display for ClassName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClassName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ClassName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl AsRef<str> for ClassName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
