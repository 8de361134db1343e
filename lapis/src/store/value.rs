use crate::errors::{ErrorKind, LapisError, LapisResult};
use std::fmt::{Display, Formatter};

/// A stored column value.
///
/// The backing store keeps integer-keyed tables whose values are either
/// integers (mapping tables), opaque byte blobs (page images), or null
/// (placeholder rows written only to reserve an auto-assigned key).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Value {
    /// Represents a null value.
    #[default]
    Null,
    /// Represents a signed 64-bit integer value.
    Integer(i64),
    /// Represents an opaque byte blob.
    Blob(Vec<u8>),
}

impl Value {
    /// Returns the integer content, or an error when the value holds a
    /// different type.
    pub fn as_integer(&self) -> LapisResult<i64> {
        match self {
            Value::Integer(i) => Ok(*i),
            other => Err(LapisError::new(
                &format!("expected integer value, found {}", other),
                ErrorKind::InvalidOperation,
            )),
        }
    }

    /// Returns the blob content, or an error when the value holds a
    /// different type.
    pub fn as_blob(&self) -> LapisResult<&[u8]> {
        match self {
            Value::Blob(b) => Ok(b),
            other => Err(LapisError::new(
                &format!("expected blob value, found {}", other),
                ErrorKind::InvalidOperation,
            )),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Blob(b) => write!(f, "blob({} bytes)", b.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Blob(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Blob(value.to_vec())
    }
}
