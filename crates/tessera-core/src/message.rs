//! Mutations and the messages that carry them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::timestamp::Timestamp;
use crate::types::Id;

/// A SQLite-compatible scalar value stored in a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Column soft-deletion is an ordinary column resolved by last-write-wins.
pub const IS_DELETED_COLUMN: &str = "isDeleted";

/// A single column-level mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbChange {
    pub table: String,
    pub id: Id,
    pub column: String,
    pub value: Value,
}

impl DbChange {
    pub fn new(
        table: impl Into<String>,
        id: Id,
        column: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            table: table.into(),
            id,
            column: column.into(),
            value: value.into(),
        }
    }

    /// Mark a row deleted.
    pub fn delete(table: impl Into<String>, id: Id) -> Self {
        Self::new(table, id, IS_DELETED_COLUMN, true)
    }

    pub fn cell_key(&self) -> CellKey {
        CellKey {
            table: self.table.clone(),
            id: self.id,
            column: self.column.clone(),
        }
    }
}

/// Address of a cell: `(table, row, column)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellKey {
    pub table: String,
    pub id: Id,
    pub column: String,
}

/// A stamped mutation in plaintext. Never leaves the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrdtMessage {
    pub timestamp: Timestamp,
    pub change: DbChange,
}

/// A stamped mutation as seen by the relay: the change is ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedCrdtMessage {
    pub timestamp: Timestamp,
    pub change: Bytes,
}

impl EncryptedCrdtMessage {
    pub fn new(timestamp: Timestamp, change: impl Into<Bytes>) -> Self {
        Self {
            timestamp,
            change: change.into(),
        }
    }
}
