//! Replication records: documents and oplog entries.

use crate::hlc::HlcTimestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Kind of change recorded by an oplog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Insert or replace a document.
    Put,
    /// Delete a document, leaving a tombstone.
    Delete,
}

impl OperationType {
    /// Returns the wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Put => "Put",
            OperationType::Delete => "Delete",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Put" => Ok(OperationType::Put),
            "Delete" => Ok(OperationType::Delete),
            other => Err(format!("unknown operation: {other}")),
        }
    }
}

/// Materialized state of one `(collection, key)` pair.
///
/// `updated_at` is the timestamp of the oplog entry that produced this
/// state. A deleted document is kept as a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Collection name.
    pub collection: String,
    /// Document key, unique within the collection.
    pub key: String,
    /// JSON content. Empty object for tombstones.
    pub content: Value,
    /// Timestamp of the last applied change.
    pub updated_at: HlcTimestamp,
    /// Whether the document is a tombstone.
    pub is_deleted: bool,
}

impl Document {
    /// Creates a live document.
    pub fn new(
        collection: impl Into<String>,
        key: impl Into<String>,
        content: Value,
        updated_at: HlcTimestamp,
    ) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            content,
            updated_at,
            is_deleted: false,
        }
    }

    /// Creates a tombstone with empty content.
    pub fn tombstone(
        collection: impl Into<String>,
        key: impl Into<String>,
        updated_at: HlcTimestamp,
    ) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            content: empty_content(),
            updated_at,
            is_deleted: true,
        }
    }

    /// Materializes the state an entry describes, ignoring any local state.
    pub fn from_entry(entry: &OplogEntry) -> Self {
        Self {
            collection: entry.collection.clone(),
            key: entry.key.clone(),
            content: entry.payload.clone().unwrap_or_else(empty_content),
            updated_at: entry.timestamp.clone(),
            is_deleted: entry.operation == OperationType::Delete,
        }
    }
}

/// One immutable change in the append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    /// Collection name.
    pub collection: String,
    /// Document key.
    pub key: String,
    /// Put or delete.
    pub operation: OperationType,
    /// New content for puts. Absent for deletes.
    pub payload: Option<Value>,
    /// Timestamp issued by the originating node.
    pub timestamp: HlcTimestamp,
}

impl OplogEntry {
    /// Creates a put entry.
    pub fn put(
        collection: impl Into<String>,
        key: impl Into<String>,
        payload: Value,
        timestamp: HlcTimestamp,
    ) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            operation: OperationType::Put,
            payload: Some(payload),
            timestamp,
        }
    }

    /// Creates a delete entry.
    pub fn delete(
        collection: impl Into<String>,
        key: impl Into<String>,
        timestamp: HlcTimestamp,
    ) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            operation: OperationType::Delete,
            payload: None,
            timestamp,
        }
    }
}

pub(crate) fn empty_content() -> Value {
    Value::Object(serde_json::Map::new())
}
