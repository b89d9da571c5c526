//! Loosely typed documents as they live in a document store.

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::ops::AddAssign;

/// One stored document.
///
/// `stamp` is the monotonic field range queries run against (creation time for
/// node records, insertion time for mapping records). `body` keeps the raw JSON
/// so typed views can decide for themselves which fields are required.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub id: String,
    pub stamp: DateTime<Utc>,
    pub body: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, stamp: DateTime<Utc>, body: Value) -> Self {
        Self {
            id: id.into(),
            stamp,
            body,
        }
    }

    /// Serialize a typed record into a document body.
    pub fn from_typed<T: Serialize>(
        id: impl Into<String>,
        stamp: DateTime<Utc>,
        record: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(id, stamp, serde_json::to_value(record)?))
    }

    /// Parse the body into a typed view.
    pub fn parse<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.body)
    }
}

/// Per-batch result of an unordered bulk upsert.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BulkWriteSummary {
    pub inserted: u64,
    pub updated: u64,
    pub errors: u64,
}

impl AddAssign for BulkWriteSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
        self.errors += rhs.errors;
    }
}

/// Apply `patch` onto `existing` key by key, like a `$set` of every top-level field.
///
/// Fields absent from the patch are preserved; explicit nulls are written as nulls.
pub fn merge_top_level(existing: &mut Value, patch: Value) {
    match (existing, patch) {
        (Value::Object(current), Value::Object(fields)) => {
            for (key, value) in fields {
                current.insert(key, value);
            }
        }
        (slot, replacement) => *slot = replacement,
    }
}
