//! Represents an object (blob) held by an object store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;

/// User metadata carried alongside an object payload.
pub type Metadata = BTreeMap<String, String>;

/// What an existence probe reports about an object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectStat {
    /// Size in bytes.
    pub size: u64,

    /// Content-identity tag as the store reports it (possibly quoted, possibly
    /// a multipart composite).
    pub etag: String,

    /// User metadata copied verbatim on transfer.
    pub metadata: Metadata,
}

/// Metadata row for an object stored by the filesystem-backed store.
///
/// The payload bytes live on disk; this row holds what a probe returns.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StoredObject {
    /// Bucket (namespace) the object belongs to.
    pub bucket: String,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 hex digest, or `<md5-of-part-md5s>-<parts>` for multipart uploads.
    pub etag: String,

    /// JSON-encoded user metadata.
    pub metadata: String,

    /// Timestamp when object was last written.
    pub last_modified: DateTime<Utc>,
}

impl StoredObject {
    /// Convert the row into the probe view, quoting the tag the way HTTP
    /// object stores return it.
    pub fn to_stat(&self) -> serde_json::Result<ObjectStat> {
        Ok(ObjectStat {
            size: self.size_bytes.max(0) as u64,
            etag: format!("\"{}\"", self.etag),
            metadata: serde_json::from_str(&self.metadata)?,
        })
    }
}
