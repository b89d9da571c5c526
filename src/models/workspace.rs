//! Workspace object mappings: the legacy node map and the object-key records
//! that replace it.

use serde::{Deserialize, Serialize};

/// Legacy mapping from a content checksum to the node holding the bytes
/// (`shock_nodeMap` collection).
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct NodeMapEntry {
    pub chksum: String,
    pub node: String,
    #[serde(default)]
    pub sorted: Option<bool>,
}

/// Mapping from a content checksum to its sharded object key (`s3_objects`
/// collection). Upserts are keyed by `chksum`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct S3ObjectRecord {
    pub chksum: String,
    pub key: String,
    pub sorted: bool,
}
