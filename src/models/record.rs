//! Candidate records and the store pairs a run can operate on.

use crate::keys::KeyLayout;
use crate::models::document::Document;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;

/// Collection names, as the deployed stores know them.
pub mod collections {
    pub const LEGACY_NODES: &str = "Nodes";
    pub const LEGACY_USERS: &str = "Users";
    pub const BLOB_NODES: &str = "nodes";
    pub const BLOB_USERS: &str = "users";
    pub const NODE_MAP: &str = "shock_nodeMap";
    pub const WORKSPACE_OBJECTS: &str = "s3_objects";
}

/// Which record collection and object layout a run works against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Blob store nodes; objects under sharded keys.
    Blobstore,
    /// Workspace object records; the record already holds the object key.
    Workspace,
    /// Legacy nodes; objects under the suffixed legacy layout, copied to
    /// sharded keys.
    Shock,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Blobstore => "blobstore",
            Mode::Workspace => "workspace",
            Mode::Shock => "shock",
        }
    }

    /// Collection scanned for candidates.
    pub fn record_collection(self) -> &'static str {
        match self {
            Mode::Blobstore => collections::BLOB_NODES,
            Mode::Workspace => collections::WORKSPACE_OBJECTS,
            Mode::Shock => collections::LEGACY_NODES,
        }
    }

    /// Collection a verification pass scans; checking workspace records
    /// against a target store starts from the legacy node map.
    pub fn verify_collection(self, check_records: bool) -> &'static str {
        match self {
            Mode::Workspace if check_records => collections::NODE_MAP,
            _ => self.record_collection(),
        }
    }

    /// Collection in the target record store that must hold a counterpart of
    /// every scanned record.
    pub fn target_collection(self) -> &'static str {
        match self {
            Mode::Blobstore | Mode::Shock => collections::BLOB_NODES,
            Mode::Workspace => collections::WORKSPACE_OBJECTS,
        }
    }

    pub fn source_layout(self) -> KeyLayout {
        match self {
            Mode::Blobstore => KeyLayout::Sharded,
            Mode::Workspace => KeyLayout::Verbatim,
            Mode::Shock => KeyLayout::LegacySuffixed,
        }
    }

    pub fn destination_layout(self) -> KeyLayout {
        match self {
            Mode::Blobstore | Mode::Shock => KeyLayout::Sharded,
            Mode::Workspace => KeyLayout::Verbatim,
        }
    }

    /// Project a stored document onto the fields the engine needs.
    ///
    /// Only the identifier is mandatory; a missing checksum becomes `None`.
    pub fn parse_record(self, doc: &Document) -> serde_json::Result<MigrationRecord> {
        let record = match self {
            Mode::Blobstore => {
                let view: BlobNodeView = doc.parse()?;
                MigrationRecord {
                    id: view.id,
                    created: doc.stamp,
                    size: view.size,
                    checksum: view.md5,
                    owner: view.own.map(|own| own.id),
                }
            }
            Mode::Workspace => {
                let view: ObjectKeyView = doc.parse()?;
                MigrationRecord {
                    id: view.key,
                    created: doc.stamp,
                    size: None,
                    checksum: view.chksum,
                    owner: None,
                }
            }
            Mode::Shock => {
                let view: LegacyNodeView = doc.parse()?;
                let (size, checksum) = match view.file {
                    Some(file) => (file.size, file.checksum.and_then(|c| c.md5)),
                    None => (None, None),
                };
                MigrationRecord {
                    id: view.id,
                    created: doc.stamp,
                    size,
                    checksum,
                    owner: view.acl.and_then(|acl| acl.owner),
                }
            }
        };
        Ok(record)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The view of one record that selection, transfer and verification share.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationRecord {
    /// Object identifier (node id, or the object key in workspace mode).
    pub id: String,
    pub created: DateTime<Utc>,
    pub size: Option<u64>,
    /// Declared content MD5; `None` for legacy records stored without one.
    pub checksum: Option<String>,
    /// Owning user id, where the collection records one.
    pub owner: Option<String>,
}

#[derive(Deserialize)]
struct BlobNodeView {
    id: String,
    #[serde(default)]
    md5: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    own: Option<OwnerView>,
}

#[derive(Deserialize)]
struct OwnerView {
    id: String,
}

#[derive(Deserialize)]
struct ObjectKeyView {
    key: String,
    #[serde(default)]
    chksum: Option<String>,
}

#[derive(Deserialize)]
struct LegacyNodeView {
    id: String,
    #[serde(default)]
    acl: Option<AclView>,
    #[serde(default)]
    file: Option<FileView>,
}

#[derive(Deserialize)]
struct AclView {
    #[serde(default)]
    owner: Option<String>,
}

#[derive(Deserialize)]
struct FileView {
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    checksum: Option<ChecksumView>,
}

#[derive(Deserialize)]
struct ChecksumView {
    #[serde(default)]
    md5: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(body: serde_json::Value) -> Document {
        Document::new("ignored", Utc::now(), body)
    }

    #[test]
    fn legacy_node_without_checksum_gets_null() {
        let record = Mode::Shock
            .parse_record(&doc(json!({
                "id": "06f5d3ec-8ebf-4d32-8c1c-41e27e40b7fd",
                "acl": {"owner": "u1", "read": []},
                "file": {"name": "reads.fq", "size": 12, "format": "fastq"}
            })))
            .unwrap();
        assert_eq!(record.checksum, None);
        assert_eq!(record.size, Some(12));
        assert_eq!(record.owner.as_deref(), Some("u1"));
    }

    #[test]
    fn workspace_record_uses_key_as_identifier() {
        let record = Mode::Workspace
            .parse_record(&doc(json!({
                "chksum": "5d41402abc4b2a76b9719d911017c592",
                "key": "ab/cd/ef/abcdef12-0000-0000-0000-000000000000",
                "sorted": false
            })))
            .unwrap();
        assert_eq!(record.id, "ab/cd/ef/abcdef12-0000-0000-0000-000000000000");
        assert_eq!(
            record.checksum.as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );
    }

    #[test]
    fn record_without_identifier_is_malformed() {
        assert!(Mode::Blobstore.parse_record(&doc(json!({"md5": "x"}))).is_err());
    }
}
