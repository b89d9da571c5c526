//! Node records for the legacy store and for the blob store that replaces it.
//!
//! Field names follow the persisted document shapes; the Rust names are the
//! readable ones and `serde` renames bridge the two.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reader entry that marks a legacy node as world readable.
pub const PUBLIC_READER: &str = "public";

/// A node document in the legacy store (`Nodes` collection).
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct LegacyNode {
    pub id: String,

    /// Creation time; older documents may omit it, in which case the stored
    /// document stamp is used instead.
    #[serde(default)]
    pub created_on: Option<DateTime<Utc>>,

    pub acl: LegacyAcl,

    pub file: LegacyFile,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct LegacyAcl {
    /// User id of the owner.
    pub owner: String,

    /// User ids allowed to read, possibly including [`PUBLIC_READER`].
    #[serde(default)]
    pub read: Vec<String>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct LegacyFile {
    pub name: String,
    pub size: u64,
    pub format: String,

    /// Some legacy nodes were stored before checksums were recorded.
    #[serde(default)]
    pub checksum: LegacyChecksums,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct LegacyChecksums {
    #[serde(default)]
    pub md5: Option<String>,
}

/// A user document in the legacy store (`Users` collection).
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct LegacyUser {
    pub uuid: String,
    pub username: String,
}

/// User reference embedded in blob store documents; also the shape of the
/// blob store `users` collection.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UserRef {
    pub id: String,
    pub user: String,
}

/// A node document in the blob store (`nodes` collection).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BlobNode {
    pub id: String,

    #[serde(rename = "own")]
    pub owner: UserRef,

    #[serde(rename = "read")]
    pub readers: Vec<UserRef>,

    pub time: DateTime<Utc>,

    #[serde(rename = "fname")]
    pub filename: String,

    pub size: u64,

    #[serde(rename = "fmt")]
    pub format: String,

    /// Null when the legacy node carried no checksum.
    pub md5: Option<String>,

    #[serde(rename = "pub")]
    pub public: bool,
}
