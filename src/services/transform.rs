//! Typed conversions from legacy records to their replacements.

use crate::{
    errors::{MigrateError, MigrateResult},
    keys::sharded_key,
    models::{
        document::Document,
        node::{BlobNode, LegacyNode, LegacyUser, PUBLIC_READER, UserRef},
        record::collections,
        workspace::{NodeMapEntry, S3ObjectRecord},
    },
    stores::DocumentStore,
};
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use tracing::debug;

/// Resolves user ids to usernames through the legacy user collection,
/// copying each user into the target store the first time it is seen.
///
/// The cache lives for one run. Two workers may race to resolve the same
/// user; both lookups agree and the upsert is idempotent.
pub struct UserResolver {
    source: Arc<dyn DocumentStore>,
    target: Arc<dyn DocumentStore>,
    cache: RwLock<HashMap<String, String>>,
}

impl UserResolver {
    pub fn new(source: Arc<dyn DocumentStore>, target: Arc<dyn DocumentStore>) -> Self {
        Self {
            source,
            target,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn cached(&self, user_id: &str) -> Option<String> {
        let cache = self.cache.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.get(user_id).cloned()
    }

    pub async fn resolve(&self, record_id: &str, user_id: &str) -> MigrateResult<UserRef> {
        if let Some(user) = self.cached(user_id) {
            return Ok(UserRef {
                id: user_id.to_string(),
                user,
            });
        }

        let unresolved = || MigrateError::UnresolvedUser {
            record_id: record_id.to_string(),
            user_id: user_id.to_string(),
        };
        let doc = self
            .source
            .find_one(collections::LEGACY_USERS, user_id)
            .await?
            .ok_or_else(unresolved)?;
        let legacy: LegacyUser = doc.parse().map_err(|_| unresolved())?;
        if legacy.username.is_empty() {
            return Err(unresolved());
        }

        let user = UserRef {
            id: user_id.to_string(),
            user: legacy.username,
        };
        let record = Document::from_typed(user_id, doc.stamp, &user).map_err(|err| {
            MigrateError::Conversion {
                id: user_id.to_string(),
                reason: err.to_string(),
            }
        })?;
        let summary = self
            .target
            .bulk_upsert(collections::BLOB_USERS, vec![record])
            .await?;
        if summary.errors > 0 {
            return Err(MigrateError::Conversion {
                id: user_id.to_string(),
                reason: "user record rejected by the target store".into(),
            });
        }
        debug!("resolved user {} as {}", user_id, user.user);

        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(user.id.clone(), user.user.clone());
        Ok(user)
    }
}

/// Convert a legacy node. The `public` reader becomes the public flag;
/// every other reader and the owner must resolve to a username.
pub async fn legacy_to_blob(
    node: LegacyNode,
    stamp: DateTime<Utc>,
    users: &UserResolver,
) -> MigrateResult<BlobNode> {
    let owner = users.resolve(&node.id, &node.acl.owner).await?;

    let public = node.acl.read.iter().any(|r| r == PUBLIC_READER);
    let mut readers = Vec::with_capacity(node.acl.read.len());
    for reader in node.acl.read.iter().filter(|r| *r != PUBLIC_READER) {
        readers.push(users.resolve(&node.id, reader).await?);
    }

    if node.file.checksum.md5.is_none() {
        debug!("node {} has no md5, recording null", node.id);
    }

    Ok(BlobNode {
        id: node.id,
        owner,
        readers,
        time: node.created_on.unwrap_or(stamp),
        filename: node.file.name,
        size: node.file.size,
        format: node.file.format,
        md5: node.file.checksum.md5,
        public,
    })
}

/// Map a node-map entry to the record pointing at its sharded key.
pub fn node_map_to_s3_object(entry: NodeMapEntry) -> MigrateResult<S3ObjectRecord> {
    Ok(S3ObjectRecord {
        key: sharded_key(&entry.node)?,
        chksum: entry.chksum,
        sorted: entry.sorted.unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_map_entry_gets_sharded_key() {
        let record = node_map_to_s3_object(NodeMapEntry {
            chksum: "5d41402abc4b2a76b9719d911017c592".into(),
            node: "06f5d3ec-8ebf-4d32-8c1c-41e27e40b7fd".into(),
            sorted: None,
        })
        .unwrap();
        assert_eq!(record.key, "06/f5/d3/06f5d3ec-8ebf-4d32-8c1c-41e27e40b7fd");
        assert!(!record.sorted);
    }

    #[test]
    fn node_map_entry_with_unshardable_node_fails() {
        let err = node_map_to_s3_object(NodeMapEntry {
            chksum: "x".into(),
            node: "abc".into(),
            sorted: Some(true),
        })
        .unwrap_err();
        assert!(matches!(err, MigrateError::Key(_)));
    }
}
