//! Filesystem-backed object store.
//!
//! Payloads live on disk under `base_path/{bucket}/{key}`; since migrated keys
//! are already sharded, the key itself is the directory layout. Sizes, tags
//! and user metadata live in the `objects` table so a head never touches the
//! payload.

use super::{ByteStream, ObjectStore, StoreError, StoreResult, connect_sqlite};
use crate::models::object::{Metadata, ObjectStat, StoredObject};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use md5::Context;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;

/// How the tag of a written payload is derived.
#[derive(Clone, Copy, PartialEq, Eq)]
enum TagKind {
    /// MD5 of the whole payload.
    Whole,
    /// `md5(md5(part1) || … || md5(partN))-N`, one stream item per part.
    Multipart,
}

#[derive(Clone)]
pub struct FsObjectStore {
    /// Shared SQLite pool holding object rows.
    pub db: Arc<SqlitePool>,

    /// Root directory for payloads.
    pub base_path: PathBuf,

    pub bucket: String,
}

impl FsObjectStore {
    pub fn new(
        db: Arc<SqlitePool>,
        base_path: impl Into<PathBuf>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            bucket: bucket.into(),
        }
    }

    /// Connect to the metadata database and create the bucket directory.
    pub async fn open(
        database_url: &str,
        base_path: impl Into<PathBuf>,
        bucket: impl Into<String>,
    ) -> StoreResult<Self> {
        let store = Self::new(
            Arc::new(connect_sqlite(database_url).await?),
            base_path,
            bucket,
        );
        ensure_bucket_safe(&store.bucket)?;
        fs::create_dir_all(store.bucket_root()).await?;
        Ok(store)
    }

    /// Reject keys that could escape the bucket directory.
    fn ensure_key_safe(&self, key: &str) -> StoreResult<()> {
        let invalid = || StoreError::InvalidObjectKey(key.to_string());
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(invalid());
        }
        if key.starts_with('/') || key.ends_with('/') || key.contains("..") {
            return Err(invalid());
        }
        if key.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
            return Err(invalid());
        }
        Ok(())
    }

    fn bucket_root(&self) -> PathBuf {
        self.base_path.join(&self.bucket)
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let mut path = self.bucket_root();
        for segment in key.split('/') {
            path.push(segment);
        }
        path
    }

    async fn fetch_row(&self, key: &str) -> StoreResult<Option<StoredObject>> {
        let row = sqlx::query_as::<_, StoredObject>(
            "SELECT bucket, key, size_bytes, etag, metadata, last_modified
             FROM objects WHERE bucket = ? AND key = ?",
        )
        .bind(&self.bucket)
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row)
    }

    fn stat_of(row: &StoredObject) -> StoreResult<ObjectStat> {
        row.to_stat().map_err(|err| {
            StoreError::Io(io::Error::new(
                ErrorKind::InvalidData,
                format!("metadata of `{}` unreadable: {}", row.key, err),
            ))
        })
    }

    /// Stream a payload to disk through a temp file, then record its row.
    async fn write_object(
        &self,
        key: &str,
        metadata: &Metadata,
        body: ByteStream,
        kind: TagKind,
    ) -> StoreResult<ObjectStat> {
        self.ensure_key_safe(key)?;

        let file_path = self.object_path(key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let (size_bytes, etag) = match write_payload(&tmp_path, body, kind).await {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        };

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        let encoded = serde_json::to_string(metadata).map_err(|err| {
            StoreError::Io(io::Error::new(ErrorKind::InvalidData, err.to_string()))
        })?;

        let insert_result = sqlx::query_as::<_, StoredObject>(
            r#"
            INSERT INTO objects (bucket, key, size_bytes, etag, metadata, last_modified)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                metadata = excluded.metadata,
                last_modified = excluded.last_modified
            RETURNING bucket, key, size_bytes, etag, metadata, last_modified
            "#,
        )
        .bind(&self.bucket)
        .bind(key)
        .bind(size_bytes)
        .bind(&etag)
        .bind(&encoded)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        match insert_result {
            Ok(row) => {
                debug!("stored {} ({} bytes, etag {})", key, size_bytes, etag);
                Self::stat_of(&row)
            }
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(StoreError::Sqlx(err))
            }
        }
    }
}

/// Write every chunk of `body` into a fresh file at `path`, fsync it and
/// return its size and tag.
async fn write_payload(
    path: &Path,
    mut body: ByteStream,
    kind: TagKind,
) -> io::Result<(i64, String)> {
    let mut file = File::create(path).await?;
    let mut size_bytes: i64 = 0;
    let mut digest = Context::new();
    let mut part_digests: Vec<u8> = Vec::new();
    let mut parts = 0usize;

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        size_bytes += chunk.len() as i64;
        match kind {
            TagKind::Whole => digest.consume(&chunk),
            TagKind::Multipart => {
                part_digests.extend_from_slice(&md5::compute(&chunk).0);
                parts += 1;
            }
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;

    let etag = match kind {
        TagKind::Whole => format!("{:x}", digest.compute()),
        TagKind::Multipart if parts == 0 => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "multipart upload with no parts",
            ));
        }
        TagKind::Multipart => format!("{:x}-{}", md5::compute(&part_digests), parts),
    };
    Ok((size_bytes, etag))
}

fn ensure_bucket_safe(bucket: &str) -> StoreResult<()> {
    if bucket.is_empty()
        || bucket.contains('/')
        || bucket.contains("..")
        || bucket.bytes().any(|b| b.is_ascii_control() || b == b'\\')
    {
        return Err(StoreError::Unavailable(format!(
            "bucket name `{}` is not usable as a directory",
            bucket
        )));
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn head(&self, key: &str) -> StoreResult<Option<ObjectStat>> {
        self.ensure_key_safe(key)?;
        match self.fetch_row(key).await? {
            Some(row) => Ok(Some(Self::stat_of(&row)?)),
            None => Ok(None),
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<(ObjectStat, ByteStream)>> {
        self.ensure_key_safe(key)?;
        let Some(row) = self.fetch_row(key).await? else {
            return Ok(None);
        };

        let file = match File::open(self.object_path(key)).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("row for {} has no payload on disk", key);
                return Ok(None);
            }
            Err(err) => return Err(StoreError::Io(err)),
        };

        let body: ByteStream = Box::pin(ReaderStream::new(file));
        Ok(Some((Self::stat_of(&row)?, body)))
    }

    async fn put(
        &self,
        key: &str,
        metadata: &Metadata,
        body: ByteStream,
    ) -> StoreResult<ObjectStat> {
        self.write_object(key, metadata, body, TagKind::Whole).await
    }

    async fn put_multipart(
        &self,
        key: &str,
        metadata: &Metadata,
        parts: ByteStream,
    ) -> StoreResult<ObjectStat> {
        self.write_object(key, metadata, parts, TagKind::Multipart)
            .await
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::{TryStreamExt, stream};

    async fn store(dir: &Path) -> FsObjectStore {
        FsObjectStore::open("sqlite::memory:", dir, "blobs").await.unwrap()
    }

    fn body(chunks: &[&'static [u8]]) -> ByteStream {
        let items: Vec<io::Result<Bytes>> =
            chunks.iter().map(|c| Ok(Bytes::from_static(c))).collect();
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn put_then_head_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let mut metadata = Metadata::new();
        metadata.insert("filename".into(), "reads.fq".into());

        let stat = store
            .put("ab/cd/ef/abcdef", &metadata, body(&[b"hel", b"lo"]))
            .await
            .unwrap();
        assert_eq!(stat.size, 5);
        assert_eq!(stat.etag, "\"5d41402abc4b2a76b9719d911017c592\"");

        let head = store.head("ab/cd/ef/abcdef").await.unwrap().unwrap();
        assert_eq!(head, stat);
        assert!(dir.path().join("blobs/ab/cd/ef/abcdef").is_file());

        let (got, stream) = store.get("ab/cd/ef/abcdef").await.unwrap().unwrap();
        assert_eq!(got.metadata, metadata);
        let bytes: Vec<Bytes> = stream.try_collect().await.unwrap();
        assert_eq!(bytes.concat(), b"hello");
    }

    #[tokio::test]
    async fn missing_objects_are_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        assert!(store.head("ab/cd/ef/missing").await.unwrap().is_none());
        assert!(store.get("ab/cd/ef/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn multipart_writes_composite_tag() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let stat = store
            .put_multipart("ab/cd/ef/big", &Metadata::new(), body(&[b"aa", b"bb"]))
            .await
            .unwrap();

        let mut concat = Vec::new();
        concat.extend_from_slice(&md5::compute(b"aa").0);
        concat.extend_from_slice(&md5::compute(b"bb").0);
        let expected = format!("\"{:x}-2\"", md5::compute(&concat));
        assert_eq!(stat.etag, expected);
        assert_eq!(stat.size, 4);
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let err = store
            .put("../escape", &Metadata::new(), body(&[b"x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidObjectKey(_)));
    }
}
