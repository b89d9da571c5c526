//! Store abstractions the engines depend on, plus the SQLite/filesystem
//! backends shipped with the crate.
//!
//! Heads and gets report absence as `Ok(None)`; an `Err` always means the
//! store itself misbehaved and the run should stop.

pub mod fs_objects;
pub mod sqlite_documents;

use crate::models::{
    document::{BulkWriteSummary, Document},
    object::{Metadata, ObjectStat},
    window::TransferWindow,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::{io, path::Path, pin::Pin};
use thiserror::Error;

/// Object payload as a stream of chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Documents yielded by a scan, in store order.
pub type DocumentStream<'a> = Pin<Box<dyn Stream<Item = StoreResult<Document>> + Send + 'a>>;

const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("document `{id}` in `{collection}` is unreadable: {reason}")]
    InvalidDocument {
        collection: String,
        id: String,
        reason: String,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Errors confined to a single record; a scan may skip past them.
    pub fn is_record_level(&self) -> bool {
        matches!(self, StoreError::InvalidDocument { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Document store: range scans over the stamp field, point lookups and
/// unordered bulk upserts.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Stream every document of `collection` whose stamp lies in `window`.
    ///
    /// Implementations fetch `batch_size` documents per round trip and must
    /// not hold a cursor that the server can expire between batches.
    fn scan<'a>(
        &'a self,
        collection: &'a str,
        window: TransferWindow,
        batch_size: usize,
    ) -> DocumentStream<'a>;

    async fn count(&self, collection: &str, window: TransferWindow) -> StoreResult<u64>;

    async fn find_one(&self, collection: &str, id: &str) -> StoreResult<Option<Document>>;

    /// Upsert by id, merging top-level fields into an existing document.
    ///
    /// Individual document failures are counted in the summary rather than
    /// failing the batch.
    async fn bulk_upsert(
        &self,
        collection: &str,
        docs: Vec<Document>,
    ) -> StoreResult<BulkWriteSummary>;
}

/// Object store: probes, streaming reads and writes, and a multipart write
/// for objects too large to send in one piece.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head(&self, key: &str) -> StoreResult<Option<ObjectStat>>;

    async fn get(&self, key: &str) -> StoreResult<Option<(ObjectStat, ByteStream)>>;

    async fn put(&self, key: &str, metadata: &Metadata, body: ByteStream)
    -> StoreResult<ObjectStat>;

    /// Write an object from a stream in which every item is one whole part.
    ///
    /// The resulting tag is the multipart composite
    /// `md5(md5(part1) || … || md5(partN))-N`.
    async fn put_multipart(
        &self,
        key: &str,
        metadata: &Metadata,
        parts: ByteStream,
    ) -> StoreResult<ObjectStat>;

    /// Name of this backend for logging.
    fn backend_name(&self) -> &'static str;
}

/// Open a SQLite pool, creating the database file and its parent directory
/// when missing, and apply the schema.
pub async fn connect_sqlite(database_url: &str) -> StoreResult<SqlitePool> {
    let db_path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    let in_memory = db_path.starts_with(":memory:");

    if !in_memory {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(db_path)?;
    }

    let options = if in_memory {
        // every in-memory connection is its own database, so keep exactly one alive
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };
    let db = options.connect(database_url).await?;
    run_migrations(&db).await?;
    Ok(db)
}

/// Apply the embedded schema; every statement is idempotent.
pub async fn run_migrations(db: &SqlitePool) -> StoreResult<()> {
    let statements = INIT_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::debug!("Running {} schema statements", statements.len());

    for stmt in statements {
        sqlx::query(stmt).execute(db).await?;
    }
    Ok(())
}
