//! Test fixtures: documents, identifiers and a wired-up sync environment.

use super::memory::MemoryObjectStore;
use blobstore_migrate::keys::KeyLayout;
use blobstore_migrate::models::document::Document;
use blobstore_migrate::models::record::{Mode, collections};
use blobstore_migrate::services::checkpoint::CheckpointStore;
use blobstore_migrate::services::ledger::Ledger;
use blobstore_migrate::services::record_source::{RecordFilter, RecordSource};
use blobstore_migrate::services::sync::{SyncOptions, SyncReport, run_sync};
use blobstore_migrate::services::transfer::{TransferEngine, TransferSettings};
use blobstore_migrate::services::transporter::MultipartTransporter;
use blobstore_migrate::stores::DocumentStore;
use blobstore_migrate::stores::sqlite_documents::SqliteDocumentStore;
use blobstore_migrate::MigrateResult;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

/// Midnight UTC on the given day of August 2020.
pub fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 8, day, 0, 0, 0).unwrap()
}

/// A UUID-shaped identifier that shards on its leading hex digits.
pub fn node_id(i: u32) -> String {
    format!("{:08x}-8ebf-4d32-8c1c-{:012x}", 0x06f5_d300 + i, i)
}

#[allow(dead_code)]
pub fn blob_node_doc(id: &str, stamp: DateTime<Utc>, md5: Option<&str>) -> Document {
    Document::new(
        id,
        stamp,
        json!({
            "id": id,
            "own": {"id": "u-alice", "user": "alice"},
            "read": [],
            "time": stamp,
            "fname": "reads.fq",
            "size": 5,
            "fmt": "fastq",
            "md5": md5,
            "pub": false,
        }),
    )
}

#[allow(dead_code)]
pub fn legacy_node_doc(
    id: &str,
    stamp: DateTime<Utc>,
    owner: &str,
    readers: &[&str],
    md5: Option<&str>,
) -> Document {
    let checksum = match md5 {
        Some(md5) => json!({"md5": md5}),
        None => json!({}),
    };
    Document::new(
        id,
        stamp,
        json!({
            "id": id,
            "created_on": stamp,
            "acl": {"owner": owner, "read": readers},
            "file": {"name": "reads.fq", "size": 5, "format": "fastq", "checksum": checksum},
        }),
    )
}

#[allow(dead_code)]
pub fn legacy_user_doc(uuid: &str, username: &str) -> Document {
    Document::new(uuid, at(1), json!({"uuid": uuid, "username": username}))
}

/// Record store, object stores and state directories for sync tests.
///
/// Each call to [`sync`](TestEnv::sync) opens the ledger afresh, as a new
/// process would.
#[allow(dead_code)]
pub struct TestEnv {
    pub mode: Mode,
    pub records: Arc<SqliteDocumentStore>,
    pub source: Arc<MemoryObjectStore>,
    pub destination: Arc<MemoryObjectStore>,
    pub state: TempDir,
    pub scratch: TempDir,
    pub large_object_threshold: u64,
    pub part_size: usize,
}

#[allow(dead_code)]
impl TestEnv {
    pub async fn new(mode: Mode) -> Self {
        Self {
            mode,
            records: Arc::new(SqliteDocumentStore::open("sqlite::memory:").await.unwrap()),
            source: MemoryObjectStore::new(),
            destination: MemoryObjectStore::new(),
            state: tempfile::tempdir().unwrap(),
            scratch: tempfile::tempdir().unwrap(),
            large_object_threshold: 1_000_000,
            part_size: 4,
        }
    }

    /// Add a blob node record and, when `data` is given, its source object.
    pub async fn add_blob_node(&self, id: &str, stamp: DateTime<Utc>, data: Option<&[u8]>) {
        let md5 = data.map(|d| format!("{:x}", md5::compute(d)));
        self.records
            .bulk_upsert(
                collections::BLOB_NODES,
                vec![blob_node_doc(id, stamp, md5.as_deref())],
            )
            .await
            .unwrap();
        if let Some(data) = data {
            self.source
                .insert(&self.source_key(id), data, Default::default());
        }
    }

    pub fn source_key(&self, id: &str) -> String {
        self.mode.source_layout().storage_key(id).unwrap()
    }

    pub fn dest_key(&self, id: &str) -> String {
        self.mode.destination_layout().storage_key(id).unwrap()
    }

    pub fn checkpoint(&self) -> CheckpointStore {
        CheckpointStore::in_dir(self.state.path())
    }

    pub async fn ledger(&self) -> Arc<Ledger> {
        Arc::new(Ledger::open(self.state.path()).await.unwrap())
    }

    pub fn settings(&self, dry_run: bool) -> TransferSettings {
        TransferSettings {
            workers: 4,
            large_object_threshold: self.large_object_threshold,
            dry_run,
            ..TransferSettings::new(self.mode.source_layout(), self.mode.destination_layout())
        }
    }

    pub async fn engine(&self, dry_run: bool) -> TransferEngine {
        TransferEngine::new(
            self.source.clone(),
            self.destination.clone(),
            self.ledger().await,
            Arc::new(MultipartTransporter::new(self.scratch.path(), self.part_size)),
            self.settings(dry_run),
        )
    }

    pub fn options(&self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> SyncOptions {
        SyncOptions {
            mode: self.mode,
            start,
            end,
            reset_ledger: false,
            filter: RecordFilter::none(),
        }
    }

    /// One pass with the given options, run "now" at `now`.
    pub async fn sync_with(
        &self,
        options: SyncOptions,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> MigrateResult<SyncReport> {
        let records = RecordSource::new(self.records.clone(), 2);
        let engine = self.engine(dry_run).await;
        run_sync(&records, &engine, &self.checkpoint(), options, now).await
    }

    pub async fn sync(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> MigrateResult<SyncReport> {
        self.sync_with(self.options(start, end), false, at(28)).await
    }
}

#[allow(dead_code)]
pub fn sharded(id: &str) -> String {
    KeyLayout::Sharded.storage_key(id).unwrap()
}
