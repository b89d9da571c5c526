//! Converts legacy record collections into their replacements and writes them
//! to the target document store with batched bulk upserts.

use crate::{
    errors::{MigrateError, MigrateResult},
    models::{
        document::{BulkWriteSummary, Document},
        node::LegacyNode,
        record::{Mode, collections},
        window::TransferWindow,
        workspace::NodeMapEntry,
    },
    services::{
        record_source::{RecordFilter, RecordSource},
        transform::{UserResolver, legacy_to_blob, node_map_to_s3_object},
    },
    stores::DocumentStore,
};
use futures::TryStreamExt;
use std::{fmt, sync::Arc};
use tracing::info;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub converted: u64,
    pub writes: BulkWriteSummary,
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "converted={} inserted={} updated={} write_errors={}",
            self.converted, self.writes.inserted, self.writes.updated, self.writes.errors
        )
    }
}

pub struct RecordMigration {
    source: RecordSource,
    target: Arc<dyn DocumentStore>,
    users: UserResolver,
    batch_size: usize,
}

impl RecordMigration {
    pub fn new(
        source: Arc<dyn DocumentStore>,
        target: Arc<dyn DocumentStore>,
        batch_size: usize,
    ) -> Self {
        Self {
            users: UserResolver::new(source.clone(), target.clone()),
            source: RecordSource::new(source, batch_size),
            target,
            batch_size: batch_size.max(1),
        }
    }

    pub fn source(&self) -> &RecordSource {
        &self.source
    }

    /// Convert every record of `mode` in `window`.
    ///
    /// A record that cannot be converted stops the run after the records
    /// converted so far have been written.
    pub async fn run(
        &self,
        mode: Mode,
        window: TransferWindow,
        filter: RecordFilter,
    ) -> MigrateResult<MigrationReport> {
        match mode {
            Mode::Shock => self.migrate_nodes(window, filter).await,
            Mode::Workspace => self.migrate_node_map(window).await,
            Mode::Blobstore => Err(MigrateError::Config(
                "blobstore records are already in their final form; use shock or workspace mode"
                    .into(),
            )),
        }
    }

    async fn migrate_nodes(
        &self,
        window: TransferWindow,
        filter: RecordFilter,
    ) -> MigrateResult<MigrationReport> {
        let collection = collections::LEGACY_NODES;
        let total = self.source.count(collection, window).await?;
        info!("converting up to {} legacy nodes in {}", total, window);

        let mut nodes = self.source.scan(collection, window, |doc| {
            let node: LegacyNode = doc.parse()?;
            Ok((node, doc.stamp))
        });

        let mut batch = Batch::new(self, collections::BLOB_NODES, total);
        let result = async {
            while let Some((node, stamp)) = nodes.try_next().await? {
                if !filter.admits_owner(Some(&node.acl.owner)) {
                    continue;
                }
                let blob = legacy_to_blob(node, stamp, &self.users).await?;
                let doc = Document::from_typed(blob.id.clone(), blob.time, &blob).map_err(
                    |err| MigrateError::Conversion {
                        id: blob.id.clone(),
                        reason: err.to_string(),
                    },
                )?;
                batch.push(doc).await?;
            }
            Ok::<(), MigrateError>(())
        }
        .await;

        batch.finish(result).await
    }

    async fn migrate_node_map(&self, window: TransferWindow) -> MigrateResult<MigrationReport> {
        let collection = collections::NODE_MAP;
        let total = self.source.count(collection, window).await?;
        info!("converting up to {} node map entries in {}", total, window);

        let mut entries = self.source.scan(collection, window, |doc| {
            let entry: NodeMapEntry = doc.parse()?;
            Ok((entry, doc.stamp))
        });

        let mut batch = Batch::new(self, collections::WORKSPACE_OBJECTS, total);
        let result = async {
            while let Some((entry, stamp)) = entries.try_next().await? {
                let record = node_map_to_s3_object(entry)?;
                let doc = Document::from_typed(record.chksum.clone(), stamp, &record).map_err(
                    |err| MigrateError::Conversion {
                        id: record.chksum.clone(),
                        reason: err.to_string(),
                    },
                )?;
                batch.push(doc).await?;
            }
            Ok::<(), MigrateError>(())
        }
        .await;

        batch.finish(result).await
    }
}

/// Pending upserts for one target collection.
struct Batch<'a> {
    migration: &'a RecordMigration,
    collection: &'static str,
    total: u64,
    docs: Vec<Document>,
    report: MigrationReport,
}

impl<'a> Batch<'a> {
    fn new(migration: &'a RecordMigration, collection: &'static str, total: u64) -> Self {
        Self {
            migration,
            collection,
            total,
            docs: Vec::with_capacity(migration.batch_size),
            report: MigrationReport::default(),
        }
    }

    async fn push(&mut self, doc: Document) -> MigrateResult<()> {
        self.docs.push(doc);
        self.report.converted += 1;
        if self.docs.len() >= self.migration.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> MigrateResult<()> {
        if self.docs.is_empty() {
            return Ok(());
        }
        let docs = std::mem::take(&mut self.docs);
        let summary = self
            .migration
            .target
            .bulk_upsert(self.collection, docs)
            .await?;
        info!(
            "{}: inserted {}, updated {}, write errors {}",
            self.collection, summary.inserted, summary.updated, summary.errors
        );
        self.report.writes += summary;
        info!("processed {}/{} records", self.report.converted, self.total);
        Ok(())
    }

    /// Write what is left, then surface the scan result.
    async fn finish(mut self, result: MigrateResult<()>) -> MigrateResult<MigrationReport> {
        let flushed = self.flush().await;
        result?;
        flushed?;
        Ok(self.report)
    }
}
