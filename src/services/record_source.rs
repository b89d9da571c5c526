//! Windowed, batched stream of candidate records.

use crate::{
    errors::MigrateResult,
    models::{
        document::Document,
        record::{MigrationRecord, Mode, collections},
        window::TransferWindow,
        workspace::NodeMapEntry,
    },
    services::transform::node_map_to_s3_object,
    stores::DocumentStore,
};
use futures::{StreamExt, TryStreamExt, future, stream::BoxStream};
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::warn;

/// Default number of documents fetched per round trip.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Excludes records owned by a reserved identity.
#[derive(Clone, Debug, Default)]
pub struct RecordFilter {
    excluded_owner: Option<String>,
}

impl RecordFilter {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn excluding_owner(owner: impl Into<String>) -> Self {
        Self {
            excluded_owner: Some(owner.into()),
        }
    }

    /// Only legacy nodes carry the reserved workspace owner.
    pub fn for_mode(mode: Mode, reserved_owner: Option<&str>) -> Self {
        match (mode, reserved_owner) {
            (Mode::Shock, Some(owner)) => Self::excluding_owner(owner),
            _ => Self::none(),
        }
    }

    pub fn admits_owner(&self, owner: Option<&str>) -> bool {
        match (&self.excluded_owner, owner) {
            (Some(excluded), Some(owner)) => excluded != owner,
            _ => true,
        }
    }
}

#[derive(Debug, Default)]
pub struct ScanStats {
    scanned: AtomicU64,
    skipped: AtomicU64,
    filtered: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub scanned: u64,
    pub skipped: u64,
    pub filtered: u64,
}

impl ScanStats {
    pub fn summary(&self) -> ScanSummary {
        ScanSummary {
            scanned: self.scanned.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for ScanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scanned={} skipped_malformed={} filtered={}",
            self.scanned, self.skipped, self.filtered
        )
    }
}

/// Reads candidates out of a document store.
///
/// Store failures end the stream with an error; malformed documents are
/// logged, counted and skipped.
pub struct RecordSource {
    store: Arc<dyn DocumentStore>,
    batch_size: usize,
    stats: ScanStats,
}

impl RecordSource {
    pub fn new(store: Arc<dyn DocumentStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            stats: ScanStats::default(),
        }
    }

    pub fn stats(&self) -> ScanSummary {
        self.stats.summary()
    }

    pub async fn count(&self, collection: &str, window: TransferWindow) -> MigrateResult<u64> {
        Ok(self.store.count(collection, window).await?)
    }

    /// Stream `collection` within `window`, projecting each document with `parse`.
    pub fn scan<'a, T, P>(
        &'a self,
        collection: &'a str,
        window: TransferWindow,
        parse: P,
    ) -> BoxStream<'a, MigrateResult<T>>
    where
        T: Send + 'a,
        P: Fn(&Document) -> serde_json::Result<T> + Send + 'a,
    {
        let stats = &self.stats;
        self.store
            .scan(collection, window, self.batch_size)
            .filter_map(move |item| {
                let next = match item {
                    Ok(doc) => {
                        stats.scanned.fetch_add(1, Ordering::Relaxed);
                        match parse(&doc) {
                            Ok(value) => Some(Ok(value)),
                            Err(err) => {
                                warn!(
                                    "skipping malformed {} document {}: {}",
                                    collection, doc.id, err
                                );
                                stats.skipped.fetch_add(1, Ordering::Relaxed);
                                None
                            }
                        }
                    }
                    Err(err) if err.is_record_level() => {
                        warn!("skipping unreadable document: {}", err);
                        stats.scanned.fetch_add(1, Ordering::Relaxed);
                        stats.skipped.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                    Err(err) => Some(Err(err.into())),
                };
                future::ready(next)
            })
            .boxed()
    }

    /// Candidate records of `mode` within `window` that pass `filter`.
    pub fn records<'a>(
        &'a self,
        mode: Mode,
        window: TransferWindow,
        filter: RecordFilter,
    ) -> BoxStream<'a, MigrateResult<MigrationRecord>> {
        let stats = &self.stats;
        self.scan(mode.record_collection(), window, move |doc| {
            mode.parse_record(doc)
        })
        .try_filter(move |record| {
            let admitted = filter.admits_owner(record.owner.as_deref());
            if !admitted {
                stats.filtered.fetch_add(1, Ordering::Relaxed);
            }
            future::ready(admitted)
        })
        .boxed()
    }

    /// Records a verification pass walks.
    ///
    /// When the target record store is checked in workspace mode, the legacy
    /// node map is the source of truth: each entry must have an object record
    /// (keyed by checksum) in the target and an object at its sharded key.
    pub fn verification_records<'a>(
        &'a self,
        mode: Mode,
        window: TransferWindow,
        filter: RecordFilter,
        check_records: bool,
    ) -> BoxStream<'a, MigrateResult<MigrationRecord>> {
        match mode {
            Mode::Workspace if check_records => self.node_map_records(window),
            _ => self.records(mode, window, filter),
        }
    }

    /// Node map entries projected onto the object record they migrate to.
    /// Entries whose node cannot be sharded are skipped.
    pub fn node_map_records<'a>(
        &'a self,
        window: TransferWindow,
    ) -> BoxStream<'a, MigrateResult<MigrationRecord>> {
        let stats = &self.stats;
        self.scan(collections::NODE_MAP, window, |doc| {
            let entry: NodeMapEntry = doc.parse()?;
            Ok((entry, doc.stamp))
        })
        .try_filter_map(move |(entry, stamp)| {
            let node = entry.node.clone();
            let record = match node_map_to_s3_object(entry) {
                Ok(object) => Some(MigrationRecord {
                    id: object.key,
                    created: stamp,
                    size: None,
                    checksum: Some(object.chksum),
                    owner: None,
                }),
                Err(err) => {
                    warn!("skipping node map entry for {}: {}", node, err);
                    stats.skipped.fetch_add(1, Ordering::Relaxed);
                    None
                }
            };
            future::ready(Ok(record))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_only_applies_to_legacy_nodes() {
        let filter = RecordFilter::for_mode(Mode::Shock, Some("ws"));
        assert!(!filter.admits_owner(Some("ws")));
        assert!(filter.admits_owner(Some("alice")));
        assert!(filter.admits_owner(None));

        let filter = RecordFilter::for_mode(Mode::Blobstore, Some("ws"));
        assert!(filter.admits_owner(Some("ws")));
    }
}
