//! Per-identifier copy decisions between a source and a destination object
//! store.

use crate::{
    errors::{MigrateError, MigrateResult},
    keys::KeyLayout,
    services::{ledger::Ledger, transporter::LargeObjectTransporter},
    stores::ObjectStore,
};
use futures::{Stream, TryStreamExt, future};
use std::{
    collections::HashSet,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::{debug, error, info, warn};

/// Objects above this many bytes take the large-object path.
pub const DEFAULT_LARGE_OBJECT_THRESHOLD: u64 = 5_000_000_000;

#[derive(Clone, Copy, Debug)]
pub struct TransferSettings {
    pub source_layout: KeyLayout,
    pub dest_layout: KeyLayout,
    pub workers: usize,
    pub large_object_threshold: u64,
    /// Probe only; neither the destination nor the ledger is written.
    pub dry_run: bool,
}

impl TransferSettings {
    pub fn new(source_layout: KeyLayout, dest_layout: KeyLayout) -> Self {
        Self {
            source_layout,
            dest_layout,
            workers: 10,
            large_object_threshold: DEFAULT_LARGE_OBJECT_THRESHOLD,
            dry_run: false,
        }
    }
}

/// What happened to one identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    AlreadyDone,
    PresentAtDestination,
    MissingAtSource,
    Copied,
    CopiedLarge,
    Retry,
    WouldCopy,
    InvalidIdentifier,
}

#[derive(Debug, Default)]
pub struct TransferTally {
    examined: AtomicU64,
    already_done: AtomicU64,
    present: AtomicU64,
    missing_source: AtomicU64,
    copied: AtomicU64,
    copied_large: AtomicU64,
    retry: AtomicU64,
    would_copy: AtomicU64,
    invalid: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub examined: u64,
    pub already_done: u64,
    pub present: u64,
    pub missing_source: u64,
    pub copied: u64,
    pub copied_large: u64,
    pub retry: u64,
    pub would_copy: u64,
    pub invalid: u64,
}

impl TransferTally {
    pub fn record(&self, outcome: TransferOutcome) -> u64 {
        let bucket = match outcome {
            TransferOutcome::AlreadyDone => &self.already_done,
            TransferOutcome::PresentAtDestination => &self.present,
            TransferOutcome::MissingAtSource => &self.missing_source,
            TransferOutcome::Copied => &self.copied,
            TransferOutcome::CopiedLarge => &self.copied_large,
            TransferOutcome::Retry => &self.retry,
            TransferOutcome::WouldCopy => &self.would_copy,
            TransferOutcome::InvalidIdentifier => &self.invalid,
        };
        bucket.fetch_add(1, Ordering::Relaxed);
        self.examined.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn summary(&self) -> TransferSummary {
        TransferSummary {
            examined: self.examined.load(Ordering::Relaxed),
            already_done: self.already_done.load(Ordering::Relaxed),
            present: self.present.load(Ordering::Relaxed),
            missing_source: self.missing_source.load(Ordering::Relaxed),
            copied: self.copied.load(Ordering::Relaxed),
            copied_large: self.copied_large.load(Ordering::Relaxed),
            retry: self.retry.load(Ordering::Relaxed),
            would_copy: self.would_copy.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
        }
    }
}

impl TransferSummary {
    /// Destination writes performed.
    pub fn writes(&self) -> u64 {
        self.copied + self.copied_large
    }
}

impl fmt::Display for TransferSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "examined={} already_done={} present={} missing_source={} copied={} copied_large={} retry={} would_copy={} invalid={}",
            self.examined,
            self.already_done,
            self.present,
            self.missing_source,
            self.copied,
            self.copied_large,
            self.retry,
            self.would_copy,
            self.invalid
        )
    }
}

pub struct TransferEngine {
    source: Arc<dyn ObjectStore>,
    destination: Arc<dyn ObjectStore>,
    ledger: Arc<Ledger>,
    transporter: Arc<dyn LargeObjectTransporter>,
    settings: TransferSettings,
    tally: TransferTally,
}

impl TransferEngine {
    pub fn new(
        source: Arc<dyn ObjectStore>,
        destination: Arc<dyn ObjectStore>,
        ledger: Arc<Ledger>,
        transporter: Arc<dyn LargeObjectTransporter>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            source,
            destination,
            ledger,
            transporter,
            settings,
            tally: TransferTally::default(),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    pub fn summary(&self) -> TransferSummary {
        self.tally.summary()
    }

    async fn mark_done(&self, id: &str) -> MigrateResult<()> {
        if self.settings.dry_run {
            return Ok(());
        }
        self.ledger.mark_done(id).await
    }

    async fn mark_retry(&self, id: &str) -> MigrateResult<()> {
        if self.settings.dry_run {
            return Ok(());
        }
        self.ledger.mark_retry(id).await
    }

    /// Decide and perform the transfer of one identifier.
    ///
    /// Only "not found" and destination write failures are absorbed; any other
    /// store error is returned and ends the run.
    pub async fn transfer_one(&self, id: &str) -> MigrateResult<TransferOutcome> {
        if self.ledger.is_done(id).await {
            return Ok(TransferOutcome::AlreadyDone);
        }

        let keys = self
            .settings
            .source_layout
            .storage_key(id)
            .and_then(|src| Ok((src, self.settings.dest_layout.storage_key(id)?)));
        let (src_key, dest_key) = match keys {
            Ok(keys) => keys,
            Err(err) => {
                warn!("cannot map {} to a storage key: {}", id, err);
                return Ok(TransferOutcome::InvalidIdentifier);
            }
        };
        if !Ledger::accepts(id) {
            warn!("identifier {:?} cannot be recorded in the ledger", id);
            return Ok(TransferOutcome::InvalidIdentifier);
        }

        if self.destination.head(&dest_key).await?.is_some() {
            debug!("{} already at destination", dest_key);
            self.mark_done(id).await?;
            return Ok(TransferOutcome::PresentAtDestination);
        }

        let Some(stat) = self.source.head(&src_key).await? else {
            warn!("{} missing from source {}", src_key, self.source.backend_name());
            self.mark_done(id).await?;
            return Ok(TransferOutcome::MissingAtSource);
        };

        if self.settings.dry_run {
            info!("would copy {} ({} bytes) to {}", src_key, stat.size, dest_key);
            return Ok(TransferOutcome::WouldCopy);
        }

        if stat.size > self.settings.large_object_threshold {
            info!(
                "{} is {} bytes, using {} transport",
                src_key,
                stat.size,
                self.transporter.name()
            );
            let copied = self
                .transporter
                .transfer(
                    self.source.as_ref(),
                    &src_key,
                    self.destination.as_ref(),
                    &dest_key,
                    &stat,
                )
                .await;
            return match copied {
                Ok(()) => {
                    self.mark_done(id).await?;
                    Ok(TransferOutcome::CopiedLarge)
                }
                Err(err) => self.queue_retry(id, &err).await,
            };
        }

        let Some((stat, body)) = self.source.get(&src_key).await? else {
            warn!("{} vanished from source before it could be read", src_key);
            self.mark_done(id).await?;
            return Ok(TransferOutcome::MissingAtSource);
        };

        match self.destination.put(&dest_key, &stat.metadata, body).await {
            Ok(written) => {
                debug!("copied {} to {} ({} bytes)", src_key, dest_key, written.size);
                self.mark_done(id).await?;
                Ok(TransferOutcome::Copied)
            }
            Err(err) => {
                self.queue_retry(id, &MigrateError::copy_failed(&dest_key, err))
                    .await
            }
        }
    }

    async fn queue_retry(&self, id: &str, err: &MigrateError) -> MigrateResult<TransferOutcome> {
        error!("{}; queued for retry", err);
        self.mark_retry(id).await?;
        Ok(TransferOutcome::Retry)
    }

    /// Process every candidate once, `workers` at a time.
    ///
    /// Candidates are deduplicated as they are pulled off the stream, so an id
    /// both in the window and in the retry queue is handled once.
    pub async fn run<S>(&self, candidates: S) -> MigrateResult<TransferSummary>
    where
        S: Stream<Item = MigrateResult<String>> + Send,
    {
        let mut seen = HashSet::new();
        let workers = self.settings.workers.max(1);
        let engine = self;

        candidates
            .try_filter(move |id| future::ready(seen.insert(id.clone())))
            .try_for_each_concurrent(workers, move |id| async move {
                let outcome = engine.transfer_one(&id).await?;
                let examined = engine.tally.record(outcome);
                if examined % 1000 == 0 {
                    info!("examined {} identifiers", examined);
                }
                Ok(())
            })
            .await?;

        Ok(self.summary())
    }
}
