//! Read-only audit of records against an object store.
//!
//! Every record is classified into exactly one outcome. The verifier never
//! writes to a store, the ledger or the checkpoint.

use crate::{
    errors::MigrateResult,
    models::{
        object::ObjectStat,
        record::{MigrationRecord, Mode},
    },
    stores::{DocumentStore, ObjectStore},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use futures::{Stream, TryStreamExt};
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::{debug, info, warn};

const PROGRESS_INTERVAL: u64 = 1000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    /// The target record store has no counterpart of the record.
    MissingRecord,
    /// The object store has nothing at the mapped key.
    MissingObject,
    /// The object exists but the record declares no checksum to compare.
    NoChecksum,
    ChecksumMismatch {
        expected: String,
        actual: String,
        likely_multipart: bool,
    },
    /// The identifier cannot be mapped to a key.
    InvalidIdentifier,
}

/// Strip quote delimiters and lowercase; a base64 16-byte digest becomes hex.
pub fn normalize_tag(tag: &str) -> String {
    let trimmed = tag.trim().trim_matches('"');
    if trimmed.len() == 24 && trimmed.ends_with("==") {
        if let Ok(bytes) = STANDARD.decode(trimmed) {
            if bytes.len() == 16 {
                return bytes.iter().map(|b| format!("{:02x}", b)).collect();
            }
        }
    }
    trimmed.to_ascii_lowercase()
}

/// `<hex>-<parts>`, the composite tag of a multipart upload.
pub fn is_multipart_tag(tag: &str) -> bool {
    match normalize_tag(tag).split_once('-') {
        Some((digest, parts)) => {
            !digest.is_empty()
                && digest.bytes().all(|b| b.is_ascii_hexdigit())
                && !parts.is_empty()
                && parts.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Compare a declared checksum with what the object store reports.
pub fn classify(declared: Option<&str>, stat: Option<&ObjectStat>) -> VerifyOutcome {
    let Some(stat) = stat else {
        return VerifyOutcome::MissingObject;
    };
    let Some(declared) = declared else {
        return VerifyOutcome::NoChecksum;
    };
    if normalize_tag(declared) == normalize_tag(&stat.etag) {
        return VerifyOutcome::Verified;
    }
    VerifyOutcome::ChecksumMismatch {
        expected: declared.to_string(),
        actual: stat.etag.clone(),
        likely_multipart: is_multipart_tag(&stat.etag),
    }
}

#[derive(Debug, Default)]
pub struct VerifyTally {
    processed: AtomicU64,
    verified: AtomicU64,
    missing_record: AtomicU64,
    missing_object: AtomicU64,
    no_checksum: AtomicU64,
    mismatched: AtomicU64,
    likely_multipart: AtomicU64,
    invalid: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VerifySummary {
    pub processed: u64,
    pub verified: u64,
    pub missing_record: u64,
    pub missing_object: u64,
    pub no_checksum: u64,
    pub mismatched: u64,
    /// Subset of `mismatched` whose tag is a multipart composite.
    pub likely_multipart: u64,
    pub invalid: u64,
}

impl VerifyTally {
    pub fn record(&self, outcome: &VerifyOutcome) -> u64 {
        match outcome {
            VerifyOutcome::Verified => self.verified.fetch_add(1, Ordering::Relaxed),
            VerifyOutcome::MissingRecord => self.missing_record.fetch_add(1, Ordering::Relaxed),
            VerifyOutcome::MissingObject => self.missing_object.fetch_add(1, Ordering::Relaxed),
            VerifyOutcome::NoChecksum => self.no_checksum.fetch_add(1, Ordering::Relaxed),
            VerifyOutcome::ChecksumMismatch {
                likely_multipart, ..
            } => {
                if *likely_multipart {
                    self.likely_multipart.fetch_add(1, Ordering::Relaxed);
                }
                self.mismatched.fetch_add(1, Ordering::Relaxed)
            }
            VerifyOutcome::InvalidIdentifier => self.invalid.fetch_add(1, Ordering::Relaxed),
        };
        self.processed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn summary(&self) -> VerifySummary {
        VerifySummary {
            processed: self.processed.load(Ordering::Relaxed),
            verified: self.verified.load(Ordering::Relaxed),
            missing_record: self.missing_record.load(Ordering::Relaxed),
            missing_object: self.missing_object.load(Ordering::Relaxed),
            no_checksum: self.no_checksum.load(Ordering::Relaxed),
            mismatched: self.mismatched.load(Ordering::Relaxed),
            likely_multipart: self.likely_multipart.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
        }
    }
}

impl VerifySummary {
    /// Whether anything other than verified or checksum-less objects was found.
    pub fn has_problems(&self) -> bool {
        self.missing_record + self.missing_object + self.mismatched + self.invalid > 0
    }
}

impl fmt::Display for VerifySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} verified={} missing_record={} missing_object={} no_checksum={} mismatched={} (likely_multipart={}) invalid={}",
            self.processed,
            self.verified,
            self.missing_record,
            self.missing_object,
            self.no_checksum,
            self.mismatched,
            self.likely_multipart,
            self.invalid
        )
    }
}

pub struct Verifier {
    mode: Mode,
    objects: Arc<dyn ObjectStore>,
    target_records: Option<Arc<dyn DocumentStore>>,
    workers: usize,
    tally: VerifyTally,
}

impl Verifier {
    pub fn new(mode: Mode, objects: Arc<dyn ObjectStore>, workers: usize) -> Self {
        Self {
            mode,
            objects,
            target_records: None,
            workers: workers.max(1),
            tally: VerifyTally::default(),
        }
    }

    /// Also require a counterpart of every record in `store`.
    pub fn with_target_records(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.target_records = Some(store);
        self
    }

    pub fn summary(&self) -> VerifySummary {
        self.tally.summary()
    }

    /// Key of the counterpart record; workspace records are keyed by checksum.
    fn counterpart_id<'r>(&self, record: &'r MigrationRecord) -> Option<&'r str> {
        match self.mode {
            Mode::Workspace => record.checksum.as_deref(),
            Mode::Blobstore | Mode::Shock => Some(record.id.as_str()),
        }
    }

    pub async fn verify_one(&self, record: &MigrationRecord) -> MigrateResult<VerifyOutcome> {
        let key = match self.mode.destination_layout().storage_key(&record.id) {
            Ok(key) => key,
            Err(err) => {
                warn!("cannot map {} to a storage key: {}", record.id, err);
                return Ok(VerifyOutcome::InvalidIdentifier);
            }
        };

        if let Some(target) = &self.target_records {
            let found = match self.counterpart_id(record) {
                Some(id) => target
                    .find_one(self.mode.target_collection(), id)
                    .await?
                    .is_some(),
                None => false,
            };
            if !found {
                warn!("{} has no record in {}", record.id, self.mode.target_collection());
                return Ok(VerifyOutcome::MissingRecord);
            }
        }

        let stat = self.objects.head(&key).await?;
        let outcome = classify(record.checksum.as_deref(), stat.as_ref());
        match &outcome {
            VerifyOutcome::Verified => debug!("{} verified", key),
            VerifyOutcome::MissingObject => {
                warn!("{} missing from {}", key, self.objects.backend_name())
            }
            VerifyOutcome::NoChecksum => debug!("{} present, record has no checksum", key),
            VerifyOutcome::ChecksumMismatch {
                expected,
                actual,
                likely_multipart,
            } => warn!(
                "{} checksum mismatch: record {} object {}{}",
                key,
                expected,
                actual,
                if *likely_multipart { " (likely multipart)" } else { "" }
            ),
            VerifyOutcome::MissingRecord | VerifyOutcome::InvalidIdentifier => {}
        }
        Ok(outcome)
    }

    /// Classify every record, `workers` at a time.
    pub async fn run<S>(&self, records: S) -> MigrateResult<VerifySummary>
    where
        S: Stream<Item = MigrateResult<MigrationRecord>> + Send,
    {
        let verifier = self;
        records
            .try_for_each_concurrent(self.workers, move |record| async move {
                let outcome = verifier.verify_one(&record).await?;
                let processed = verifier.tally.record(&outcome);
                if processed % PROGRESS_INTERVAL == 0 {
                    info!("verified {} records so far", processed);
                }
                Ok(())
            })
            .await?;
        Ok(self.summary())
    }
}
