//! One incremental pass: resolve the window, feed window records plus the
//! retry queue through the transfer engine, then advance the checkpoint.

use crate::{
    errors::MigrateResult,
    models::{record::Mode, window::TransferWindow},
    services::{
        checkpoint::CheckpointStore,
        record_source::{RecordFilter, RecordSource, ScanSummary},
        transfer::{TransferEngine, TransferSummary},
    },
};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use std::fmt;
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct SyncOptions {
    pub mode: Mode,
    /// Overrides the checkpoint.
    pub start: Option<DateTime<Utc>>,
    /// Defaults to the time the pass starts.
    pub end: Option<DateTime<Utc>>,
    pub reset_ledger: bool,
    pub filter: RecordFilter,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncReport {
    pub window: TransferWindow,
    pub scan: ScanSummary,
    pub transfer: TransferSummary,
    pub retried: usize,
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "window={} {} retried={} {}",
            self.window, self.scan, self.retried, self.transfer
        )
    }
}

/// Window of the next pass: `[start or checkpoint or now, end or now)`.
pub async fn resolve_window(
    checkpoint: &CheckpointStore,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> MigrateResult<TransferWindow> {
    let start = match start {
        Some(start) => start,
        None => match checkpoint.load().await? {
            Some(boundary) => boundary,
            None => {
                warn!(
                    "no checkpoint at {}, starting from now",
                    checkpoint.path().display()
                );
                now
            }
        },
    };
    TransferWindow::new(start, end.unwrap_or(now))
}

/// Run one pass. The checkpoint moves to the window end only when every
/// candidate was handled; an error leaves it where it was.
pub async fn run_sync(
    records: &RecordSource,
    engine: &TransferEngine,
    checkpoint: &CheckpointStore,
    options: SyncOptions,
    now: DateTime<Utc>,
) -> MigrateResult<SyncReport> {
    let ledger = engine.ledger();
    let dry_run = engine.settings().dry_run;

    if options.reset_ledger && !dry_run {
        ledger.reset().await?;
    }

    let window = resolve_window(checkpoint, options.start, options.end, now).await?;
    let retries = ledger.pending_retries().await;
    info!(
        "{} pass over {} with {} queued retries{}",
        options.mode,
        window,
        retries.len(),
        if dry_run { " (dry run)" } else { "" }
    );

    let retried = retries.len();
    let candidates = records
        .records(options.mode, window, options.filter)
        .map_ok(|record| record.id)
        .chain(stream::iter(retries.into_iter().map(Ok)));

    let transfer = engine.run(candidates).await?;

    if !dry_run {
        ledger.compact().await?;
        checkpoint.save(window.end()).await?;
    }

    let report = SyncReport {
        window,
        scan: records.stats(),
        transfer,
        retried,
    };
    info!("pass complete: {}", report);
    Ok(report)
}
