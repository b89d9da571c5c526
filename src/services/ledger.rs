//! Idempotence ledger: which identifiers are done and which await a retry.
//!
//! State is two append-only line files in the state directory, `done.log`
//! and `retry.log`. Every mark is appended and synced before it returns, so a
//! crash loses at most the mark in flight; a torn trailing line left by such a
//! crash is cut off on load, before anything else is appended.

use crate::errors::{MigrateError, MigrateResult};
use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::{debug, info, warn};

const DONE_FILE: &str = "done.log";
const RETRY_FILE: &str = "retry.log";

struct LedgerState {
    done: HashSet<String>,
    retry: HashSet<String>,
    done_log: File,
    retry_log: File,
}

/// Counts of ledger entries, for reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LedgerCounts {
    pub done: usize,
    pub pending_retry: usize,
}

/// Per-identifier completion state shared by every transfer worker.
pub struct Ledger {
    dir: PathBuf,
    state: Mutex<LedgerState>,
}

impl Ledger {
    /// Open (creating when missing) the ledger in `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> MigrateResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| MigrateError::state(&dir, err))?;

        let done_path = dir.join(DONE_FILE);
        let retry_path = dir.join(RETRY_FILE);
        let done = read_entries(&done_path).await?;
        let retry = read_entries(&retry_path).await?;
        info!(
            "ledger at {} holds {} done, {} retry entries",
            dir.display(),
            done.len(),
            retry.len()
        );

        let state = LedgerState {
            done,
            retry,
            done_log: open_append(&done_path).await?,
            retry_log: open_append(&retry_path).await?,
        };
        Ok(Self {
            dir,
            state: Mutex::new(state),
        })
    }

    /// Whether `id` can be stored as one ledger line and read back unchanged.
    pub fn accepts(id: &str) -> bool {
        !id.is_empty() && !id.contains(['\n', '\r']) && id.trim() == id
    }

    pub async fn is_done(&self, id: &str) -> bool {
        self.state.lock().await.done.contains(id)
    }

    /// Record `id` as done. Idempotent.
    pub async fn mark_done(&self, id: &str) -> MigrateResult<()> {
        check_identifier(id)?;
        let mut state = self.state.lock().await;
        if state.done.contains(id) {
            return Ok(());
        }
        append_line(&mut state.done_log, &self.dir.join(DONE_FILE), id).await?;
        state.done.insert(id.to_string());
        debug!("ledger: {} done", id);
        Ok(())
    }

    /// Queue `id` for the next run. A no-op once `id` is done.
    pub async fn mark_retry(&self, id: &str) -> MigrateResult<()> {
        check_identifier(id)?;
        let mut state = self.state.lock().await;
        if state.done.contains(id) || state.retry.contains(id) {
            return Ok(());
        }
        append_line(&mut state.retry_log, &self.dir.join(RETRY_FILE), id).await?;
        state.retry.insert(id.to_string());
        debug!("ledger: {} pending retry", id);
        Ok(())
    }

    /// Identifiers queued for retry and not yet done, sorted.
    pub async fn pending_retries(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut pending: Vec<String> = state
            .retry
            .iter()
            .filter(|id| !state.done.contains(*id))
            .cloned()
            .collect();
        pending.sort();
        pending
    }

    pub async fn counts(&self) -> LedgerCounts {
        let state = self.state.lock().await;
        LedgerCounts {
            done: state.done.len(),
            pending_retry: state
                .retry
                .iter()
                .filter(|id| !state.done.contains(*id))
                .count(),
        }
    }

    /// Forget every done entry so the next pass re-examines all identifiers.
    pub async fn reset(&self) -> MigrateResult<()> {
        let path = self.dir.join(DONE_FILE);
        let mut state = self.state.lock().await;
        let log = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|err| MigrateError::state(&path, err))?;
        log.sync_all()
            .await
            .map_err(|err| MigrateError::state(&path, err))?;
        state.done_log = open_append(&path).await?;
        let cleared = state.done.len();
        state.done.clear();
        info!("ledger reset, {} done entries cleared", cleared);
        Ok(())
    }

    /// Rewrite the retry log so it holds only identifiers still pending.
    pub async fn compact(&self) -> MigrateResult<()> {
        let path = self.dir.join(RETRY_FILE);
        let tmp_path = path.with_extension("tmp");
        let mut state = self.state.lock().await;

        let mut pending: Vec<String> = state
            .retry
            .iter()
            .filter(|id| !state.done.contains(*id))
            .cloned()
            .collect();
        pending.sort();

        let mut contents = String::new();
        for id in &pending {
            contents.push_str(id);
            contents.push('\n');
        }

        let write = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(contents.as_bytes()).await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &path).await
        };
        write.await.map_err(|err| MigrateError::state(&path, err))?;

        state.retry_log = open_append(&path).await?;
        let dropped = state.retry.len() - pending.len();
        state.retry = pending.into_iter().collect();
        if dropped > 0 {
            info!("retry log compacted, {} resolved entries dropped", dropped);
        }
        Ok(())
    }
}

fn check_identifier(id: &str) -> MigrateResult<()> {
    if !Ledger::accepts(id) {
        return Err(MigrateError::LedgerIdentifier(id.to_string()));
    }
    Ok(())
}

async fn read_entries(path: &Path) -> MigrateResult<HashSet<String>> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(err) => return Err(MigrateError::state(path, err)),
    };

    // Only newline-terminated lines were fully written.
    let complete = match raw.rfind('\n') {
        Some(end) => &raw[..=end],
        None => "",
    };
    if complete.len() < raw.len() {
        warn!("dropping torn trailing line in {}", path.display());
        truncate_to(path, complete.len() as u64).await?;
    }

    Ok(complete
        .lines()
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Cut `path` back to `len` bytes so the next append starts on a fresh line.
async fn truncate_to(path: &Path, len: u64) -> MigrateResult<()> {
    let cut = async {
        let file = OpenOptions::new().write(true).open(path).await?;
        file.set_len(len).await?;
        file.sync_all().await
    };
    cut.await.map_err(|err| MigrateError::state(path, err))
}

async fn open_append(path: &Path) -> MigrateResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|err| MigrateError::state(path, err))
}

async fn append_line(log: &mut File, path: &Path, id: &str) -> MigrateResult<()> {
    let line = format!("{}\n", id);
    let write = async {
        log.write_all(line.as_bytes()).await?;
        log.sync_data().await
    };
    write.await.map_err(|err| MigrateError::state(path, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn marks_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = Ledger::open(dir.path()).await.unwrap();
            ledger.mark_done("a").await.unwrap();
            ledger.mark_retry("b").await.unwrap();
        }
        let ledger = Ledger::open(dir.path()).await.unwrap();
        assert!(ledger.is_done("a").await);
        assert_eq!(ledger.pending_retries().await, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn done_is_never_reverted_to_retry() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path()).await.unwrap();
        ledger.mark_done("a").await.unwrap();
        ledger.mark_retry("a").await.unwrap();
        assert!(ledger.is_done("a").await);
        assert!(ledger.pending_retries().await.is_empty());
    }

    #[tokio::test]
    async fn retry_resolved_by_later_done() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path()).await.unwrap();
        ledger.mark_retry("a").await.unwrap();
        ledger.mark_done("a").await.unwrap();
        assert!(ledger.pending_retries().await.is_empty());

        ledger.compact().await.unwrap();
        let raw = std::fs::read_to_string(dir.path().join(RETRY_FILE)).unwrap();
        assert!(raw.is_empty());
    }

    #[tokio::test]
    async fn torn_trailing_line_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DONE_FILE), "a\nb\nhalf-writ").unwrap();
        let ledger = Ledger::open(dir.path()).await.unwrap();
        assert!(ledger.is_done("a").await);
        assert!(ledger.is_done("b").await);
        assert!(!ledger.is_done("half-writ").await);
        assert_eq!(ledger.counts().await.done, 2);
    }

    #[tokio::test]
    async fn marks_after_a_torn_line_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(RETRY_FILE), "old\nhalf").unwrap();
        {
            let ledger = Ledger::open(dir.path()).await.unwrap();
            ledger.mark_retry("fresh").await.unwrap();
        }
        let raw = std::fs::read_to_string(dir.path().join(RETRY_FILE)).unwrap();
        assert_eq!(raw, "old\nfresh\n");

        let ledger = Ledger::open(dir.path()).await.unwrap();
        assert_eq!(
            ledger.pending_retries().await,
            vec!["fresh".to_string(), "old".to_string()]
        );
    }

    #[tokio::test]
    async fn torn_line_without_any_newline_is_cut_entirely() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DONE_FILE), "hal").unwrap();
        {
            let ledger = Ledger::open(dir.path()).await.unwrap();
            ledger.mark_done("b").await.unwrap();
        }
        let ledger = Ledger::open(dir.path()).await.unwrap();
        assert!(ledger.is_done("b").await);
        assert!(!ledger.is_done("halb").await);
        assert_eq!(ledger.counts().await.done, 1);
    }

    #[tokio::test]
    async fn reset_clears_done_entries() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path()).await.unwrap();
        ledger.mark_done("a").await.unwrap();
        ledger.reset().await.unwrap();
        assert!(!ledger.is_done("a").await);

        let reopened = Ledger::open(dir.path()).await.unwrap();
        assert!(!reopened.is_done("a").await);
    }

    #[tokio::test]
    async fn identifiers_with_newlines_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path()).await.unwrap();
        assert!(matches!(
            ledger.mark_done("a\nb").await,
            Err(MigrateError::LedgerIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn identifiers_with_surrounding_whitespace_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path()).await.unwrap();
        for id in [" x", "x ", "\tx"] {
            assert!(matches!(
                ledger.mark_retry(id).await,
                Err(MigrateError::LedgerIdentifier(_))
            ));
        }
        assert!(ledger.pending_retries().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_marks_are_all_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = std::sync::Arc::new(Ledger::open(dir.path()).await.unwrap());
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.mark_done(&format!("id-{i}")).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let reopened = Ledger::open(dir.path()).await.unwrap();
        assert_eq!(reopened.counts().await.done, 32);
    }
}
