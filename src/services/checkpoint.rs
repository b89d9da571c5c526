//! Persisted time boundary of the last completed pass.

use crate::errors::{MigrateError, MigrateResult};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt};
use tracing::info;

/// Single-line file holding the boundary as RFC 3339.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Checkpoint kept in `state_dir`.
    pub fn in_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join("checkpoint"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last saved boundary; `None` before the first completed pass.
    pub async fn load(&self) -> MigrateResult<Option<DateTime<Utc>>> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(MigrateError::state(&self.path, err)),
        };
        let value = raw.trim();
        if value.is_empty() {
            return Ok(None);
        }
        parse_boundary(value)
            .map(Some)
            .ok_or_else(|| MigrateError::Checkpoint {
                path: self.path.clone(),
                value: value.to_string(),
            })
    }

    /// Replace the boundary atomically: write a temp file, sync it, rename.
    pub async fn save(&self, boundary: DateTime<Utc>) -> MigrateResult<()> {
        let tmp_path = self.path.with_extension("tmp");
        let write = async {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).await?;
                }
            }
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(format!("{}\n", boundary.to_rfc3339()).as_bytes())
                .await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &self.path).await
        };
        write
            .await
            .map_err(|err| MigrateError::state(&self.path, err))?;
        info!("checkpoint advanced to {}", boundary.to_rfc3339());
        Ok(())
    }
}

/// RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS[.f]` read as UTC.
fn parse_boundary(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
