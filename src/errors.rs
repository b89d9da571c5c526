//! Error taxonomy for migration and verification runs.
//!
//! Only "not found" and per-object copy failures are absorbed per identifier
//! (as ledger state or tally buckets); every variant here that reaches the top
//! of a run aborts it.

use crate::keys::KeyError;
use crate::stores::StoreError;
use chrono::{DateTime, Utc};
use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrateError {
    /// Invalid or inconsistent settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// Store failure other than "not found": connection loss, timeouts, I/O.
    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    /// Ledger or checkpoint persistence failure.
    #[error("state file `{}`: {source}", .path.display())]
    State {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checkpoint `{}` holds an unparseable boundary `{value}`", .path.display())]
    Checkpoint { path: PathBuf, value: String },

    #[error("identifier `{0}` cannot be recorded in the ledger")]
    LedgerIdentifier(String),

    #[error("window start {start} is after end {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error(transparent)]
    Key(#[from] KeyError),

    /// A record references a user with no resolvable name.
    #[error("record `{record_id}` references user `{user_id}` with no resolvable username")]
    UnresolvedUser { record_id: String, user_id: String },

    #[error("record `{id}` could not be converted: {reason}")]
    Conversion { id: String, reason: String },

    /// Large-object transfer failure; the identifier stays pending-retry.
    #[error("copy of `{key}` failed: {reason}")]
    CopyFailed { key: String, reason: String },
}

impl MigrateError {
    pub fn state(path: impl Into<PathBuf>, source: io::Error) -> Self {
        MigrateError::State {
            path: path.into(),
            source,
        }
    }

    pub fn copy_failed(key: impl Into<String>, reason: impl ToString) -> Self {
        MigrateError::CopyFailed {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error is a data-integrity violation rather than an
    /// infrastructure or configuration problem.
    pub fn is_data_integrity(&self) -> bool {
        matches!(
            self,
            MigrateError::UnresolvedUser { .. } | MigrateError::Conversion { .. }
        )
    }

    /// Process exit code for a run that ended with this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::InvalidWindow { .. } => 2,
            err if err.is_data_integrity() => 3,
            _ => 1,
        }
    }

    /// Format error with its full source chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);
        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }
        output
    }
}

pub type MigrateResult<T> = Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_separate_error_classes() {
        assert_eq!(MigrateError::Config("x".into()).exit_code(), 2);
        assert_eq!(
            MigrateError::UnresolvedUser {
                record_id: "n".into(),
                user_id: "u".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(
            MigrateError::Store(StoreError::Unavailable("down".into())).exit_code(),
            1
        );
    }

    #[test]
    fn detailed_format_includes_source_chain() {
        let err = MigrateError::state(
            "/tmp/done.log",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        let text = err.format_detailed();
        assert!(text.contains("done.log"));
        assert!(text.contains("Caused by"));
    }
}
