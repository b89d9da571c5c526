//! Half-open time interval used to bound record scans.

use crate::errors::{MigrateError, MigrateResult};
use chrono::{DateTime, Utc};
use std::fmt;

/// A `[start, end)` interval over the record store's monotonic stamp field.
///
/// Successive runs may overlap; the ledger makes reprocessing harmless.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TransferWindow {
    /// Build a window, rejecting `start > end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> MigrateResult<Self> {
        if start > end {
            return Err(MigrateError::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    /// Window covering every representable timestamp.
    pub fn unbounded() -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, stamp: DateTime<Utc>) -> bool {
        stamp >= self.start && stamp < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for TransferWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rejects_inverted_bounds() {
        let early = Utc.with_ymd_and_hms(2020, 8, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2020, 10, 1, 0, 0, 0).unwrap();
        assert!(TransferWindow::new(late, early).is_err());
        assert!(TransferWindow::new(early, early).unwrap().is_empty());
    }

    #[test]
    fn end_is_exclusive() {
        let start = Utc.with_ymd_and_hms(2020, 8, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2020, 8, 2, 0, 0, 0).unwrap();
        let window = TransferWindow::new(start, end).unwrap();
        assert!(window.contains(start));
        assert!(!window.contains(end));
    }
}
