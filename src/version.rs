//! Optimistic Version Controller
//!
//! In-place row updates without remote transactions: every row carries a
//! version marker (the client-assigned write timestamp in milliseconds)
//! in a dedicated column, and an update only lands if the marker still
//! matches what the caller last read. A mismatch means someone else got
//! there first; the caller gets the winning row back and decides whether
//! to re-read and retry or surface the conflict.
//!
//! The marker is a timestamp from the writer's clock, so ordering between
//! stations is only as good as their clocks. That is an accepted limit of
//! the scheme, not something this module tries to paper over.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{RangeSpec, RemoteStore};

/// Checked row updates keyed on a version-marker column
pub struct VersionController {
    store: Arc<dyn RemoteStore>,
    /// Zero-based column holding the version marker
    version_column: usize,
}

impl VersionController {
    pub fn new(store: Arc<dyn RemoteStore>, version_column: usize) -> Self {
        Self {
            store,
            version_column,
        }
    }

    /// Read the current version marker of a row. A blank or unparseable
    /// marker reads as 0, so legacy rows written before versioning are
    /// updatable with `expected = 0`.
    pub async fn read_version(&self, sheet: &str, row: u64) -> Result<i64> {
        let range = RangeSpec::rows(sheet, row, 1);
        let rows = self.store.read_range(&range).await?;
        let remote = rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::RangeNotFound(range.to_string()))?;
        Ok(Self::marker_of(&remote, self.version_column))
    }

    /// Overwrite a row if its version marker still equals `expected`.
    ///
    /// On success the row is written with a fresh marker and the new
    /// version is returned. On a marker mismatch nothing is written and
    /// the error carries the winning row so the caller can merge or
    /// report.
    pub async fn checked_update(
        &self,
        sheet: &str,
        row: u64,
        expected: i64,
        mut fields: Vec<String>,
    ) -> Result<i64> {
        let range = RangeSpec::rows(sheet, row, 1);
        let rows = self.store.read_range(&range).await?;
        let remote = rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::RangeNotFound(range.to_string()))?;

        let actual = Self::marker_of(&remote, self.version_column);
        if actual != expected {
            warn!(
                range = %range,
                expected,
                actual,
                "version marker moved, refusing update"
            );
            return Err(Error::VersionConflict {
                range: range.to_string(),
                expected,
                actual,
                remote_row: remote,
            });
        }

        let new_version = Utc::now().timestamp_millis();
        if fields.len() <= self.version_column {
            fields.resize(self.version_column + 1, String::new());
        }
        fields[self.version_column] = new_version.to_string();

        self.store.update_range(&range, vec![fields]).await?;
        debug!(range = %range, version = new_version, "row updated");
        Ok(new_version)
    }

    fn marker_of(row: &[String], column: usize) -> i64 {
        row.get(column)
            .and_then(|cell| cell.trim().parse().ok())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn test_blank_marker_reads_zero() {
        let store = Arc::new(MemoryStore::new());
        store.seed("BD", vec![row(&["BOX-1", "ready", ""])]).await;

        let vc = VersionController::new(store, 2);
        assert_eq!(vc.read_version("BD", 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_checked_update_stamps_fresh_marker() {
        let store = Arc::new(MemoryStore::new());
        store.seed("BD", vec![row(&["BOX-1", "ready", "100"])]).await;

        let vc = VersionController::new(store.clone(), 2);
        let version = vc
            .checked_update("BD", 1, 100, row(&["BOX-1", "shipped", ""]))
            .await
            .unwrap();

        let sheet = store.sheet("BD").await;
        assert_eq!(sheet[0][1], "shipped");
        assert_eq!(sheet[0][2], version.to_string());
        assert!(version > 100);
    }

    #[tokio::test]
    async fn test_stale_expected_version_conflicts() {
        let store = Arc::new(MemoryStore::new());
        store.seed("BD", vec![row(&["BOX-1", "shipped", "200"])]).await;

        let vc = VersionController::new(store.clone(), 2);
        let err = vc
            .checked_update("BD", 1, 100, row(&["BOX-1", "ready", ""]))
            .await
            .unwrap_err();

        match err {
            Error::VersionConflict {
                expected,
                actual,
                remote_row,
                ..
            } => {
                assert_eq!(expected, 100);
                assert_eq!(actual, 200);
                assert_eq!(remote_row[1], "shipped");
            }
            other => panic!("expected VersionConflict, got {other}"),
        }

        // Losing write must not touch the row
        assert_eq!(store.sheet("BD").await[0][1], "shipped");
    }

    #[tokio::test]
    async fn test_missing_row_is_range_not_found() {
        let store = Arc::new(MemoryStore::new());
        let vc = VersionController::new(store, 2);
        let err = vc.checked_update("BD", 7, 0, row(&["x"])).await.unwrap_err();
        assert!(matches!(err, Error::RangeNotFound(_)));
    }
}
