//! Integrity Verifier
//!
//! Post-write verification: after a block of rows is appended, read it
//! back and prove the store received what was sent. The store reformats
//! values on the way in (dates become serial dates, numbers lose their
//! string form), so cells are normalized to a canonical text form per
//! declared column type before checksumming. A verified mismatch is
//! reported, never silently retried, because the rows are already on the
//! server.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::{RangeSpec, RemoteStore, Row};

/// Declared type of a data column, driving cell normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// Canonical form `DD/MM/YYYY`
    Date,
    /// Canonical form `HH:MM:SS`
    Time,
    /// Parsed as a float and re-rendered, so `07.50` equals `7.5`
    Number,
    /// Trimmed verbatim
    Text,
}

const DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y", "%d/%m/%y"];
const TIME_FORMATS: &[&str] = &["%H:%M:%S", "%H:%M"];

/// Normalize one cell to its canonical comparison form. Values that
/// don't parse as their declared type fall back to trimmed text.
pub fn normalize_cell(value: &str, column_type: ColumnType) -> String {
    let trimmed = value.trim();
    match column_type {
        ColumnType::Date => DATE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
            .map(|d| d.format("%d/%m/%Y").to_string())
            .unwrap_or_else(|| trimmed.to_string()),
        ColumnType::Time => TIME_FORMATS
            .iter()
            .find_map(|fmt| NaiveTime::parse_from_str(trimmed, fmt).ok())
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| trimmed.to_string()),
        ColumnType::Number => trimmed
            .replace(',', ".")
            .parse::<f64>()
            .map(|n| n.to_string())
            .unwrap_or_else(|_| trimmed.to_string()),
        ColumnType::Text => trimmed.to_string(),
    }
}

/// CRC32 over the normalized cells of a row, joined with `|`.
pub fn row_checksum(row: &[String], column_types: &[ColumnType]) -> u32 {
    let normalized: Vec<String> = row
        .iter()
        .enumerate()
        .map(|(i, cell)| {
            let ty = column_types.get(i).copied().unwrap_or(ColumnType::Text);
            normalize_cell(cell, ty)
        })
        .collect();
    crc32fast::hash(normalized.join("|").as_bytes())
}

/// Row-level verification counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyDetails {
    pub total_rows: usize,
    pub verified_rows: usize,
    pub failed_rows: usize,
    pub checksum_mismatches: usize,
    pub column_mismatches: usize,
}

/// Outcome of verifying one appended block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub success: bool,
    pub details: VerifyDetails,
    /// Human-readable description per failed row
    pub errors: Vec<String>,
}

/// Read-back verifier for appended blocks
pub struct IntegrityVerifier {
    store: Arc<dyn RemoteStore>,
    column_types: Vec<ColumnType>,
}

impl IntegrityVerifier {
    pub fn new(store: Arc<dyn RemoteStore>, column_types: Vec<ColumnType>) -> Self {
        Self {
            store,
            column_types,
        }
    }

    /// Re-read the block starting at 1-based `start_row` and compare it
    /// cell-by-cell and checksum-by-checksum against what was sent.
    pub async fn verify(
        &self,
        sheet: &str,
        original_rows: &[Row],
        start_row: u64,
    ) -> Result<VerifyReport> {
        let range = RangeSpec::rows(sheet, start_row, original_rows.len());
        let remote_rows = self.store.read_range(&range).await?;

        let mut details = VerifyDetails {
            total_rows: original_rows.len(),
            ..Default::default()
        };
        let mut errors = Vec::new();

        if remote_rows.len() != original_rows.len() {
            warn!(
                range = %range,
                expected = original_rows.len(),
                found = remote_rows.len(),
                "row count mismatch on read-back"
            );
            details.failed_rows = original_rows.len();
            return Ok(VerifyReport {
                success: false,
                details,
                errors: vec![format!(
                    "row count mismatch in {}: sent {}, read back {}",
                    range,
                    original_rows.len(),
                    remote_rows.len()
                )],
            });
        }

        for (offset, (sent, received)) in original_rows.iter().zip(&remote_rows).enumerate() {
            let row_number = start_row + offset as u64;
            let mut row_ok = true;

            for (col, sent_cell) in sent.iter().enumerate() {
                let ty = self.column_types.get(col).copied().unwrap_or(ColumnType::Text);
                let sent_norm = normalize_cell(sent_cell, ty);
                let received_norm =
                    normalize_cell(received.get(col).map_or("", |s| s.as_str()), ty);
                if sent_norm != received_norm {
                    details.column_mismatches += 1;
                    errors.push(format!(
                        "row {} column {}: sent '{}', read back '{}'",
                        row_number, col, sent_norm, received_norm
                    ));
                    row_ok = false;
                }
            }

            if row_checksum(sent, &self.column_types) != row_checksum(received, &self.column_types)
            {
                details.checksum_mismatches += 1;
                row_ok = false;
            }

            if row_ok {
                details.verified_rows += 1;
            } else {
                details.failed_rows += 1;
            }
        }

        let success = details.failed_rows == 0;
        if success {
            debug!(range = %range, rows = details.verified_rows, "block verified");
        } else {
            warn!(range = %range, failed = details.failed_rows, "block failed verification");
        }

        Ok(VerifyReport {
            success,
            details,
            errors,
        })
    }

    /// Checksum-only read-back of the block starting at 1-based
    /// `start_row`. Cheaper than `verify` when per-cell detail is not
    /// needed, but still proves the comparison against what the store
    /// holds now, not against a stale local copy.
    pub async fn verify_checksums(
        &self,
        sheet: &str,
        original_rows: &[Row],
        start_row: u64,
    ) -> Result<bool> {
        let range = RangeSpec::rows(sheet, start_row, original_rows.len());
        let remote_rows = self.store.read_range(&range).await?;

        Ok(remote_rows.len() == original_rows.len()
            && original_rows.iter().zip(&remote_rows).all(|(a, b)| {
                row_checksum(a, &self.column_types) == row_checksum(b, &self.column_types)
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_normalize_dates_and_times() {
        assert_eq!(normalize_cell("2026-02-01", ColumnType::Date), "01/02/2026");
        assert_eq!(normalize_cell("01/02/2026", ColumnType::Date), "01/02/2026");
        assert_eq!(normalize_cell("not a date", ColumnType::Date), "not a date");

        assert_eq!(normalize_cell("8:15", ColumnType::Time), "08:15:00");
        assert_eq!(normalize_cell("08:15:00", ColumnType::Time), "08:15:00");
    }

    #[test]
    fn test_normalize_numbers() {
        assert_eq!(normalize_cell("07.50", ColumnType::Number), "7.5");
        assert_eq!(normalize_cell("7,5", ColumnType::Number), "7.5");
        assert_eq!(normalize_cell("42", ColumnType::Number), "42");
        assert_eq!(normalize_cell(" n/a ", ColumnType::Number), "n/a");
    }

    #[test]
    fn test_checksum_ignores_formatting_noise() {
        let types = vec![ColumnType::Date, ColumnType::Number, ColumnType::Text];
        let sent = row(&["2026-02-01", "07.50", "BOX-1 "]);
        let received = row(&["01/02/2026", "7.5", "BOX-1"]);
        assert_eq!(row_checksum(&sent, &types), row_checksum(&received, &types));

        let tampered = row(&["01/02/2026", "7.5", "BOX-2"]);
        assert_ne!(
            row_checksum(&sent, &types),
            row_checksum(&tampered, &types)
        );
    }

    #[tokio::test]
    async fn test_verify_accepts_reformatted_block() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed(
                "BD",
                vec![
                    row(&["header"]),
                    row(&["01/02/2026", "7.5", "BOX-1"]),
                    row(&["02/02/2026", "3", "BOX-2"]),
                ],
            )
            .await;

        let verifier = IntegrityVerifier::new(
            store,
            vec![ColumnType::Date, ColumnType::Number, ColumnType::Text],
        );
        let sent = vec![
            row(&["2026-02-01", "07.50", "BOX-1"]),
            row(&["2026-02-02", "3.0", "BOX-2"]),
        ];

        let report = verifier.verify("BD", &sent, 2).await.unwrap();
        assert!(report.success, "errors: {:?}", report.errors);
        assert_eq!(report.details.verified_rows, 2);
    }

    #[tokio::test]
    async fn test_verify_flags_corrupted_cell() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed("BD", vec![row(&["01/02/2026", "7.5", "WRONG"])])
            .await;

        let verifier = IntegrityVerifier::new(
            store,
            vec![ColumnType::Date, ColumnType::Number, ColumnType::Text],
        );
        let sent = vec![row(&["01/02/2026", "7.5", "BOX-1"])];

        let report = verifier.verify("BD", &sent, 1).await.unwrap();
        assert!(!report.success);
        assert_eq!(report.details.failed_rows, 1);
        assert_eq!(report.details.column_mismatches, 1);
        assert_eq!(report.details.checksum_mismatches, 1);
        assert!(report.errors[0].contains("BOX-1"));
    }

    #[tokio::test]
    async fn test_verify_checksums_reads_back_from_store() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed("BD", vec![row(&["01/02/2026", "7.5", "BOX-1"])])
            .await;

        let verifier = IntegrityVerifier::new(
            store.clone(),
            vec![ColumnType::Date, ColumnType::Number, ColumnType::Text],
        );
        let sent = vec![row(&["2026-02-01", "07.50", "BOX-1"])];

        // Reformatting on the way in still checksums equal
        assert!(verifier.verify_checksums("BD", &sent, 1).await.unwrap());

        // Tamper with the stored row; the stale local copy must not mask it
        store
            .seed("BD", vec![row(&["01/02/2026", "7.5", "BOX-9"])])
            .await;
        assert!(!verifier.verify_checksums("BD", &sent, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_fails_on_row_count_mismatch() {
        let store = Arc::new(MemoryStore::new());
        store.seed("BD", vec![row(&["only-one"])]).await;

        let verifier = IntegrityVerifier::new(store, vec![ColumnType::Text]);
        let sent = vec![row(&["only-one"]), row(&["missing"])];

        let report = verifier.verify("BD", &sent, 1).await.unwrap();
        assert!(!report.success);
        assert_eq!(report.details.failed_rows, 2);
        assert!(report.errors[0].contains("row count mismatch"));
    }
}
