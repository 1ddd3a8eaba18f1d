//! In-memory store adapter
//!
//! A faithful stand-in for the remote backend used by tests and local
//! simulation: sheets are row vectors, ranges address row spans, and
//! transient failures can be injected per primitive. Several engine
//! instances can share one `MemoryStore` behind an `Arc` to simulate
//! independent stations racing on the same backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{AppendAck, RangeSpec, RemoteStore, Row};
use crate::error::{Error, Result};

/// Rows addressed by a cell range
enum CellSelection {
    /// Whole sheet (open-ended column range like `A:Z`)
    All,
    /// 1-based inclusive row span
    Rows(u64, u64),
}

fn parse_cells(cells: &str) -> CellSelection {
    fn row_of(part: &str) -> Option<u64> {
        let digits: String = part.chars().filter(|c| c.is_ascii_digit()).collect();
        digits.parse().ok()
    }

    match cells.split_once(':') {
        Some((first, second)) => match (row_of(first), row_of(second)) {
            (Some(a), Some(b)) => CellSelection::Rows(a, b),
            _ => CellSelection::All,
        },
        None => match row_of(cells) {
            Some(row) => CellSelection::Rows(row, row),
            None => CellSelection::All,
        },
    }
}

/// In-memory remote store with transient-failure injection.
pub struct MemoryStore {
    sheets: Mutex<HashMap<String, Vec<Row>>>,
    fail_reads: AtomicUsize,
    fail_appends: AtomicUsize,
    fail_updates: AtomicUsize,
    corrupt_appends: AtomicUsize,
    append_delay_ms: AtomicU64,
    append_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            sheets: Mutex::new(HashMap::new()),
            fail_reads: AtomicUsize::new(0),
            fail_appends: AtomicUsize::new(0),
            fail_updates: AtomicUsize::new(0),
            corrupt_appends: AtomicUsize::new(0),
            append_delay_ms: AtomicU64::new(0),
            append_calls: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` reads fail with a transient network error.
    pub fn fail_next_reads(&self, n: usize) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` appends fail with a transient network error.
    pub fn fail_next_appends(&self, n: usize) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` range updates fail with a transient network error.
    pub fn fail_next_updates(&self, n: usize) {
        self.fail_updates.store(n, Ordering::SeqCst);
    }

    /// Mangle the first cell of every row in the next `n` appends,
    /// simulating a backend that reformats values on the way in.
    pub fn corrupt_next_appends(&self, n: usize) {
        self.corrupt_appends.store(n, Ordering::SeqCst);
    }

    /// Delay every append by `delay`, simulating a slow network.
    pub fn set_append_delay(&self, delay: Duration) {
        self.append_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Total append calls observed (for idempotency assertions).
    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    /// Seed a sheet with rows (replacing existing contents).
    pub async fn seed(&self, sheet: &str, rows: Vec<Row>) {
        self.sheets.lock().await.insert(sheet.to_string(), rows);
    }

    /// Current contents of a sheet.
    pub async fn sheet(&self, sheet: &str) -> Vec<Row> {
        self.sheets
            .lock()
            .await
            .get(sheet)
            .cloned()
            .unwrap_or_default()
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        let mut current = counter.load(Ordering::SeqCst);
        while current > 0 {
            match counter.compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    fn take_failure(counter: &AtomicUsize, what: &str) -> Result<()> {
        if Self::take_one(counter) {
            return Err(Error::Network(format!("injected {} failure", what)));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn read_range(&self, range: &RangeSpec) -> Result<Vec<Row>> {
        Self::take_failure(&self.fail_reads, "read")?;

        let sheets = self.sheets.lock().await;
        let rows = sheets.get(&range.sheet).cloned().unwrap_or_default();

        match parse_cells(&range.cells) {
            CellSelection::All => Ok(rows),
            CellSelection::Rows(start, end) => {
                let start_idx = start.saturating_sub(1) as usize;
                let end_idx = (end as usize).min(rows.len());
                if start_idx >= rows.len() {
                    return Ok(Vec::new());
                }
                Ok(rows[start_idx..end_idx].to_vec())
            }
        }
    }

    async fn append_rows(&self, range: &RangeSpec, rows: Vec<Row>) -> Result<AppendAck> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.append_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        Self::take_failure(&self.fail_appends, "append")?;

        let mut rows = rows;
        if Self::take_one(&self.corrupt_appends) {
            for row in rows.iter_mut() {
                if let Some(cell) = row.first_mut() {
                    cell.push('?');
                }
            }
        }

        let mut sheets = self.sheets.lock().await;
        let sheet = sheets.entry(range.sheet.clone()).or_default();

        let start_row = sheet.len() as u64 + 1;
        let count = rows.len();
        sheet.extend(rows);

        Ok(AppendAck {
            start_row,
            end_row: start_row + count.saturating_sub(1) as u64,
            updated_rows: count,
        })
    }

    async fn update_range(&self, range: &RangeSpec, rows: Vec<Row>) -> Result<()> {
        Self::take_failure(&self.fail_updates, "update")?;

        let mut sheets = self.sheets.lock().await;
        let sheet = sheets.entry(range.sheet.clone()).or_default();

        let start_idx = match parse_cells(&range.cells) {
            CellSelection::All => 0,
            CellSelection::Rows(start, _) => start.saturating_sub(1) as usize,
        };

        if sheet.len() < start_idx + rows.len() {
            sheet.resize(start_idx + rows.len(), Vec::new());
        }
        for (offset, row) in rows.into_iter().enumerate() {
            sheet[start_idx + offset] = row;
        }

        Ok(())
    }

    async fn clear_range(&self, range: &RangeSpec) -> Result<()> {
        let mut sheets = self.sheets.lock().await;
        let Some(sheet) = sheets.get_mut(&range.sheet) else {
            return Ok(());
        };

        match parse_cells(&range.cells) {
            CellSelection::All => sheet.clear(),
            CellSelection::Rows(start, end) => {
                let start_idx = start.saturating_sub(1) as usize;
                let end_idx = (end as usize).min(sheet.len());
                for row in sheet.iter_mut().take(end_idx).skip(start_idx) {
                    row.clear();
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let store = MemoryStore::new();
        let range = RangeSpec::new("BD", "A:Z");

        let ack = store
            .append_rows(&range, vec![row(&["a", "b"]), row(&["c", "d"])])
            .await
            .unwrap();
        assert_eq!(ack.start_row, 1);
        assert_eq!(ack.end_row, 2);
        assert_eq!(ack.updated_rows, 2);

        let rows = store.read_range(&range).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], row(&["c", "d"]));
    }

    #[tokio::test]
    async fn test_row_span_read() {
        let store = MemoryStore::new();
        let range = RangeSpec::new("BD", "A:Z");
        store
            .append_rows(&range, (0..5).map(|i| row(&[&i.to_string()])).collect())
            .await
            .unwrap();

        let span = store
            .read_range(&RangeSpec::rows("BD", 2, 3))
            .await
            .unwrap();
        assert_eq!(span.len(), 3);
        assert_eq!(span[0], row(&["1"]));
        assert_eq!(span[2], row(&["3"]));
    }

    #[tokio::test]
    async fn test_single_cell_update_and_clear() {
        let store = MemoryStore::new();
        let cell = RangeSpec::new("Control", "A1");

        store
            .update_range(&cell, vec![row(&["token_123"])])
            .await
            .unwrap();
        let read = store.read_range(&cell).await.unwrap();
        assert_eq!(read, vec![row(&["token_123"])]);

        store.clear_range(&cell).await.unwrap();
        let read = store.read_range(&cell).await.unwrap();
        assert!(read.is_empty() || read[0].is_empty());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryStore::new();
        let range = RangeSpec::new("BD", "A:Z");

        store.fail_next_appends(1);
        let err = store.append_rows(&range, vec![row(&["x"])]).await;
        assert!(matches!(err, Err(Error::Network(_))));

        // Next call succeeds
        store.append_rows(&range, vec![row(&["x"])]).await.unwrap();
        assert_eq!(store.append_calls(), 2);
    }
}
