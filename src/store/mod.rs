//! Remote Store Adapter
//!
//! The shared tabular backend is reachable only through four range
//! primitives: read, append, overwrite, clear. There are no transactions,
//! no row locks, and no change notifications; everything the engine
//! guarantees is built on top of these calls. Calls can fail with
//! transient network errors, authorization errors, or quota errors, and
//! multi-row calls are not assumed atomic.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use memory::MemoryStore;

/// A row as the store sees it: ordered cells, all strings.
pub type Row = Vec<String>;

/// Addressable range in the remote store, e.g. `BD!A:Z` or `Control!A1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeSpec {
    /// Sheet (tab) name
    pub sheet: String,
    /// Cell range within the sheet
    pub cells: String,
}

impl RangeSpec {
    pub fn new(sheet: impl Into<String>, cells: impl Into<String>) -> Self {
        Self {
            sheet: sheet.into(),
            cells: cells.into(),
        }
    }

    /// Range covering exactly `count` rows starting at 1-based `start_row`,
    /// spanning all columns. Used to re-read a just-written block.
    pub fn rows(sheet: impl Into<String>, start_row: u64, count: usize) -> Self {
        let end_row = start_row + count.saturating_sub(1) as u64;
        Self {
            sheet: sheet.into(),
            cells: format!("A{}:Z{}", start_row, end_row),
        }
    }
}

impl std::fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}!{}", self.sheet, self.cells)
    }
}

/// Acknowledgment returned by a successful append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendAck {
    /// 1-based first row the block landed on
    pub start_row: u64,
    /// 1-based last row of the block
    pub end_row: u64,
    /// Number of rows the store reports written
    pub updated_rows: usize,
}

/// The four remote store primitives.
///
/// Implementations wrap a real backend (HTTP spreadsheet API, database
/// view, …); the engine never talks to the network except through this
/// trait, which is what makes racing clients simulable in tests.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read every populated row in the range, in row order.
    async fn read_range(&self, range: &RangeSpec) -> Result<Vec<Row>>;

    /// Append rows after the last populated row of the range.
    async fn append_rows(&self, range: &RangeSpec, rows: Vec<Row>) -> Result<AppendAck>;

    /// Overwrite the range with the given rows.
    async fn update_range(&self, range: &RangeSpec, rows: Vec<Row>) -> Result<()>;

    /// Clear the range.
    async fn clear_range(&self, range: &RangeSpec) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_display() {
        let range = RangeSpec::new("BD", "A:Z");
        assert_eq!(range.to_string(), "BD!A:Z");
    }

    #[test]
    fn test_rows_range() {
        let range = RangeSpec::rows("BD", 5, 3);
        assert_eq!(range.cells, "A5:Z7");

        let single = RangeSpec::rows("BD", 12, 1);
        assert_eq!(single.cells, "A12:Z12");
    }
}
