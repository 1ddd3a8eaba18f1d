//! Sync Orchestrator
//!
//! Wires the queue, lock, cache, version controller, state tracker, and
//! verifier into one engine with a small surface: submit records, flush,
//! do checked updates, and report status. Embedders observe the engine
//! through the [`SyncEvents`] strategy trait instead of callbacks wired
//! into globals; a UI, a logger, or a test recorder all plug in the same
//! way.

mod orchestrator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use orchestrator::{ShutdownReport, SyncOrchestrator};

/// Engine status snapshot handed to event observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    /// Records waiting in the durable queue
    pub pending: usize,
    /// Records parked in quarantine
    pub quarantined: usize,
    /// Whether a flush pass is running right now
    pub in_progress: bool,
    /// Current connectivity assumption
    pub online: bool,
    /// Millisecond timestamp of the last successful flush pass
    pub last_sync: Option<i64>,
    /// Most recent absorbed error, if any
    pub last_error: Option<String>,
}

/// Remote data-sheet growth noticed by the poll loop.
///
/// Row count is a proxy: it catches appends by other stations but not
/// in-place edits. Callers wanting exactness refresh the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataUpdate {
    pub previous_rows: u64,
    pub current_rows: u64,
}

/// A checked update that lost to a concurrent writer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictDetails {
    pub range: String,
    pub expected: i64,
    pub actual: i64,
    /// The row as the winning writer left it
    pub remote_row: Vec<String>,
}

/// Observer hooks for engine lifecycle moments.
///
/// Every method has an empty default, so implementors override only what
/// they care about.
#[async_trait]
pub trait SyncEvents: Send + Sync {
    /// A flush pass is starting.
    async fn on_sync_start(&self) {}

    /// A flush pass finished; `stats` reflects the new queue depth.
    async fn on_sync_end(&self, stats: &SyncStats) {
        let _ = stats;
    }

    /// Connectivity or queue status changed outside a flush pass.
    async fn on_status_change(&self, stats: &SyncStats) {
        let _ = stats;
    }

    /// A checked update lost the version race.
    async fn on_conflict(&self, details: &ConflictDetails) {
        let _ = details;
    }

    /// Another station grew the remote data sheet.
    async fn on_data_update(&self, update: &DataUpdate) {
        let _ = update;
    }
}

/// No-op observer for embedders that don't need events
pub struct NullEvents;

#[async_trait]
impl SyncEvents for NullEvents {}
