//! Crash-Recoverable Sync State
//!
//! A persisted marker describing the sync pass currently in flight. On a
//! clean run the marker is written at batch start, heartbeated during the
//! pass, and cleared at the end. After a crash the marker is still there;
//! recovery classifies it by age so a restart never resumes a batch whose
//! lease and remote context are long gone.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::StateConfig;
use crate::error::Result;
use crate::storage::{LocalStorage, STORE_STATE};

const STATE_KEY: &str = "current-sync";

/// Persisted snapshot of an in-flight sync pass
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncState {
    /// Whether a pass is currently running
    pub in_flight: bool,
    /// Identifier of the running batch
    pub batch_id: Uuid,
    /// Wire form of the lease token held for this pass, if any
    pub lock_token: Option<String>,
    /// Delivery attempts made within this pass
    pub attempts: u32,
    /// Records covered by this pass
    pub record_count: usize,
    /// Last heartbeat, milliseconds since epoch
    pub timestamp: i64,
}

/// What a restart finds in the state store
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    /// No marker: the previous process finished cleanly
    Clean,
    /// Marker older than the crash threshold: a crash artifact, discarded
    StaleDiscarded(SyncState),
    /// Recent marker: a pass may genuinely still be running elsewhere
    /// in this process's previous life; caller decides how to proceed
    InProgress(SyncState),
}

/// Tracker for the persisted sync-pass marker. Clones share the same
/// storage, so a heartbeat task can run off its own handle.
#[derive(Clone)]
pub struct SyncStateTracker {
    storage: Arc<LocalStorage>,
    crash_threshold: Duration,
}

impl SyncStateTracker {
    pub fn new(storage: Arc<LocalStorage>, config: &StateConfig) -> Self {
        Self {
            storage,
            crash_threshold: Duration::from_millis(config.crash_threshold_ms),
        }
    }

    /// Mark the start of a sync pass. Durable before any remote call of
    /// the pass is made.
    pub async fn begin(
        &self,
        record_count: usize,
        lock_token: Option<String>,
    ) -> Result<SyncState> {
        let state = SyncState {
            in_flight: true,
            batch_id: Uuid::new_v4(),
            lock_token,
            attempts: 0,
            record_count,
            timestamp: Utc::now().timestamp_millis(),
        };
        self.storage.put(STORE_STATE, STATE_KEY, &state).await?;
        Ok(state)
    }

    /// Refresh the marker's timestamp mid-pass so a long pass is not
    /// mistaken for a crash artifact.
    pub async fn heartbeat(&self, state: &mut SyncState) -> Result<()> {
        state.timestamp = Utc::now().timestamp_millis();
        self.storage.put(STORE_STATE, STATE_KEY, state).await
    }

    /// Bump the attempt counter and persist.
    pub async fn record_attempt(&self, state: &mut SyncState) -> Result<()> {
        state.attempts += 1;
        state.timestamp = Utc::now().timestamp_millis();
        self.storage.put(STORE_STATE, STATE_KEY, state).await
    }

    /// Clear the marker. The pass is over, successfully or not.
    pub async fn complete(&self) -> Result<()> {
        self.storage.delete(STORE_STATE, STATE_KEY).await
    }

    /// Inspect the marker left by the previous process, clearing it when
    /// it is a crash artifact.
    pub async fn recover(&self) -> Result<Recovery> {
        let Some(state): Option<SyncState> = self.storage.get(STORE_STATE, STATE_KEY).await?
        else {
            return Ok(Recovery::Clean);
        };

        let age_ms = Utc::now()
            .timestamp_millis()
            .saturating_sub(state.timestamp)
            .max(0) as u64;

        if Duration::from_millis(age_ms) > self.crash_threshold {
            warn!(
                batch_id = %state.batch_id,
                age_ms,
                records = state.record_count,
                "discarding stale sync marker from a previous crash"
            );
            self.storage.delete(STORE_STATE, STATE_KEY).await?;
            return Ok(Recovery::StaleDiscarded(state));
        }

        info!(batch_id = %state.batch_id, age_ms, "found recent sync marker");
        Ok(Recovery::InProgress(state))
    }
}
