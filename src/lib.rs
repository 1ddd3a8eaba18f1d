//! StationSync - Offline-First Station Synchronization Engine
//!
//! A synchronization and concurrency-control engine for fleets of
//! operator stations that share one remote tabular store. The store
//! offers only four range primitives (read, append, overwrite, clear),
//! so everything else is built client-side: durable write queueing,
//! distributed locking over a register cell, optimistic row versioning,
//! duplicate detection, crash recovery, and post-write integrity checks.
//!
//! # Architecture
//!
//! Records accepted at a station land in a durable local queue and are
//! flushed to the remote store in order when connectivity allows. The
//! append path needs no lock; in-place updates are serialized across
//! stations by a TTL lease held in a single control cell and guarded by
//! per-row version markers. Every component is injected into the
//! [`sync::SyncOrchestrator`], which runs the background loops and
//! reports through the [`sync::SyncEvents`] strategy trait.
//!
//! # Features
//!
//! - Writes survive restarts, crashes, and offline stretches
//! - Lock liveness via TTL takeover, safe against crashed holders
//! - Version-conflict detection for concurrent in-place edits
//! - Scanned-key normalization and dual-layer duplicate lookup
//! - Read-back verification with per-row CRC32 checksums

pub mod cache;
pub mod config;
pub mod error;
pub mod integrity;
pub mod lock;
pub mod logging;
pub mod queue;
pub mod record;
pub mod state;
pub mod storage;
pub mod store;
pub mod sync;
pub mod version;

pub use config::StationSyncConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{CacheEntry, CacheSource, ProcessedCache};
    pub use crate::config::StationSyncConfig;
    pub use crate::error::{Error, Result};
    pub use crate::integrity::{ColumnType, IntegrityVerifier, VerifyReport};
    pub use crate::lock::{DistributedLock, LockGuard, LockToken};
    pub use crate::queue::{DurableWriteQueue, FlushReport, QuarantineItem};
    pub use crate::record::{Record, RecordState};
    pub use crate::state::{Recovery, SyncState, SyncStateTracker};
    pub use crate::storage::LocalStorage;
    pub use crate::store::{AppendAck, MemoryStore, RangeSpec, RemoteStore};
    pub use crate::sync::{NullEvents, SyncEvents, SyncOrchestrator, SyncStats};
    pub use crate::version::VersionController;
}
