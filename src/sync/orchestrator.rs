//! Engine wiring and background loops.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEntry, ProcessedCache};
use crate::config::StationSyncConfig;
use crate::error::{Error, Result};
use crate::integrity::IntegrityVerifier;
use crate::lock::DistributedLock;
use crate::queue::{DurableWriteQueue, FlushReport, QuarantineItem, QuarantineReason};
use crate::record::Record;
use crate::state::{Recovery, SyncStateTracker};
use crate::storage::LocalStorage;
use crate::store::RemoteStore;
use crate::version::VersionController;

use super::{ConflictDetails, DataUpdate, SyncEvents, SyncStats};

/// Row count sentinel before the first successful remote poll
const ROWS_UNKNOWN: u64 = u64::MAX;

/// What shutdown left behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Records still waiting in the durable queue
    pub pending: usize,
    /// Records parked in quarantine
    pub quarantined: usize,
}

/// The engine: owns every component and runs the background loops.
///
/// All collaborators are injected; nothing global, so two orchestrators
/// over the same remote store in one process behave exactly like two
/// stations.
pub struct SyncOrchestrator {
    config: StationSyncConfig,
    store: Arc<dyn RemoteStore>,
    events: Arc<dyn SyncEvents>,
    queue: Arc<DurableWriteQueue>,
    cache: Arc<ProcessedCache>,
    state: SyncStateTracker,
    recovery: Recovery,
    lock: DistributedLock,
    versions: VersionController,
    verifier: IntegrityVerifier,
    online: AtomicBool,
    in_progress: AtomicBool,
    flush_guard: Mutex<()>,
    last_sync: RwLock<Option<i64>>,
    last_error: RwLock<Option<String>>,
    known_rows: AtomicU64,
    reference_rows: Mutex<std::collections::HashMap<String, u64>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    /// Build the engine, restore durable components, and run crash
    /// recovery. No background loop starts until [`start`] is called.
    ///
    /// [`start`]: SyncOrchestrator::start
    pub async fn new(
        config: StationSyncConfig,
        store: Arc<dyn RemoteStore>,
        storage: Arc<LocalStorage>,
        events: Arc<dyn SyncEvents>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let queue = Arc::new(DurableWriteQueue::load(storage.clone(), &config.queue).await?);
        let cache = Arc::new(
            ProcessedCache::load(storage.clone(), &config.store, &config.cache).await?,
        );
        let state = SyncStateTracker::new(storage, &config.state);

        let recovery = state.recover().await?;
        match &recovery {
            Recovery::Clean => {}
            Recovery::StaleDiscarded(old) => {
                warn!(
                    batch_id = %old.batch_id,
                    records = old.record_count,
                    "previous run crashed mid-sync; queued records will redeliver"
                );
            }
            Recovery::InProgress(old) => {
                // Recent marker from an abrupt exit. Leave it in place so
                // the caller can inspect it through [`recovery`]; the next
                // flush pass replaces it when it begins a fresh batch.
                //
                // [`recovery`]: SyncOrchestrator::recovery
                warn!(
                    batch_id = %old.batch_id,
                    records = old.record_count,
                    lock_token = ?old.lock_token,
                    "previous process exited with a sync pass in flight"
                );
            }
        }

        let lock = DistributedLock::new(
            store.clone(),
            config.store.control_range(),
            config.lock.clone(),
        );
        let versions = VersionController::new(store.clone(), config.store.version_column);
        let verifier = IntegrityVerifier::new(store.clone(), config.store.column_types.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            store,
            events,
            queue,
            cache,
            state,
            recovery,
            lock,
            versions,
            verifier,
            online: AtomicBool::new(true),
            in_progress: AtomicBool::new(false),
            flush_guard: Mutex::new(()),
            last_sync: RwLock::new(None),
            last_error: RwLock::new(None),
            known_rows: AtomicU64::new(ROWS_UNKNOWN),
            reference_rows: Mutex::new(std::collections::HashMap::new()),
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// What crash recovery found at construction time.
    pub fn recovery(&self) -> &Recovery {
        &self.recovery
    }

    /// Accept a record. Durable immediately; delivered right away when
    /// online, on a later flush otherwise. Never fails because the
    /// network is down.
    pub async fn submit(&self, record: Record) -> Result<()> {
        debug!(id = %record.id, key = %record.primary_key, "record submitted");
        self.queue.enqueue(record).await?;

        if self.online.load(Ordering::SeqCst) {
            if let Err(e) = self.flush().await {
                self.note_error(&e).await;
            }
        } else {
            self.events.on_status_change(&self.stats().await).await;
        }
        Ok(())
    }

    /// Has this key already been processed? Pending queue first, then the
    /// server snapshot.
    pub async fn check_duplicate(&self, key: &str) -> Option<CacheEntry> {
        let pending = self.queue.pending().await;
        self.cache.lookup(key, &pending).await
    }

    /// Deliver everything pending. A pass already in flight, an offline
    /// engine, or an empty queue all make this a cheap no-op.
    pub async fn flush(&self) -> Result<FlushReport> {
        if !self.online.load(Ordering::SeqCst) {
            return Ok(FlushReport::default());
        }
        let Ok(_guard) = self.flush_guard.try_lock() else {
            debug!("flush already running");
            return Ok(FlushReport::default());
        };
        if self.queue.pending_count().await == 0 {
            return Ok(FlushReport::default());
        }

        self.in_progress.store(true, Ordering::SeqCst);
        self.events.on_sync_start().await;
        let result = self.flush_pass().await;
        self.in_progress.store(false, Ordering::SeqCst);

        match &result {
            Ok(report) => {
                if !report.delivered.is_empty() {
                    *self.last_sync.write().await = Some(Utc::now().timestamp_millis());
                }
                self.events.on_sync_end(&self.stats().await).await;
            }
            Err(e) => self.note_error(e).await,
        }
        result
    }

    async fn flush_pass(&self) -> Result<FlushReport> {
        let pending = self.queue.pending_count().await;
        let mut sync_state = self.state.begin(pending, None).await?;

        // Keep the marker fresh while records deliver, so a long pass over
        // a slow network is not classified as a crash on the next restart.
        let heartbeat = {
            let tracker = self.state.clone();
            let mut marker = sync_state.clone();
            let period = self.config.crash_threshold() / 4;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await; // first tick is immediate
                loop {
                    ticker.tick().await;
                    if tracker.heartbeat(&mut marker).await.is_err() {
                        break;
                    }
                }
            })
        };

        let data_range = self.config.store.data_range();
        let flushed = self.queue.flush(self.store.as_ref(), &data_range).await;
        heartbeat.abort();
        let report = flushed?;

        // Verify each confirmed block where the store says it landed. A
        // failed verification quarantines the record for operator review
        // rather than re-sending it: the rows are already remote, so a
        // retry would duplicate them.
        let mut confirmed: Vec<Record> = Vec::with_capacity(report.delivered.len());
        for (record, ack) in &report.delivered {
            let verdict = self
                .verifier
                .verify(&self.config.store.data_sheet, &[record.to_row()], ack.start_row)
                .await?;
            if verdict.success {
                confirmed.push(record.clone());
                continue;
            }

            error!(
                id = %record.id,
                row = ack.start_row,
                errors = ?verdict.errors,
                "delivered block failed verification"
            );
            self.queue
                .quarantine_record(record.clone(), QuarantineReason::IntegrityFailure)
                .await?;
            self.note_error(&Error::IntegrityMismatch {
                failed: verdict.details.failed_rows,
                total: verdict.details.total_rows,
            })
            .await;
        }
        self.cache.add_confirmed(&confirmed).await?;

        if report.remaining > 0 {
            self.state.record_attempt(&mut sync_state).await?;
            debug!(remaining = report.remaining, "flush pass ended with records pending");
        }
        self.state.complete().await?;

        info!(
            delivered = report.delivered.len(),
            quarantined = report.quarantined,
            remaining = report.remaining,
            "flush pass finished"
        );
        Ok(report)
    }

    /// Checked in-place update of a data row, serialized across stations
    /// by the distributed lock.
    pub async fn update_row(&self, row: u64, expected: i64, fields: Vec<String>) -> Result<i64> {
        let guard = self.lock.acquire().await?;

        // The marker records which lease this update ran under, so a crash
        // here leaves enough context to tell whose token is in the register.
        let token = guard.token().await;
        if let Err(e) = self.state.begin(1, Some(token.to_string())).await {
            if let Err(re) = guard.release().await {
                warn!(error = %re, "best-effort lock release failed");
            }
            return Err(e);
        }

        let result = if guard.is_lost() {
            Err(Error::LockLost)
        } else {
            self.versions
                .checked_update(&self.config.store.data_sheet, row, expected, fields)
                .await
        };

        if let Err(e) = guard.release().await {
            warn!(error = %e, "best-effort lock release failed");
        }
        self.state.complete().await?;

        if let Err(Error::VersionConflict {
            range,
            expected,
            actual,
            remote_row,
        }) = &result
        {
            self.events
                .on_conflict(&ConflictDetails {
                    range: range.clone(),
                    expected: *expected,
                    actual: *actual,
                    remote_row: remote_row.clone(),
                })
                .await;
        }

        result
    }

    /// Tell the engine whether the network is believed reachable. Going
    /// online triggers an immediate flush.
    pub async fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was == online {
            return;
        }
        info!(online, "connectivity changed");
        self.events.on_status_change(&self.stats().await).await;

        if online {
            if let Err(e) = self.flush().await {
                self.note_error(&e).await;
            }
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Current status snapshot.
    pub async fn stats(&self) -> SyncStats {
        SyncStats {
            pending: self.queue.pending_count().await,
            quarantined: self.queue.quarantined().await.map_or(0, |q| q.len()),
            in_progress: self.in_progress.load(Ordering::SeqCst),
            online: self.online.load(Ordering::SeqCst),
            last_sync: *self.last_sync.read().await,
            last_error: self.last_error.read().await.clone(),
        }
    }

    /// Pending records rendered as CSV for manual recovery.
    pub async fn export_pending_csv(&self) -> String {
        self.queue.export_pending_csv().await
    }

    /// Quarantined records awaiting operator review.
    pub async fn quarantined(&self) -> Result<Vec<QuarantineItem>> {
        self.queue.quarantined().await
    }

    /// Force a full cache snapshot refresh.
    pub async fn refresh_cache(&self) -> Result<bool> {
        self.cache
            .refresh(self.store.as_ref(), &self.config.store.data_range(), true)
            .await
    }

    /// Start the background loops: flush/poll, reference refresh, and
    /// cache refresh. Idempotent only in the sense that the caller should
    /// not invoke it twice.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        tasks.push(self.spawn_loop(self.config.poll_interval(), |this| async move {
            if let Err(e) = this.flush().await {
                this.note_error(&e).await;
            }
            this.poll_remote_growth().await;
        }));

        tasks.push(self.spawn_loop(self.config.reference_interval(), |this| async move {
            this.refresh_references().await;
        }));

        tasks.push(self.spawn_loop(self.config.cache_refresh_interval(), |this| async move {
            if !this.is_online() {
                return;
            }
            let range = this.config.store.data_range();
            if let Err(e) = this.cache.refresh(this.store.as_ref(), &range, false).await {
                this.note_error(&e).await;
            }
        }));

        info!(
            poll_ms = self.config.sync.poll_interval_ms,
            reference_ms = self.config.sync.reference_interval_ms,
            "background loops started"
        );
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, period: std::time::Duration, body: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let this = self.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick is immediate

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => body(this.clone()).await,
                }
            }
        })
    }

    /// Compare the remote row count against the last observed one. Growth
    /// means another station appended; refresh the snapshot and tell the
    /// observers.
    async fn poll_remote_growth(&self) {
        if !self.is_online() {
            return;
        }
        let range = self.config.store.data_range();
        let current = match self.store.read_range(&range).await {
            Ok(rows) => rows.len() as u64,
            Err(e) => {
                debug!(error = %e, "remote poll failed");
                return;
            }
        };

        let previous = self.known_rows.swap(current, Ordering::SeqCst);
        if previous == ROWS_UNKNOWN || previous == current {
            return;
        }

        debug!(previous, current, "remote row count changed");
        if let Err(e) = self.cache.refresh(self.store.as_ref(), &range, true).await {
            self.note_error(&e).await;
        }
        self.events
            .on_data_update(&DataUpdate {
                previous_rows: previous,
                current_rows: current,
            })
            .await;
    }

    async fn refresh_references(&self) {
        if !self.is_online() {
            return;
        }
        for range in &self.config.store.reference_ranges {
            let rows = match self.store.read_range(range).await {
                Ok(rows) => rows.len() as u64,
                Err(e) => {
                    debug!(range = %range, error = %e, "reference refresh failed");
                    continue;
                }
            };
            debug!(range = %range, rows, "reference range refreshed");

            let previous = self
                .reference_rows
                .lock()
                .await
                .insert(range.to_string(), rows);
            if let Some(previous) = previous {
                if previous != rows {
                    self.events
                        .on_data_update(&DataUpdate {
                            previous_rows: previous,
                            current_rows: rows,
                        })
                        .await;
                }
            }
        }
    }

    /// Stop the loops, attempt one final flush, and report what remains
    /// queued locally.
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }

        if self.is_online() {
            if let Err(e) = self.flush().await {
                warn!(error = %e, "final flush on shutdown failed");
            }
        }

        let report = ShutdownReport {
            pending: self.queue.pending_count().await,
            quarantined: self.queue.quarantined().await.map_or(0, |q| q.len()),
        };
        info!(pending = report.pending, "engine stopped");
        Ok(report)
    }

    async fn note_error(&self, e: &Error) {
        warn!(error = %e, "absorbed sync error");
        *self.last_error.write().await = Some(e.to_string());
    }
}
