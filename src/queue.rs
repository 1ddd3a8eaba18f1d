//! Durable Write Queue
//!
//! Accepted records land here first and survive restarts; the queue is
//! the engine's promise that a write accepted offline is eventually
//! delivered. Records flush in acceptance order, carry a retry budget,
//! and move to an append-only quarantine once that budget runs out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::Result;
use crate::record::{Record, RecordState};
use crate::storage::{LocalStorage, STORE_QUARANTINE, STORE_QUEUE};
use crate::store::{AppendAck, RangeSpec, RemoteStore};

const QUEUE_KEY: &str = "queue";
const QUARANTINE_KEY: &str = "items";

/// Why a record was pulled out of the delivery path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuarantineReason {
    /// Delivery failed `max_retry` times
    RetryBudgetExhausted,
    /// The store acknowledged the append but verification failed
    IntegrityFailure,
}

/// A record parked for operator review. Quarantine is append-only from
/// the engine's point of view; re-submission is an operator action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineItem {
    pub record: Record,
    pub reason: QuarantineReason,
    pub quarantined_at: DateTime<Utc>,
}

/// Outcome of one flush pass over the queue
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Records the store confirmed, with where each block landed
    pub delivered: Vec<(Record, AppendAck)>,
    /// Records moved to quarantine during this pass
    pub quarantined: usize,
    /// Records still pending after the pass
    pub remaining: usize,
}

/// Durable FIFO queue of unconfirmed records
pub struct DurableWriteQueue {
    storage: Arc<LocalStorage>,
    pending: Mutex<Vec<Record>>,
    in_flight: Mutex<Option<Uuid>>,
    max_retry: u32,
}

impl DurableWriteQueue {
    /// Load the queue from local storage, restoring any records a previous
    /// process left behind.
    pub async fn load(storage: Arc<LocalStorage>, config: &QueueConfig) -> Result<Self> {
        let pending: Vec<Record> = storage
            .get(STORE_QUEUE, QUEUE_KEY)
            .await?
            .unwrap_or_default();

        if !pending.is_empty() {
            info!(count = pending.len(), "restored pending records from disk");
        }

        Ok(Self {
            storage,
            pending: Mutex::new(pending),
            in_flight: Mutex::new(None),
            max_retry: config.max_retry,
        })
    }

    /// Accept a record. Durable before this returns; idempotent by record
    /// id, so re-submitting a restored record is a no-op.
    pub async fn enqueue(&self, record: Record) -> Result<()> {
        let mut pending = self.pending.lock().await;
        if pending.iter().any(|r| r.id == record.id) {
            debug!(id = %record.id, "record already queued, skipping");
            return Ok(());
        }

        debug!(id = %record.id, key = %record.primary_key, "record queued");
        pending.push(record);
        self.persist(&pending).await
    }

    /// Deliver pending records in order.
    ///
    /// Each confirmed record is removed from the durable image before the
    /// next one is attempted, so a crash mid-flush can re-deliver at most
    /// the record in flight. A transient failure increments the record's
    /// attempt count and ends the pass; the record stays at the head so
    /// ordering is preserved across passes.
    ///
    /// The pending mutex is only held while the in-memory list is touched,
    /// never across a store call, so `enqueue` stays responsive while a
    /// slow append is in flight.
    pub async fn flush(
        &self,
        store: &dyn RemoteStore,
        range: &RangeSpec,
    ) -> Result<FlushReport> {
        let mut report = FlushReport::default();

        loop {
            let Some(record) = self.pending.lock().await.first().cloned() else {
                break;
            };

            *self.in_flight.lock().await = Some(record.id);
            let outcome = store.append_rows(range, vec![record.to_row()]).await;
            *self.in_flight.lock().await = None;

            match outcome {
                Ok(ack) => {
                    {
                        let mut pending = self.pending.lock().await;
                        pending.retain(|r| r.id != record.id);
                        self.persist(&pending).await?;
                    }
                    debug!(id = %record.id, row = ack.start_row, "record delivered");
                    report.delivered.push((record, ack));
                }
                Err(e) => {
                    let parked = {
                        let mut pending = self.pending.lock().await;
                        // Discarded while in flight; nothing to update.
                        let Some(pos) = pending.iter().position(|r| r.id == record.id) else {
                            continue;
                        };

                        pending[pos].attempts += 1;
                        warn!(
                            id = %record.id,
                            attempts = pending[pos].attempts,
                            error = %e,
                            "delivery attempt failed"
                        );

                        if pending[pos].attempts >= self.max_retry {
                            let parked = pending.remove(pos);
                            self.persist(&pending).await?;
                            Some(parked)
                        } else {
                            self.persist(&pending).await?;
                            None
                        }
                    };

                    match parked {
                        Some(parked) => {
                            self.quarantine_record(parked, QuarantineReason::RetryBudgetExhausted)
                                .await?;
                            report.quarantined += 1;
                        }
                        None => break,
                    }
                }
            }
        }

        report.remaining = self.pending.lock().await.len();
        Ok(report)
    }

    /// Lifecycle state of a record by id.
    ///
    /// The queue forgets delivered records, so an id it has never seen is
    /// indistinguishable from a confirmed one.
    pub async fn record_state(&self, id: Uuid) -> Result<RecordState> {
        if *self.in_flight.lock().await == Some(id) {
            return Ok(RecordState::Sending);
        }
        if let Some(record) = self.pending.lock().await.iter().find(|r| r.id == id) {
            return Ok(if record.attempts == 0 {
                RecordState::Queued
            } else {
                RecordState::Failed
            });
        }
        if self.quarantined().await?.iter().any(|q| q.record.id == id) {
            return Ok(RecordState::Quarantined);
        }
        Ok(RecordState::Confirmed)
    }

    /// Park a record in quarantine with the given reason.
    pub async fn quarantine_record(
        &self,
        record: Record,
        reason: QuarantineReason,
    ) -> Result<()> {
        warn!(id = %record.id, reason = ?reason, "record quarantined");

        let mut items: Vec<QuarantineItem> = self
            .storage
            .get(STORE_QUARANTINE, QUARANTINE_KEY)
            .await?
            .unwrap_or_default();
        items.push(QuarantineItem {
            record,
            reason,
            quarantined_at: Utc::now(),
        });
        self.storage
            .put(STORE_QUARANTINE, QUARANTINE_KEY, &items)
            .await
    }

    /// Snapshot of the pending records, in delivery order.
    pub async fn pending(&self) -> Vec<Record> {
        self.pending.lock().await.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Quarantined records, oldest first.
    pub async fn quarantined(&self) -> Result<Vec<QuarantineItem>> {
        Ok(self
            .storage
            .get(STORE_QUARANTINE, QUARANTINE_KEY)
            .await?
            .unwrap_or_default())
    }

    /// Render the pending records as CSV for manual recovery, one line per
    /// record, fields quoted per RFC 4180.
    pub async fn export_pending_csv(&self) -> String {
        let pending = self.pending.lock().await;
        let mut out = String::new();
        for record in pending.iter() {
            let line: Vec<String> = record.fields.iter().map(|f| csv_field(f)).collect();
            out.push_str(&line.join(","));
            out.push_str("\r\n");
        }
        out
    }

    /// Drop a pending record by id (operator action after CSV export).
    pub async fn discard(&self, id: Uuid) -> Result<bool> {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|r| r.id != id);
        if pending.len() != before {
            self.persist(&pending).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn persist(&self, pending: &[Record]) -> Result<()> {
        self.storage.put(STORE_QUEUE, QUEUE_KEY, &pending).await
    }
}

fn csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
