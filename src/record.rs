//! Operational Records
//!
//! A record is the unit of work the engine promises not to lose: an
//! ordered field list destined for one appended row, plus the metadata
//! the queue and orchestrator need to retry, deduplicate, and version it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A locally-accepted operational event awaiting confirmation.
///
/// Owned exclusively by the durable write queue until the remote store
/// confirms the append, after which it is merged into the processed cache
/// and dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Unique id, stable across retries
    pub id: Uuid,

    /// When the station accepted this record
    pub created_at: DateTime<Utc>,

    /// Delivery attempts so far
    pub attempts: u32,

    /// Client-assigned monotonic version (milliseconds since epoch)
    pub version: i64,

    /// Stable per-session client identifier
    pub client_id: String,

    /// Primary dedup key (e.g. the scanned item code)
    pub primary_key: String,

    /// Secondary dedup key, when the item carries two codes
    pub secondary_key: Option<String>,

    /// Ordered field list appended as one row
    pub fields: Vec<String>,
}

impl Record {
    /// Create a new record with fresh metadata.
    pub fn new(
        client_id: impl Into<String>,
        primary_key: impl Into<String>,
        secondary_key: Option<String>,
        fields: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            attempts: 0,
            version: now.timestamp_millis(),
            client_id: client_id.into(),
            primary_key: primary_key.into(),
            secondary_key,
            fields,
        }
    }

    /// Render the record as the row the store will receive.
    pub fn to_row(&self) -> Vec<String> {
        self.fields.clone()
    }
}

/// Lifecycle of a record inside the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    /// Accepted locally, waiting in the durable queue
    Queued,
    /// A delivery attempt is in flight
    Sending,
    /// The remote store confirmed the append
    Confirmed,
    /// Delivery failed; will be retried on the next flush
    Failed,
    /// Retry budget exhausted; parked for operator review
    Quarantined,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_metadata() {
        let record = Record::new(
            "station-1",
            "BOX-001",
            Some("ALT-001".to_string()),
            vec!["01/02/2026".into(), "08:15:00".into(), "BOX-001".into()],
        );

        assert_eq!(record.attempts, 0);
        assert_eq!(record.client_id, "station-1");
        assert!(record.version > 0);
        assert_eq!(record.to_row().len(), 3);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Record::new("s", "K1", None, vec![]);
        let b = Record::new("s", "K1", None, vec![]);
        assert_ne!(a.id, b.id);
    }
}
