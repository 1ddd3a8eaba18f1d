//! StationSync Error Types

use thiserror::Error;

/// Result type alias for StationSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// StationSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Remote store errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authorization error: {0}")]
    Auth(String),

    #[error("Quota exceeded: {0}")]
    Quota(String),

    #[error("Range not found: {0}")]
    RangeNotFound(String),

    // Concurrency errors
    #[error("Version conflict on {range}: expected {expected}, found {actual}")]
    VersionConflict {
        range: String,
        expected: i64,
        actual: i64,
        remote_row: Vec<String>,
    },

    #[error("Lock acquisition timed out after {waited_ms}ms")]
    LockTimeout { waited_ms: u64 },

    #[error("Lock lost: renewal failed while critical section was open")]
    LockLost,

    // Queue errors
    #[error("Retry budget exhausted for record {record_id} after {attempts} attempts")]
    RetryBudgetExhausted { record_id: uuid::Uuid, attempts: u32 },

    // Integrity errors
    #[error("Integrity mismatch: {failed} of {total} rows failed verification")]
    IntegrityMismatch { failed: usize, total: usize },

    // Local storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // State errors
    #[error("Sync state error: {0}")]
    State(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Quota(_))
    }

    /// Check if this error invalidates the current session.
    ///
    /// Fatal-to-session errors surface a re-authentication request;
    /// writes keep queuing locally in the meantime.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, Error::Auth(_))
    }

    /// Check if this error is absorbed (logged and reported for operator
    /// review) rather than interrupting the caller.
    pub fn is_absorbed(&self) -> bool {
        matches!(
            self,
            Error::RetryBudgetExhausted { .. } | Error::IntegrityMismatch { .. }
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::Quota("rate limited".into()).is_retryable());
        assert!(!Error::Auth("expired token".into()).is_retryable());
        assert!(!Error::LockTimeout { waited_ms: 60000 }.is_retryable());
    }

    #[test]
    fn test_absorbed_classification() {
        let quarantined = Error::RetryBudgetExhausted {
            record_id: uuid::Uuid::new_v4(),
            attempts: 3,
        };
        assert!(quarantined.is_absorbed());
        assert!(Error::IntegrityMismatch { failed: 1, total: 5 }.is_absorbed());
        assert!(!Error::Network("down".into()).is_absorbed());
    }
}
