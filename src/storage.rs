//! Local Durable Storage
//!
//! SQLite-backed key/value stores that survive process restarts. Each
//! component owns a named store (write queue, quarantine, cache snapshot,
//! sync state) and persists JSON documents under string keys. A write is
//! considered durable once the SQL statement returns.

use std::path::PathBuf;

use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::Result;

/// Store name for the durable write queue
pub const STORE_QUEUE: &str = "write_queue";
/// Store name for quarantined records
pub const STORE_QUARANTINE: &str = "quarantine";
/// Store name for the processed-record cache snapshot
pub const STORE_CACHE: &str = "cache_snapshot";
/// Store name for the sync state tracker
pub const STORE_STATE: &str = "sync_state";

/// Durable local storage backed by SQLite.
///
/// The connection lives behind a `Mutex` rather than a reader/writer
/// lock: `rusqlite::Connection` is not `Sync`, so shared read access
/// buys nothing, and the `Mutex` is what keeps `LocalStorage` usable
/// from spawned tasks.
pub struct LocalStorage {
    conn: Mutex<Connection>,
}

impl LocalStorage {
    /// Create or open the local database under `data_dir`.
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join("stationsync.db");
        Self::open(db_path)
    }

    /// Open (or create) the database at an explicit path.
    pub fn open(db_path: PathBuf) -> Result<Self> {
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                store TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (store, key)
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, for tests that don't care about restarts.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                store TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (store, key)
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Store a JSON document under `(store, key)`, replacing any previous
    /// value.
    pub async fn put<T: Serialize>(&self, store: &str, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO kv (store, key, value) VALUES (?1, ?2, ?3)
            ON CONFLICT(store, key) DO UPDATE SET value = ?3, updated_at = CURRENT_TIMESTAMP
            "#,
            params![store, key, json],
        )?;
        Ok(())
    }

    /// Load the document stored under `(store, key)`, if any.
    pub async fn get<T: DeserializeOwned>(&self, store: &str, key: &str) -> Result<Option<T>> {
        let conn = self.conn.lock().await;
        let result: std::result::Result<String, _> = conn.query_row(
            "SELECT value FROM kv WHERE store = ?1 AND key = ?2",
            params![store, key],
            |row| row.get(0),
        );

        match result {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the document under `(store, key)`. Missing keys are fine.
    pub async fn delete(&self, store: &str, key: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM kv WHERE store = ?1 AND key = ?2",
            params![store, key],
        )?;
        Ok(())
    }

    /// Number of keys in a store.
    pub async fn count(&self, store: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kv WHERE store = ?1",
            params![store],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Remove every key in a store.
    pub async fn clear(&self, store: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM kv WHERE store = ?1", params![store])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_put_get_delete() {
        let storage = LocalStorage::in_memory().unwrap();

        storage
            .put(STORE_STATE, "current-sync", &vec!["a", "b"])
            .await
            .unwrap();
        let loaded: Option<Vec<String>> = storage.get(STORE_STATE, "current-sync").await.unwrap();
        assert_eq!(loaded, Some(vec!["a".to_string(), "b".to_string()]));

        storage.delete(STORE_STATE, "current-sync").await.unwrap();
        let loaded: Option<Vec<String>> = storage.get(STORE_STATE, "current-sync").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_stores_are_isolated() {
        let storage = LocalStorage::in_memory().unwrap();

        storage.put(STORE_QUEUE, "k", &1u32).await.unwrap();
        storage.put(STORE_QUARANTINE, "k", &2u32).await.unwrap();

        let queue: Option<u32> = storage.get(STORE_QUEUE, "k").await.unwrap();
        let quarantine: Option<u32> = storage.get(STORE_QUARANTINE, "k").await.unwrap();
        assert_eq!(queue, Some(1));
        assert_eq!(quarantine, Some(2));

        storage.clear(STORE_QUEUE).await.unwrap();
        assert_eq!(storage.count(STORE_QUEUE).await.unwrap(), 0);
        assert_eq!(storage.count(STORE_QUARANTINE).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_usable_from_spawned_tasks() {
        let storage = std::sync::Arc::new(LocalStorage::in_memory().unwrap());

        let writer = tokio::spawn({
            let storage = storage.clone();
            async move { storage.put(STORE_QUEUE, "bg", &7u32).await }
        });
        writer.await.unwrap().unwrap();

        let loaded: Option<u32> = storage.get(STORE_QUEUE, "bg").await.unwrap();
        assert_eq!(loaded, Some(7));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stationsync.db");

        {
            let storage = LocalStorage::open(path.clone()).unwrap();
            storage.put(STORE_QUEUE, "r1", &"payload").await.unwrap();
        }

        let storage = LocalStorage::open(path).unwrap();
        let loaded: Option<String> = storage.get(STORE_QUEUE, "r1").await.unwrap();
        assert_eq!(loaded.as_deref(), Some("payload"));
    }
}
