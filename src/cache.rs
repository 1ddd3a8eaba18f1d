//! Processed-Record Cache
//!
//! Duplicate detection for scanned keys. The cache answers "has this key
//! already been processed?" from two layers: records still waiting in the
//! local queue, then a periodically refreshed snapshot of the server's
//! data sheet. Checking the pending layer first closes the window where a
//! record is accepted locally but not yet visible remotely.
//!
//! Keys are aggressively normalized before comparison because they arrive
//! from barcode scanners and copy-pasted cells, which love to smuggle in
//! zero-width and non-breaking characters.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::{CacheConfig, StoreConfig};
use crate::error::Result;
use crate::record::Record;
use crate::storage::{LocalStorage, STORE_CACHE};
use crate::store::{RangeSpec, RemoteStore};

const ENTRIES_KEY: &str = "entries";
const LAST_UPDATE_KEY: &str = "last_update";

/// Which layer answered a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheSource {
    /// The key matches a record still waiting in the local queue
    LocalPending,
    /// The key matches a row in the server snapshot
    Server,
}

/// A known-processed key and the row it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub primary_key: String,
    pub secondary_key: Option<String>,
    pub fields: Vec<String>,
    pub source: CacheSource,
}

/// Strip invisible characters, trim, and uppercase a scanned key.
///
/// Removed outright: zero-width spaces and joiners (U+200B..U+200F and
/// the rest of the U+2000 block), BOM, non-breaking space, line and
/// paragraph separators, and embedded CR/LF/TAB.
pub fn normalize_key(raw: &str) -> String {
    raw.chars()
        .filter(|c| !is_invisible(*c))
        .collect::<String>()
        .trim()
        .to_uppercase()
}

fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{200B}' | '\u{FEFF}' | '\u{00A0}' | '\u{2028}' | '\u{2029}' | '\r' | '\n' | '\t'
    ) || ('\u{2000}'..='\u{200F}').contains(&c)
}

/// Snapshot cache of processed keys
pub struct ProcessedCache {
    storage: Arc<LocalStorage>,
    index: RwLock<HashMap<String, CacheEntry>>,
    last_update: RwLock<Option<i64>>,
    refreshing: Mutex<()>,
    primary_column: usize,
    secondary_column: Option<usize>,
    refresh_interval: Duration,
}

impl ProcessedCache {
    /// Build the cache, restoring the last persisted snapshot so lookups
    /// work offline from the first moment.
    pub async fn load(
        storage: Arc<LocalStorage>,
        store_config: &StoreConfig,
        cache_config: &CacheConfig,
    ) -> Result<Self> {
        let entries: Vec<CacheEntry> = storage
            .get(STORE_CACHE, ENTRIES_KEY)
            .await?
            .unwrap_or_default();
        let last_update: Option<i64> = storage.get(STORE_CACHE, LAST_UPDATE_KEY).await?;

        let mut index = HashMap::new();
        for entry in entries {
            Self::index_entry(&mut index, entry);
        }

        if !index.is_empty() {
            info!(keys = index.len(), "restored cache snapshot from disk");
        }

        Ok(Self {
            storage,
            index: RwLock::new(index),
            last_update: RwLock::new(last_update),
            refreshing: Mutex::new(()),
            primary_column: store_config.primary_key_column,
            secondary_column: store_config.secondary_key_column,
            refresh_interval: Duration::from_millis(cache_config.refresh_interval_ms),
        })
    }

    /// Look a key up, pending queue first.
    pub async fn lookup(&self, key: &str, pending: &[Record]) -> Option<CacheEntry> {
        let wanted = normalize_key(key);
        if wanted.is_empty() {
            return None;
        }

        for record in pending {
            let primary = normalize_key(&record.primary_key);
            let secondary = record.secondary_key.as_deref().map(normalize_key);
            if primary == wanted || secondary.as_deref() == Some(wanted.as_str()) {
                return Some(CacheEntry {
                    primary_key: primary,
                    secondary_key: secondary,
                    fields: record.fields.clone(),
                    source: CacheSource::LocalPending,
                });
            }
        }

        self.index.read().await.get(&wanted).cloned()
    }

    /// Rebuild the snapshot from the server's data sheet.
    ///
    /// Without `force`, a snapshot younger than the refresh interval is
    /// kept as-is. Concurrent callers don't stack: if a refresh is
    /// already running the call returns without doing another.
    pub async fn refresh(
        &self,
        store: &dyn RemoteStore,
        range: &RangeSpec,
        force: bool,
    ) -> Result<bool> {
        let Ok(_guard) = self.refreshing.try_lock() else {
            debug!("refresh already in flight, skipping");
            return Ok(false);
        };

        if !force {
            let last = *self.last_update.read().await;
            if let Some(last) = last {
                let age_ms = chrono::Utc::now().timestamp_millis().saturating_sub(last);
                if (age_ms.max(0) as u64) < self.refresh_interval.as_millis() as u64 {
                    debug!(age_ms, "snapshot still fresh, skipping refresh");
                    return Ok(false);
                }
            }
        }

        let rows = store.read_range(range).await?;
        let mut index = HashMap::new();

        // First row is the header
        for row in rows.into_iter().skip(1) {
            let primary = normalize_key(row.get(self.primary_column).map_or("", |s| s.as_str()));
            if primary.is_empty() {
                continue;
            }
            let secondary = self
                .secondary_column
                .and_then(|col| row.get(col))
                .map(|s| normalize_key(s))
                .filter(|s| !s.is_empty() && *s != primary);

            Self::index_entry(
                &mut index,
                CacheEntry {
                    primary_key: primary,
                    secondary_key: secondary,
                    fields: row,
                    source: CacheSource::Server,
                },
            );
        }

        info!(keys = index.len(), "cache snapshot refreshed");

        let now = chrono::Utc::now().timestamp_millis();
        *self.last_update.write().await = Some(now);
        *self.index.write().await = index;
        self.persist(now).await?;
        Ok(true)
    }

    /// Merge just-confirmed records into the snapshot without a full
    /// refresh, so their keys dedup immediately after delivery.
    pub async fn add_confirmed(&self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        {
            let mut index = self.index.write().await;
            for record in records {
                let primary = normalize_key(&record.primary_key);
                if primary.is_empty() {
                    continue;
                }
                let secondary = record
                    .secondary_key
                    .as_deref()
                    .map(normalize_key)
                    .filter(|s| !s.is_empty() && *s != primary);
                Self::index_entry(
                    &mut index,
                    CacheEntry {
                        primary_key: primary,
                        secondary_key: secondary,
                        fields: record.fields.clone(),
                        source: CacheSource::Server,
                    },
                );
            }
        }

        let last = self.last_update.read().await.unwrap_or(0);
        self.persist(last).await
    }

    /// Number of distinct indexed keys.
    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }

    /// Millisecond timestamp of the last full refresh, if any.
    pub async fn last_update(&self) -> Option<i64> {
        *self.last_update.read().await
    }

    fn index_entry(index: &mut HashMap<String, CacheEntry>, entry: CacheEntry) {
        if let Some(secondary) = entry.secondary_key.clone() {
            index.insert(secondary, entry.clone());
        }
        index.insert(entry.primary_key.clone(), entry);
    }

    async fn persist(&self, last_update: i64) -> Result<()> {
        let entries: Vec<CacheEntry> = {
            let index = self.index.read().await;
            // Each entry may be indexed twice; persist it once, by primary
            let mut seen = std::collections::HashSet::new();
            index
                .values()
                .filter(|e| seen.insert(e.primary_key.clone()))
                .cloned()
                .collect()
        };
        self.storage.put(STORE_CACHE, ENTRIES_KEY, &entries).await?;
        self.storage
            .put(STORE_CACHE, LAST_UPDATE_KEY, &last_update)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn store_config() -> StoreConfig {
        StoreConfig {
            data_sheet: "BD".into(),
            data_cells: "A:Z".into(),
            control_sheet: "Control".into(),
            control_cell: "A1".into(),
            primary_key_column: 0,
            secondary_key_column: Some(1),
            version_column: 5,
            column_types: vec![],
            reference_ranges: vec![],
        }
    }

    async fn empty_cache(storage: Arc<LocalStorage>) -> ProcessedCache {
        ProcessedCache::load(storage, &store_config(), &CacheConfig::default())
            .await
            .unwrap()
    }

    #[test]
    fn test_normalize_strips_scanner_garbage() {
        assert_eq!(normalize_key("  box-1\t"), "BOX-1");
        assert_eq!(normalize_key("\u{200B}BOX\u{FEFF}-1\r\n"), "BOX-1");
        assert_eq!(normalize_key("BOX\u{00A0}1"), "BOX1");
        assert_eq!(normalize_key("\u{2028}\u{200E}box-1"), "BOX-1");
        assert_eq!(normalize_key("   "), "");
    }

    #[tokio::test]
    async fn test_refresh_indexes_primary_and_secondary() {
        let storage = Arc::new(LocalStorage::in_memory().unwrap());
        let cache = empty_cache(storage).await;
        let store = MemoryStore::new();
        store
            .seed(
                "BD",
                vec![
                    row(&["Code", "Alt", "Status"]),
                    row(&["box-1", "alt-1", "ready"]),
                    row(&["box-2", "", "ready"]),
                    row(&["box-3", "box-3", "ready"]),
                ],
            )
            .await;

        let range = RangeSpec::new("BD", "A:Z");
        assert!(cache.refresh(&store, &range, true).await.unwrap());

        let hit = cache.lookup("ALT-1", &[]).await.unwrap();
        assert_eq!(hit.primary_key, "BOX-1");
        assert_eq!(hit.source, CacheSource::Server);

        assert!(cache.lookup("box-2", &[]).await.is_some());
        // Secondary equal to primary is not indexed twice
        assert_eq!(cache.len().await, 4);
        assert!(cache.lookup("HEADER", &[]).await.is_none());
    }

    #[tokio::test]
    async fn test_pending_layer_wins() {
        let storage = Arc::new(LocalStorage::in_memory().unwrap());
        let cache = empty_cache(storage).await;

        let pending = vec![Record::new(
            "station-1",
            "box-9",
            Some("alt-9".into()),
            vec!["box-9".into()],
        )];

        let hit = cache.lookup(" BOX-9 ", &pending).await.unwrap();
        assert_eq!(hit.source, CacheSource::LocalPending);
        let hit = cache.lookup("alt-9", &pending).await.unwrap();
        assert_eq!(hit.source, CacheSource::LocalPending);
        assert!(cache.lookup("box-9", &[]).await.is_none());
    }

    #[tokio::test]
    async fn test_add_confirmed_merges_incrementally() {
        let storage = Arc::new(LocalStorage::in_memory().unwrap());
        let cache = empty_cache(storage).await;

        let records = vec![Record::new("s", "box-5", None, vec!["box-5".into()])];
        cache.add_confirmed(&records).await.unwrap();

        let hit = cache.lookup("BOX-5", &[]).await.unwrap();
        assert_eq!(hit.source, CacheSource::Server);
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let storage = Arc::new(LocalStorage::in_memory().unwrap());
        {
            let cache = empty_cache(storage.clone()).await;
            let records = vec![Record::new("s", "box-7", None, vec!["box-7".into()])];
            cache.add_confirmed(&records).await.unwrap();
        }

        let reloaded = empty_cache(storage).await;
        assert!(reloaded.lookup("box-7", &[]).await.is_some());
    }

    #[tokio::test]
    async fn test_fresh_snapshot_skips_unforced_refresh() {
        let storage = Arc::new(LocalStorage::in_memory().unwrap());
        let cache = empty_cache(storage).await;
        let store = MemoryStore::new();
        store
            .seed("BD", vec![row(&["Code"]), row(&["box-1"])])
            .await;

        let range = RangeSpec::new("BD", "A:Z");
        assert!(cache.refresh(&store, &range, true).await.unwrap());
        assert!(!cache.refresh(&store, &range, false).await.unwrap());
        assert!(cache.refresh(&store, &range, true).await.unwrap());
    }
}
