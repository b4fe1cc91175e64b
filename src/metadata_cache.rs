//! Cache of portal-confirmed dataset metadata.
//!
//! Entries are created when the data portal confirms a dataset, read by subsequent requests and
//! removed when a load from the cached location fails or, optionally, when they exceed a maximum
//! age. Nothing is persisted.

use crate::data_portal::DatasetMetadata;

use hashbrown::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Source of the current time, replaceable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The system monotonic clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Identity of a dataset: its dataroot tag and name.
///
/// The tag is `None` when serving a single dataset.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct DatasetKey {
    pub tag: Option<String>,
    pub dataset: String,
}

impl DatasetKey {
    pub fn new(tag: Option<&str>, dataset: &str) -> Self {
        Self {
            tag: tag.map(str::to_string),
            dataset: dataset.to_string(),
        }
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{}/{}", tag, self.dataset),
            None => write!(f, "{}", self.dataset),
        }
    }
}

/// Cached portal record and the location it resolved to.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub metadata: DatasetMetadata,
    /// Resolved storage location. `None` for tombstoned datasets.
    pub location: Option<String>,
}

struct TimedEntry {
    entry: CacheEntry,
    inserted: Instant,
}

/// Dataset metadata cache shared by all requests.
///
/// A [hashbrown::HashMap] guarded by a read-write lock, optimised for reads. Concurrent misses
/// for the same key may each query the portal; the last insert wins.
pub struct MetadataCache {
    map: RwLock<HashMap<DatasetKey, TimedEntry>>,
    /// Entries older than this are treated as absent.
    max_age: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl MetadataCache {
    /// Create an empty cache using the system clock.
    pub fn new(max_age: Option<Duration>) -> Self {
        Self::with_clock(max_age, Arc::new(SystemClock))
    }

    pub fn with_clock(max_age: Option<Duration>, clock: Arc<dyn Clock>) -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            max_age,
            clock,
        }
    }

    fn is_expired(&self, entry: &TimedEntry) -> bool {
        self.max_age
            .map_or(false, |max_age| self.clock.now().duration_since(entry.inserted) > max_age)
    }

    /// Return the entry for a key, if present and not expired.
    pub async fn get(&self, key: &DatasetKey) -> Option<CacheEntry> {
        {
            let map = self.map.read().await;
            match map.get(key) {
                None => return None,
                Some(timed) if !self.is_expired(timed) => return Some(timed.entry.clone()),
                Some(_) => {}
            }
        }
        // Expired: remove it, unless it was replaced since we dropped the read lock.
        let mut map = self.map.write().await;
        if let Some(timed) = map.get(key) {
            if !self.is_expired(timed) {
                return Some(timed.entry.clone());
            }
            tracing::debug!("metadata cache entry for {} expired", key);
            map.remove(key);
        }
        None
    }

    /// Insert or replace the entry for a key.
    pub async fn insert(&self, key: DatasetKey, entry: CacheEntry) {
        let inserted = self.clock.now();
        self.map
            .write()
            .await
            .insert(key, TimedEntry { entry, inserted });
    }

    /// Remove the entry for a key. Returns whether an entry was removed.
    pub async fn evict(&self, key: &DatasetKey) -> bool {
        self.map.write().await.remove(key).is_some()
    }

    /// Number of entries, including expired entries not yet removed.
    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.map.read().await.is_empty()
    }
}
