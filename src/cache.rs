//! Process-local TTL cache for config resolution and entity metadata.
//!
//! Each process caches independently; there is no cross-process
//! invalidation, and the maximum staleness after a config write equals
//! the entry TTL (60 s by default). Negative results are cached like any
//! other value: the caller stores an empty resolution or a `None`
//! entity, which is what makes the no-entity-config fast path cheap.
//!
//! A per-key fetch lock prevents thundering-herd misses: one worker
//! fetches while the rest wait and then read the filled entry.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default entry lifetime.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// TTL cache with per-key single-flight fetching.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    flights: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached value if present and unexpired.
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read();
        entries.get(key).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write();
        entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Returns the cached value, or runs `fetch` to fill it. Concurrent
    /// misses on the same key wait for the first fetch instead of piling
    /// onto the store.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let flight = {
            let mut flights = self.flights.lock();
            flights
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = flight.lock().await;

        // Another worker may have filled the entry while we waited.
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let result = fetch().await;
        if let Ok(value) = &result {
            self.insert(key.clone(), value.clone());
        }

        let mut flights = self.flights.lock();
        flights.remove(&key);
        result
    }

    /// Drops entries matching the predicate.
    pub fn invalidate_if(&self, mut pred: impl FnMut(&K) -> bool) {
        let mut entries = self.entries.write();
        entries.retain(|key, _| !pred(key));
    }

    pub fn invalidate_all(&self) {
        self.entries.write().clear();
    }

    #[cfg(test)]
    fn expire_all(&self) {
        let mut entries = self.entries.write();
        for entry in entries.values_mut() {
            entry.expires_at = Instant::now() - Duration::from_secs(1);
        }
    }
}
