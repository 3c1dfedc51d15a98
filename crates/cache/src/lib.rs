//! Expiring key/value cache used to memoize consensus-log reads.
//!
//! Entries carry a per-entry TTL and are never returned past it. A background
//! sweeper removes expired entries on a fixed interval; `get` also lazily
//! drops an expired entry it encounters. When the cache is full, `set` evicts
//! the single oldest-by-insertion entry before inserting.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, RwLock};
use tracing::{debug, trace};

/// Configuration for an [`ExpiringCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied when `set` is called without an explicit one
    pub default_ttl: Duration,
    /// Maximum number of entries held at once
    pub max_entries: usize,
    /// Interval of the background expiry sweep
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
            max_entries: 1000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Cache entry with its own deadline.
#[derive(Clone, Debug)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) > self.ttl
    }
}

/// Cache statistics.
#[derive(Default, Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

type EntryMap<K, V> = Arc<RwLock<HashMap<K, Entry<V>>>>;

/// Generic expiring cache.
///
/// Cloning is cheap and clones share the same backing map and sweeper.
#[derive(Clone)]
pub struct ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    config: CacheConfig,
    entries: EntryMap<K, V>,
    stats: Arc<RwLock<CacheStats>>,
    destroyed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a new cache and spawn its background sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: CacheConfig) -> Self {
        let entries: EntryMap<K, V> = Arc::new(RwLock::new(HashMap::new()));
        let destroyed = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        let sweep_entries = entries.clone();
        let sweep_destroyed = destroyed.clone();
        let sweep_shutdown = shutdown.clone();
        let sweep_interval = config.sweep_interval;

        tokio::spawn(async move {
            // Pinned once so the shutdown waiter stays registered while a
            // sweep holds the write lock; the flag covers a destroy landing
            // before the first registration.
            let notified = sweep_shutdown.notified();
            tokio::pin!(notified);
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                if sweep_destroyed.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => {
                        let now = Instant::now();
                        let mut entries = sweep_entries.write().await;
                        let before = entries.len();
                        entries.retain(|_, entry| !entry.is_expired(now));
                        let swept = before - entries.len();
                        if swept > 0 {
                            debug!("Cache sweep removed {swept} expired entries");
                        }
                    }
                    _ = &mut notified => {
                        break;
                    }
                }
            }
        });

        Self {
            config,
            entries,
            stats: Arc::new(RwLock::new(CacheStats::default())),
            destroyed,
            shutdown,
        }
    }

    /// Insert a value with an explicit TTL, or the configured default.
    pub async fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        let mut entries = self.entries.write().await;

        // At capacity, make room by dropping the oldest insertion.
        if !entries.contains_key(&key) && entries.len() >= self.config.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                self.stats.write().await.evictions += 1;
                trace!("Evicted oldest cache entry to make room");
            }
        }

        entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
                ttl: ttl.unwrap_or(self.config.default_ttl),
            },
        );
    }

    /// Get a value, removing it if expired. Never returns a value past its TTL.
    pub async fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();

        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    self.stats.write().await.hits += 1;
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.stats.write().await.misses += 1;
                    return None;
                }
            }
        }

        // Entry exists but is expired; drop it lazily.
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if entry.is_expired(Instant::now()) {
                entries.remove(key);
            }
        }
        self.stats.write().await.misses += 1;
        None
    }

    /// Whether a live (unexpired) entry exists for the key.
    pub async fn has(&self, key: &K) -> bool {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(Instant::now()))
    }

    /// Remove an entry, returning whether one was present.
    pub async fn delete(&self, key: &K) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    /// Get a cached value, or run `factory` on a miss and store its result.
    ///
    /// The factory runs at most once per miss. Concurrent misses on the same
    /// key may each run it; the last write wins.
    pub async fn get_or_set<F, Fut, E>(
        &self,
        key: K,
        factory: F,
        ttl: Option<Duration>,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }

        let value = factory().await?;
        self.set(key, value.clone(), ttl).await;
        Ok(value)
    }

    /// Remove all entries.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
        debug!("Cache cleared");
    }

    /// Number of entries currently held, expired or not.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Get cache statistics.
    pub async fn stats(&self) -> CacheStats {
        self.stats.read().await.clone()
    }

    /// Stop the background sweeper and drop all entries.
    pub async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(ttl_ms: u64, max: usize) -> CacheConfig {
        CacheConfig {
            default_ttl: Duration::from_millis(ttl_ms),
            max_entries: max,
            sweep_interval: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = ExpiringCache::new(config(1000, 10));

        cache.set("a", 1u32, None).await;
        assert_eq!(cache.get(&"a").await, Some(1));
        assert!(cache.has(&"a").await);

        assert!(cache.delete(&"a").await);
        assert!(!cache.delete(&"a").await);
        assert_eq!(cache.get(&"a").await, None);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = ExpiringCache::new(config(50, 10));

        cache.set("a", 1u32, None).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(cache.get(&"a").await, None);
        assert!(!cache.has(&"a").await);
    }

    #[tokio::test]
    async fn test_per_entry_ttl_overrides_default() {
        let cache = ExpiringCache::new(config(10, 10));

        cache
            .set("long", 1u32, Some(Duration::from_secs(60)))
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.get(&"long").await, Some(1));
    }

    #[tokio::test]
    async fn test_eviction_at_capacity() {
        let cache = ExpiringCache::new(config(1000, 2));

        cache.set("first", 1u32, None).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.set("second", 2u32, None).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.set("third", 3u32, None).await;

        // Oldest insertion goes first.
        assert_eq!(cache.get(&"first").await, None);
        assert_eq!(cache.get(&"second").await, Some(2));
        assert_eq!(cache.get(&"third").await, Some(3));
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_get_or_set_runs_factory_once_within_ttl() {
        let cache = ExpiringCache::new(config(1000, 10));
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            let value: Result<u32, std::convert::Infallible> = cache
                .get_or_set(
                    "k",
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(42)
                    },
                    None,
                )
                .await;
            assert_eq!(value.unwrap(), 42);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_set_propagates_factory_error() {
        let cache: ExpiringCache<&str, u32> = ExpiringCache::new(config(1000, 10));

        let result = cache
            .get_or_set("k", || async { Err::<u32, &str>("boom") }, None)
            .await;
        assert_eq!(result, Err("boom"));

        // Nothing was stored on failure.
        assert!(!cache.has(&"k").await);
    }

    #[tokio::test]
    async fn test_background_sweep() {
        let cache = ExpiringCache::new(CacheConfig {
            default_ttl: Duration::from_millis(20),
            max_entries: 10,
            sweep_interval: Duration::from_millis(40),
        });

        cache.set("a", 1u32, None).await;
        cache.set("b", 2u32, None).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Swept without any get touching them.
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_destroy_stops_sweeper() {
        let cache = ExpiringCache::new(CacheConfig {
            default_ttl: Duration::from_millis(10),
            max_entries: 10,
            sweep_interval: Duration::from_millis(25),
        });

        cache.set("a", 1u32, None).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.destroy().await;

        // No sweep runs after destroy: the expired entry stays until a get
        // drops it lazily.
        cache.set("b", 2u32, None).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get(&"b").await, None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_clear_and_destroy() {
        let cache = ExpiringCache::new(config(1000, 10));

        cache.set("a", 1u32, None).await;
        cache.clear().await;
        assert!(cache.is_empty().await);

        cache.set("b", 2u32, None).await;
        cache.destroy().await;
        assert!(cache.is_empty().await);
    }
}
