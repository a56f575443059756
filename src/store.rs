//! Key-value store boundary and an in-process LRU implementation.
//!
//! Both the local and the shared cache layers sit behind [`KeyValueStore`].
//! [`InMemoryStore`] is the reference implementation used for the local layer,
//! tests and single-host deployments; it additionally indexes entries by tag.

use async_trait::async_trait;
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::Result;

/// Async key-value store used as a cache layer.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get a live value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value. `ttl_seconds <= 0` means the entry never expires.
    async fn put(&self, key: &str, value: Vec<u8>, ttl_seconds: i64) -> Result<()>;

    /// Remove a key. Returns whether it was present.
    async fn evict(&self, key: &str) -> Result<bool>;

    /// Remove every key.
    async fn evict_all(&self) -> Result<()>;

    /// Keys of all live entries.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Number of live entries.
    async fn size(&self) -> Result<usize>;
}

/// Store statistics.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Total number of hits.
    pub hits: u64,
    /// Total number of misses, including expired reads.
    pub misses: u64,
    /// Entries removed by evictions of any kind.
    pub evictions: u64,
    /// Current number of entries, possibly including unread expired ones.
    pub entries: usize,
}

impl StoreStats {
    /// Calculate hit ratio.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Cache entry with metadata.
#[derive(Debug, Clone)]
struct CacheEntry {
    /// The cached value.
    value: Vec<u8>,
    /// Expiry deadline, `None` for no expiry.
    expires_at: Option<Instant>,
    /// Tags attached at write time.
    tags: HashSet<String>,
}

impl CacheEntry {
    fn new(value: Vec<u8>, ttl_seconds: i64, tags: HashSet<String>) -> Self {
        // A deadline past the clock's range is treated as no expiry
        let expires_at = u64::try_from(ttl_seconds)
            .ok()
            .filter(|secs| *secs > 0)
            .and_then(|secs| Instant::now().checked_add(Duration::from_secs(secs)));
        Self {
            value,
            expires_at,
            tags,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |deadline| now >= deadline)
    }
}

/// Entries plus the tag → keys index, kept under one lock.
struct Inner {
    entries: LruCache<String, CacheEntry>,
    tag_index: HashMap<String, HashSet<String>>,
}

impl Inner {
    fn unindex(&mut self, key: &str, tags: &HashSet<String>) {
        for tag in tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.unindex(key, &entry.tags);
        Some(entry)
    }
}

/// In-process LRU store with TTLs and a tag index.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl InMemoryStore {
    /// Default maximum number of entries.
    pub const DEFAULT_CAPACITY: usize = 10_000;

    /// Create a store bounded to `max_entries`.
    pub fn new(max_entries: usize) -> Self {
        let max_entries = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);

        Self {
            inner: RwLock::new(Inner {
                entries: LruCache::new(max_entries),
                tag_index: HashMap::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Store a value carrying tags.
    pub async fn put_with_tags<I, S>(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: i64,
        tags: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S> + Send,
        S: Into<String>,
    {
        let tags: HashSet<String> = tags.into_iter().map(Into::into).collect();
        let entry = CacheEntry::new(value, ttl_seconds, tags);
        let mut inner = self.inner.write().await;

        // Replace existing entry so its old tags are unindexed
        inner.remove(key);

        for tag in &entry.tags {
            inner
                .tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }

        if let Some((evicted_key, evicted)) = inner.entries.push(key.to_string(), entry) {
            // push returns the LRU victim when at capacity
            if evicted_key != key {
                inner.unindex(&evicted_key, &evicted.tags);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Evict every entry carrying any of `tags`. Returns the evicted keys.
    pub async fn evict_by_tags<I, S>(&self, tags: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S> + Send,
        S: AsRef<str>,
    {
        let mut inner = self.inner.write().await;
        let mut victims = HashSet::new();
        for tag in tags {
            if let Some(keys) = inner.tag_index.get(tag.as_ref()) {
                victims.extend(keys.iter().cloned());
            }
        }

        let mut evicted = Vec::with_capacity(victims.len());
        for key in victims {
            if inner.remove(&key).is_some() {
                evicted.push(key);
            }
        }
        self.evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        Ok(evicted)
    }

    /// Tags attached to a live key.
    pub async fn tags_of(&self, key: &str) -> Option<HashSet<String>> {
        let inner = self.inner.read().await;
        inner
            .entries
            .peek(key)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| entry.tags.clone())
    }

    /// Drop expired entries. Returns how many were removed.
    pub async fn evict_expired(&self) -> usize {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.remove(key);
        }
        self.evictions
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Get store statistics.
    pub async fn stats(&self) -> StoreStats {
        let inner = self.inner.read().await;
        StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: inner.entries.len(),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();

        let expired = match inner.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(entry.value.clone()));
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.remove(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl_seconds: i64) -> Result<()> {
        self.put_with_tags(key, value, ttl_seconds, std::iter::empty::<String>())
            .await
    }

    async fn evict(&self, key: &str) -> Result<bool> {
        let removed = self.inner.write().await.remove(key).is_some();
        if removed {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    async fn evict_all(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        let count = inner.entries.len() as u64;
        inner.entries.clear();
        inner.tag_index.clear();
        self.evictions.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        let now = Instant::now();
        Ok(inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn size(&self) -> Result<usize> {
        let inner = self.inner.read().await;
        let now = Instant::now();
        Ok(inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_put_get() {
        let store = InMemoryStore::default();
        store.put("user:1", b"alice".to_vec(), 0).await.unwrap();

        assert_eq!(store.get("user:1").await.unwrap(), Some(b"alice".to_vec()));
        assert_eq!(store.get("user:2").await.unwrap(), None);

        let stats = store.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio() - 0.5).abs() < 0.001);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_invisible_after_expiry() {
        let store = InMemoryStore::default();
        store.put("session", b"x".to_vec(), 5).await.unwrap();
        store.put("forever", b"y".to_vec(), -1).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.get("session").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store.get("session").await.unwrap().is_none());
        assert!(store.get("forever").await.unwrap().is_some());
        assert_eq!(store.size().await.unwrap(), 1);
        assert_eq!(store.keys().await.unwrap(), vec!["forever".to_string()]);
    }

    #[tokio::test]
    async fn test_evict_by_tags_prunes_index() {
        let store = InMemoryStore::default();
        store
            .put_with_tags("p:1", b"1".to_vec(), 0, ["product", "sale"])
            .await
            .unwrap();
        store
            .put_with_tags("p:2", b"2".to_vec(), 0, ["product"])
            .await
            .unwrap();
        store.put("u:1", b"u".to_vec(), 0).await.unwrap();

        let mut evicted = store.evict_by_tags(["sale"]).await.unwrap();
        evicted.sort();
        assert_eq!(evicted, vec!["p:1".to_string()]);

        let evicted = store.evict_by_tags(["product"]).await.unwrap();
        assert_eq!(evicted, vec!["p:2".to_string()]);

        assert!(store.evict_by_tags(["sale", "product"]).await.unwrap().is_empty());
        assert_eq!(store.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_tags() {
        let store = InMemoryStore::default();
        store
            .put_with_tags("k", b"1".to_vec(), 0, ["old"])
            .await
            .unwrap();
        store
            .put_with_tags("k", b"2".to_vec(), 0, ["new"])
            .await
            .unwrap();

        assert!(store.evict_by_tags(["old"]).await.unwrap().is_empty());
        assert_eq!(
            store.tags_of("k").await,
            Some(HashSet::from(["new".to_string()]))
        );
    }

    #[tokio::test]
    async fn test_lru_eviction_unindexes_victim() {
        let store = InMemoryStore::new(2);
        store.put_with_tags("a", vec![1], 0, ["t"]).await.unwrap();
        store.put_with_tags("b", vec![2], 0, ["t"]).await.unwrap();
        store.put_with_tags("c", vec![3], 0, ["t"]).await.unwrap();

        assert_eq!(store.size().await.unwrap(), 2);
        let mut evicted = store.evict_by_tags(["t"]).await.unwrap();
        evicted.sort();
        assert_eq!(evicted, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_evict_and_evict_all() {
        let store = InMemoryStore::default();
        for i in 0..5 {
            store.put(&format!("k{}", i), vec![i], 0).await.unwrap();
        }

        assert!(store.evict("k0").await.unwrap());
        assert!(!store.evict("k0").await.unwrap());
        assert_eq!(store.size().await.unwrap(), 4);

        store.evict_all().await.unwrap();
        assert_eq!(store.size().await.unwrap(), 0);
        assert_eq!(store.stats().await.evictions, 5);
    }

    #[tokio::test]
    async fn test_huge_ttl_never_expires() {
        let store = InMemoryStore::default();
        store
            .put_with_tags("k", vec![1], 0, ["old"])
            .await
            .unwrap();
        store
            .put_with_tags("k", vec![2], i64::MAX, ["new"])
            .await
            .unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(vec![2]));
        assert!(store.evict_by_tags(["old"]).await.unwrap().is_empty());
        assert_eq!(store.evict_by_tags(["new"]).await.unwrap(), vec!["k".to_string()]);
        assert_eq!(store.evict_expired().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired() {
        let store = InMemoryStore::default();
        store.put("short", vec![1], 1).await.unwrap();
        store.put("long", vec![2], 60).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.evict_expired().await, 1);
        assert_eq!(store.stats().await.entries, 1);
    }
}
