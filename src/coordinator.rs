//! Write-path coordination across every cache layer.
//!
//! A write to a data key resolves everything that depends on it, evicts those
//! keys from the local and shared stores, tells peer instances to do the same,
//! and purges the matching URLs from the edge providers:
//!
//! ```text
//! write(key) ─▶ DependencyResolver::cascade
//!            ─▶ local + shared eviction
//!            ─▶ InvalidationBus::publish
//!            ─▶ EdgeCacheManager::purge_urls
//! ```
//!
//! Bus and edge failures never abort the local eviction; they are logged and
//! reported in the returned [`InvalidationReport`].

use crate::dependency::DependencyResolver;
use crate::edge::{EdgeCacheManager, PurgeResult};
use crate::error::Result;
use crate::invalidation::{InvalidationBus, MessageType};
use crate::store::{InMemoryStore, KeyValueStore};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Maps a cache key to the public URL the edge caches it under.
pub type UrlMapper = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Outcome of one coordinated invalidation
#[derive(Debug, Clone, Default, Serialize)]
pub struct InvalidationReport {
    /// Keys evicted from the local and shared layers
    pub evicted_keys: BTreeSet<String>,
    /// Whether peers were notified
    pub published: bool,
    /// Edge purge results, one per provider call
    pub purge_results: Vec<PurgeResult>,
}

impl InvalidationReport {
    /// Edge purges that failed
    pub fn failed_purges(&self) -> usize {
        self.purge_results.iter().filter(|r| !r.success).count()
    }
}

/// Ties the cache layers, the dependency graph, the bus and the edge together
pub struct CacheCoordinator {
    resolver: Arc<DependencyResolver>,
    local: Arc<InMemoryStore>,
    shared: Option<Arc<dyn KeyValueStore>>,
    bus: Option<Arc<InvalidationBus>>,
    edge: Option<Arc<EdgeCacheManager>>,
    url_mapper: Option<UrlMapper>,
}

impl CacheCoordinator {
    /// Starts building a coordinator over a local store
    pub fn builder(local: Arc<InMemoryStore>) -> CacheCoordinatorBuilder {
        CacheCoordinatorBuilder {
            resolver: None,
            local,
            shared: None,
            bus: None,
            edge: None,
            url_mapper: None,
        }
    }

    /// The dependency graph used for cascades
    pub fn resolver(&self) -> &Arc<DependencyResolver> {
        &self.resolver
    }

    /// Reads through the local layer, then the shared layer
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.local.get(key).await? {
            return Ok(Some(value));
        }
        match &self.shared {
            Some(shared) => shared.get(key).await,
            None => Ok(None),
        }
    }

    /// Writes a cache entry to both layers and records what it was built from
    pub async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: i64,
        depends_on: &[&str],
        tags: &[&str],
    ) -> Result<()> {
        if let Some(shared) = &self.shared {
            shared.put(key, value.clone(), ttl_seconds).await?;
        }
        self.local
            .put_with_tags(key, value, ttl_seconds, tags.iter().copied())
            .await?;

        self.resolver.untrack(key);
        self.resolver.track_dependencies(key, depends_on);
        Ok(())
    }

    /// Invalidates everything derived from `key` after it was written
    pub async fn on_write(&self, key: &str) -> Result<InvalidationReport> {
        let mut affected = self.resolver.cascade(key);
        affected.insert(key.to_string());

        let mut report = InvalidationReport::default();
        for cache_key in &affected {
            let mut evicted = self.local.evict(cache_key).await?;
            if let Some(shared) = &self.shared {
                evicted |= shared.evict(cache_key).await?;
            }
            if evicted {
                report.evicted_keys.insert(cache_key.clone());
            }
        }
        for cache_key in &affected {
            self.resolver.untrack(cache_key);
        }

        let keys: Vec<String> = affected.iter().cloned().collect();
        report.published = self.notify_peers(MessageType::Evict, keys, Vec::new()).await;

        if let (Some(edge), Some(mapper)) = (&self.edge, &self.url_mapper) {
            let mut urls: Vec<String> = affected.iter().filter_map(|k| mapper(k.as_str())).collect();
            urls.sort();
            urls.dedup();
            if !urls.is_empty() {
                report.purge_results = edge.purge_urls(urls).await;
            }
        }

        info!(
            key,
            evicted = report.evicted_keys.len(),
            failed_purges = report.failed_purges(),
            "Write invalidation complete"
        );
        Ok(report)
    }

    /// Invalidates every entry carrying any of `tags`
    pub async fn invalidate_by_tags(&self, tags: &[&str]) -> Result<InvalidationReport> {
        let evicted = self.local.evict_by_tags(tags.iter().copied()).await?;
        let mut report = InvalidationReport::default();
        for cache_key in evicted {
            if let Some(shared) = &self.shared {
                shared.evict(&cache_key).await?;
            }
            self.resolver.untrack(&cache_key);
            report.evicted_keys.insert(cache_key);
        }

        let owned: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        report.published = self
            .notify_peers(MessageType::EvictByTags, Vec::new(), owned)
            .await;

        if let Some(edge) = &self.edge {
            for tag in tags {
                report.purge_results.extend(edge.purge_by_tag(tag).await);
            }
        }

        info!(tags = ?tags, evicted = report.evicted_keys.len(), "Tag invalidation complete");
        Ok(report)
    }

    /// Clears every layer
    pub async fn invalidate_all(&self) -> Result<InvalidationReport> {
        let mut report = InvalidationReport {
            evicted_keys: self.local.keys().await?.into_iter().collect(),
            ..Default::default()
        };

        self.local.evict_all().await?;
        if let Some(shared) = &self.shared {
            shared.evict_all().await?;
        }
        self.resolver.clear();

        report.published = self
            .notify_peers(MessageType::EvictAll, Vec::new(), Vec::new())
            .await;
        if let Some(edge) = &self.edge {
            report.purge_results = edge.purge_all().await;
        }

        info!(evicted = report.evicted_keys.len(), "Full invalidation complete");
        Ok(report)
    }

    async fn notify_peers(
        &self,
        message_type: MessageType,
        keys: Vec<String>,
        tags: Vec<String>,
    ) -> bool {
        let Some(bus) = &self.bus else {
            return false;
        };
        match bus.publish(message_type, keys, tags).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to notify peers");
                false
            }
        }
    }
}

/// Builder for [`CacheCoordinator`]
pub struct CacheCoordinatorBuilder {
    resolver: Option<Arc<DependencyResolver>>,
    local: Arc<InMemoryStore>,
    shared: Option<Arc<dyn KeyValueStore>>,
    bus: Option<Arc<InvalidationBus>>,
    edge: Option<Arc<EdgeCacheManager>>,
    url_mapper: Option<UrlMapper>,
}

impl CacheCoordinatorBuilder {
    /// Shares a dependency graph, e.g. with a [`FragmentStore`](crate::fragment::FragmentStore)
    pub fn resolver(mut self, resolver: Arc<DependencyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Adds a shared (distributed) layer
    pub fn shared(mut self, shared: Arc<dyn KeyValueStore>) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Notifies peers through `bus`
    pub fn bus(mut self, bus: Arc<InvalidationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Purges edge caches through `edge`, for keys `url_mapper` maps to URLs
    pub fn edge(
        mut self,
        edge: Arc<EdgeCacheManager>,
        url_mapper: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.edge = Some(edge);
        self.url_mapper = Some(Arc::new(url_mapper));
        self
    }

    pub fn build(self) -> CacheCoordinator {
        CacheCoordinator {
            resolver: self.resolver.unwrap_or_default(),
            local: self.local,
            shared: self.shared,
            bus: self.bus,
            edge: self.edge,
            url_mapper: self.url_mapper,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_cascades_through_layers() {
        let local = Arc::new(InMemoryStore::default());
        let shared = Arc::new(InMemoryStore::default());
        let coordinator = CacheCoordinator::builder(local.clone())
            .shared(shared.clone())
            .build();

        coordinator
            .put("fragment:price", b"$10".to_vec(), 0, &["product:1"], &[])
            .await
            .unwrap();
        coordinator
            .put("page:product:1", b"<html/>".to_vec(), 0, &["fragment:price"], &[])
            .await
            .unwrap();
        coordinator
            .put("page:about", b"about".to_vec(), 0, &[], &[])
            .await
            .unwrap();

        let report = coordinator.on_write("product:1").await.unwrap();

        assert_eq!(
            report.evicted_keys,
            BTreeSet::from(["fragment:price".to_string(), "page:product:1".to_string()])
        );
        assert!(!report.published);
        assert!(report.purge_results.is_empty());
        assert_eq!(shared.keys().await.unwrap(), vec!["page:about".to_string()]);
        assert!(coordinator.get("page:about").await.unwrap().is_some());
        assert!(coordinator.resolver().verify_consistency().is_ok());
        assert_eq!(coordinator.resolver().stats().edges, 0);
    }

    #[tokio::test]
    async fn test_get_falls_back_to_shared() {
        let local = Arc::new(InMemoryStore::default());
        let shared = Arc::new(InMemoryStore::default());
        shared.put("k", b"v".to_vec(), 0).await.unwrap();

        let coordinator = CacheCoordinator::builder(local).shared(shared).build();
        assert_eq!(coordinator.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(coordinator.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tag_invalidation() {
        let local = Arc::new(InMemoryStore::default());
        let coordinator = CacheCoordinator::builder(local.clone()).build();

        coordinator
            .put("p:1", vec![1], 0, &["product:1"], &["product"])
            .await
            .unwrap();
        coordinator.put("u:1", vec![2], 0, &[], &["user"]).await.unwrap();

        let report = coordinator.invalidate_by_tags(&["product"]).await.unwrap();
        assert_eq!(report.evicted_keys, BTreeSet::from(["p:1".to_string()]));
        assert_eq!(local.size().await.unwrap(), 1);
        assert!(coordinator.resolver().get_dependents("product:1").is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let local = Arc::new(InMemoryStore::default());
        let coordinator = CacheCoordinator::builder(local.clone()).build();
        coordinator.put("a", vec![1], 0, &["x"], &[]).await.unwrap();
        coordinator.put("b", vec![2], 0, &[], &[]).await.unwrap();

        let report = coordinator.invalidate_all().await.unwrap();
        assert_eq!(report.evicted_keys.len(), 2);
        assert_eq!(local.size().await.unwrap(), 0);
        assert_eq!(coordinator.resolver().stats().edges, 0);
    }
}
