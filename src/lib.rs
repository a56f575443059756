//! CacheMesh - a multi-layer cache coordination engine.
//!
//! CacheMesh keeps a process-local cache, a shared cache and any number of
//! third-party edge caches (CDNs) consistent with the data they were built
//! from. A write to a data key is resolved through a dependency graph into the
//! set of cache entries derived from it; those entries are evicted locally,
//! announced to peer instances over a pub/sub bus, and purged from the edge
//! under rate limiting and per-provider circuit breaking.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       CacheCoordinator                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Keys:   CacheKeyVersioner | DependencyResolver              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Local:  InMemoryStore | FragmentStore                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Peers:  InvalidationBus ─▶ PubSubTransport                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Edge:   EdgeCacheManager ─▶ TokenBucket ─▶ CircuitBreaker   │
//! │                          ─▶ ProviderClient (fan-out)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use cachemesh::config::CacheMeshConfig;
//! use cachemesh::NodeOptions;
//!
//! #[tokio::main]
//! async fn main() -> cachemesh::Result<()> {
//!     let config = CacheMeshConfig::development();
//!     cachemesh::run(config, NodeOptions::default()).await
//! }
//! ```

pub mod config;
pub mod error;

pub mod coordinator;
pub mod dependency;
pub mod edge;
pub mod fragment;
pub mod invalidation;
pub mod observability;
pub mod ratelimit;
pub mod resilience;
pub mod shutdown;
pub mod store;
pub mod versioning;

pub mod cli;

// Re-exports
pub use error::{CacheMeshError, Result};

use config::CacheMeshConfig;
use edge::{EdgeCacheManagerBuilder, ProviderClient};
use invalidation::{InProcessTransport, InvalidationBus, StoreEvictor};
use shutdown::ShutdownCoordinator;
use std::sync::Arc;
use std::time::Duration;
use store::InMemoryStore;
use tracing::{info, warn};

/// Runtime knobs for a node that are not part of the config file.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Local cache capacity in entries.
    pub capacity: usize,
    /// Interval between expired-entry sweeps.
    pub sweep_interval: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            capacity: InMemoryStore::DEFAULT_CAPACITY,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Run a CacheMesh node until Ctrl+C or SIGTERM.
pub async fn run(config: CacheMeshConfig, options: NodeOptions) -> Result<()> {
    observability::init(&config.observability)?;

    let shutdown = ShutdownCoordinator::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        signal_shutdown.shutdown_on_signal().await;
    });

    serve(config, options, shutdown).await
}

/// Run the node's background tasks until `shutdown` fires.
///
/// Starts the invalidation listener (when enabled) and the expiry sweeper, then
/// waits for both to stop within the coordinator's drain timeout.
pub async fn serve(
    config: CacheMeshConfig,
    options: NodeOptions,
    shutdown: ShutdownCoordinator,
) -> Result<()> {
    serve_with_providers(config, options, Vec::new(), shutdown).await
}

/// [`serve`] with edge providers registered on the node's edge manager.
///
/// The manager is built from the `edge`, `rate_limit` and `circuit_breaker`
/// sections; provider health is probed once at startup.
pub async fn serve_with_providers(
    config: CacheMeshConfig,
    options: NodeOptions,
    providers: Vec<Arc<dyn ProviderClient>>,
    shutdown: ShutdownCoordinator,
) -> Result<()> {
    config.validate()?;
    if options.sweep_interval.is_zero() {
        return Err(CacheMeshError::InvalidConfig {
            field: "sweep_interval".to_string(),
            reason: "must be non-zero".to_string(),
        });
    }

    let instance_id = config.node.resolve_instance_id();
    info!(node = %config.node.name, instance_id = %instance_id, "Starting CacheMesh node");

    let edge = providers
        .into_iter()
        .fold(EdgeCacheManagerBuilder::from_config(&config), |builder, provider| {
            builder.provider(provider)
        })
        .build()?;
    for (provider, healthy) in edge.get_health_status().await {
        if healthy {
            info!(provider = %provider, "Edge provider healthy");
        } else {
            warn!(provider = %provider, "Edge provider unhealthy at startup");
        }
    }

    let store = Arc::new(InMemoryStore::new(options.capacity));
    let mut handles = Vec::new();

    if config.invalidation.enabled {
        let transport = Arc::new(InProcessTransport::new(config.invalidation.buffer_size)?);
        let bus = Arc::new(InvalidationBus::with_instance_id(
            instance_id,
            config.invalidation.channel.clone(),
            transport,
            Arc::new(StoreEvictor::new(store.clone())),
        ));
        handles.push(("invalidation", bus.start(shutdown.clone()).await?));
    }

    let sweep_store = store.clone();
    let sweep_shutdown = shutdown.clone();
    let sweep_interval = options.sweep_interval;
    handles.push((
        "sweeper",
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = sweep_store.evict_expired().await;
                        if removed > 0 {
                            tracing::debug!(removed, "Swept expired entries");
                        }
                    }
                    _ = sweep_shutdown.wait_for_shutdown() => break,
                }
            }
        }),
    ));

    shutdown.wait_for_shutdown().await;
    info!("Shutting down CacheMesh gracefully...");

    let deadline = tokio::time::Instant::now() + shutdown.timeout();
    for (name, mut handle) in handles {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(service = %name, error = %e, "Service task failed"),
            Err(_) => {
                warn!(service = %name, "Force aborting service");
                handle.abort();
            }
        }
    }

    let purges = edge.get_metrics();
    info!(
        operations = purges.total_operations,
        failed = purges.failed_operations,
        rate_limited = purges.rate_limited_operations,
        "Edge purge totals"
    );

    let stats = store.stats().await;
    info!(entries = stats.entries, hits = stats.hits, misses = stats.misses, "CacheMesh shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let shutdown = ShutdownCoordinator::with_timeout(Duration::from_secs(1));
        let node = tokio::spawn(serve(
            CacheMeshConfig::development(),
            NodeOptions {
                capacity: 16,
                sweep_interval: Duration::from_millis(10),
            },
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.shutdown();

        node.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_rejects_duplicate_providers() {
        struct Noop;

        #[async_trait::async_trait]
        impl ProviderClient for Noop {
            fn name(&self) -> &str {
                "cdn"
            }

            fn cost_per_operation(&self) -> f64 {
                0.0
            }

            async fn purge_url(&self, _url: &str) -> edge::PurgeResult {
                edge::PurgeResult::success("cdn", edge::PurgeOperation::PurgeUrl, 0, 0.0, Duration::ZERO)
            }

            async fn purge_by_tag(&self, _tag: &str) -> edge::PurgeResult {
                edge::PurgeResult::success("cdn", edge::PurgeOperation::PurgeTag, 0, 0.0, Duration::ZERO)
            }

            async fn purge_all(&self) -> edge::PurgeResult {
                edge::PurgeResult::success("cdn", edge::PurgeOperation::PurgeAll, 0, 0.0, Duration::ZERO)
            }

            async fn is_healthy(&self) -> bool {
                true
            }

            async fn statistics(&self) -> edge::ProviderStats {
                edge::ProviderStats::default()
            }
        }

        let result = serve_with_providers(
            CacheMeshConfig::development(),
            NodeOptions::default(),
            vec![Arc::new(Noop), Arc::new(Noop)],
            ShutdownCoordinator::new(),
        )
        .await;
        assert!(matches!(result, Err(CacheMeshError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_serve_rejects_invalid_config() {
        let mut config = CacheMeshConfig::default();
        config.node.name = String::new();

        let result = serve(config, NodeOptions::default(), ShutdownCoordinator::new()).await;
        assert!(matches!(result, Err(CacheMeshError::InvalidConfig { .. })));
    }
}
