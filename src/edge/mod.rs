//! Edge cache purging for CDN providers.
//!
//! Fans purge operations out to every registered provider:
//! - Provider contract and purge results
//! - Rate-limited, circuit-broken fan-out
//! - Time-windowed URL batching
//! - Purge metrics

pub mod batch;
pub mod manager;
pub mod metrics;
pub mod provider;

pub use batch::{BatchStats, PurgeBatcher};
pub use manager::{AggregatedStatistics, EdgeCacheManager, EdgeCacheManagerBuilder, EdgeConfig};
pub use metrics::{EdgeMetrics, FacadeMetricsSink, MetricsSink, MetricsSnapshot, ProviderMetrics};
pub use provider::{ProviderClient, ProviderStats, PurgeOperation, PurgeResult};
