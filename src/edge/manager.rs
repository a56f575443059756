// Edge Cache Manager

use super::metrics::{EdgeMetrics, FacadeMetricsSink, MetricsSink, MetricsSnapshot};
use super::provider::{ProviderClient, ProviderStats, PurgeOperation, PurgeResult};
use crate::config::CacheMeshConfig;
use crate::error::{CacheMeshError, Result};
use crate::ratelimit::{RateLimitConfig, RateLimiterStatus, TokenBucket};
use crate::resilience::{with_timeout, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use futures::future::join_all;
use futures::stream::{self, BoxStream, FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Edge manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Maximum URLs per purge batch
    pub batch_size: usize,
    /// Time a partial batch waits for more URLs
    #[serde(with = "crate::config::humantime_serde")]
    pub batch_timeout: Duration,
    /// Maximum simultaneous in-flight provider calls
    pub max_concurrency: usize,
    /// Per-call provider timeout
    #[serde(with = "crate::config::humantime_serde")]
    pub provider_timeout: Duration,
    /// Timeout for health and statistics probes
    #[serde(with = "crate::config::humantime_serde")]
    pub health_check_timeout: Duration,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            batch_size: 30,
            batch_timeout: Duration::from_millis(100),
            max_concurrency: 10,
            provider_timeout: Duration::from_secs(10),
            health_check_timeout: Duration::from_secs(2),
        }
    }
}

impl EdgeConfig {
    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CacheMeshError::InvalidConfig {
                field: "edge.batch_size".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_concurrency == 0 {
            return Err(CacheMeshError::InvalidConfig {
                field: "edge.max_concurrency".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.provider_timeout.is_zero() {
            return Err(CacheMeshError::InvalidConfig {
                field: "edge.provider_timeout".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Logical purge request fanned out to providers
#[derive(Debug, Clone, PartialEq, Eq)]
enum PurgeRequest {
    Url(String),
    Tag(String),
    All,
}

impl PurgeRequest {
    fn operation(&self) -> PurgeOperation {
        match self {
            PurgeRequest::Url(_) => PurgeOperation::PurgeUrl,
            PurgeRequest::Tag(_) => PurgeOperation::PurgeTag,
            PurgeRequest::All => PurgeOperation::PurgeAll,
        }
    }
}

/// A registered provider and its dedicated breaker
struct ProviderSlot {
    client: Arc<dyn ProviderClient>,
    breaker: CircuitBreaker,
}

/// Aggregated provider statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedStatistics {
    /// Providers that answered the statistics probe
    pub providers_reporting: usize,
    pub total_requests: u64,
    pub successful_purges: u64,
    pub failed_purges: u64,
    pub total_cost: f64,
    /// Unweighted mean of provider latencies, `None` if nobody reports one
    pub average_latency_ms: Option<f64>,
    /// Unweighted mean of provider hit rates, `None` if nobody reports one
    pub cache_hit_rate: Option<f64>,
    /// Hit rate weighted by each provider's request volume
    pub weighted_cache_hit_rate: Option<f64>,
}

/// Orchestrates purges across every registered edge provider.
///
/// Each logical operation passes the shared rate limiter once, then fans out to
/// every healthy provider concurrently. Every provider call goes through that
/// provider's circuit breaker and a timeout, so one slow or failing vendor
/// never holds back or aborts the others.
pub struct EdgeCacheManager {
    config: EdgeConfig,
    providers: Vec<ProviderSlot>,
    rate_limiter: Option<TokenBucket>,
    concurrency: Semaphore,
    metrics: Arc<EdgeMetrics>,
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl EdgeCacheManager {
    /// Starts building a manager
    pub fn builder() -> EdgeCacheManagerBuilder {
        EdgeCacheManagerBuilder::default()
    }

    /// Gets the configuration
    pub fn config(&self) -> &EdgeConfig {
        &self.config
    }

    /// Names of all registered providers, healthy or not
    pub fn provider_names(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|slot| slot.client.name().to_string())
            .collect()
    }

    /// Purges a URL on every healthy provider
    pub async fn purge_url(&self, url: &str) -> Vec<PurgeResult> {
        self.purge_url_stream(url).collect().await
    }

    /// Purges a URL, yielding each provider's result as it completes
    pub fn purge_url_stream(&self, url: &str) -> BoxStream<'_, PurgeResult> {
        self.dispatch(PurgeRequest::Url(url.to_string()))
    }

    /// Purges many URLs in batches of `batch_size`
    pub async fn purge_urls<I, S>(&self, urls: I) -> Vec<PurgeResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let urls: Vec<String> = urls.into_iter().map(Into::into).collect();
        let mut results = Vec::with_capacity(urls.len() * self.providers.len().max(1));

        for batch in urls.chunks(self.config.batch_size) {
            results.extend(self.purge_batch(batch).await);
        }

        results
    }

    /// Purges one batch; URLs in the batch run concurrently
    pub(crate) async fn purge_batch(&self, batch: &[String]) -> Vec<PurgeResult> {
        tracing::debug!(batch_size = batch.len(), "Processing purge batch");
        join_all(batch.iter().map(|url| self.purge_url(url)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Purges a cache tag on every healthy provider
    pub async fn purge_by_tag(&self, tag: &str) -> Vec<PurgeResult> {
        self.dispatch(PurgeRequest::Tag(tag.to_string()))
            .collect()
            .await
    }

    /// Purges everything on every healthy provider
    pub async fn purge_all(&self) -> Vec<PurgeResult> {
        self.dispatch(PurgeRequest::All).collect().await
    }

    /// Health of every registered provider
    pub async fn get_health_status(&self) -> HashMap<String, bool> {
        let checks = self.providers.iter().map(|slot| async move {
            (slot.client.name().to_string(), self.probe_health(slot).await)
        });
        join_all(checks).await.into_iter().collect()
    }

    /// Combines every provider's statistics
    pub async fn get_aggregated_statistics(&self) -> AggregatedStatistics {
        let timeout = self.config.health_check_timeout;
        let probes = self.providers.iter().map(|slot| async move {
            match tokio::time::timeout(timeout, slot.client.statistics()).await {
                Ok(stats) => Some(stats),
                Err(_) => {
                    tracing::warn!(provider = %slot.client.name(), "Statistics probe timed out");
                    None
                }
            }
        });
        let stats: Vec<ProviderStats> = join_all(probes).await.into_iter().flatten().collect();
        aggregate(&stats)
    }

    /// Rate limiter status, `None` when rate limiting is disabled
    pub fn get_rate_limiter_status(&self) -> Option<RateLimiterStatus> {
        self.rate_limiter.as_ref().map(TokenBucket::status)
    }

    /// Breaker status per provider
    pub fn get_circuit_breaker_status(&self) -> HashMap<String, CircuitBreakerStats> {
        self.providers
            .iter()
            .map(|slot| (slot.client.name().to_string(), slot.breaker.stats()))
            .collect()
    }

    /// Purge metrics recorded so far
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Admission, health filtering and fan-out shared by all operations
    fn dispatch(&self, request: PurgeRequest) -> BoxStream<'_, PurgeResult> {
        if let Some(limiter) = &self.rate_limiter {
            if let Err(e) = limiter.acquire() {
                tracing::warn!(operation = %request.operation(), error = %e, "Purge rejected");
                let rejected = PurgeResult::rate_limited(request.operation());
                self.record(&rejected);
                return stream::once(async move { rejected }).boxed();
            }
        }

        stream::once(async move {
            let healthy = self.healthy_providers().await;
            if healthy.is_empty() {
                tracing::warn!(operation = %request.operation(), "No healthy edge providers");
            }
            healthy
                .into_iter()
                .map(|slot| self.call_provider(slot, request.clone()))
                .collect::<FuturesUnordered<_>>()
        })
        .flatten()
        .inspect(move |result| self.record(result))
        .boxed()
    }

    async fn healthy_providers(&self) -> Vec<&ProviderSlot> {
        let checks = self.providers.iter().map(|slot| async move {
            if self.probe_health(slot).await {
                Some(slot)
            } else {
                tracing::debug!(provider = %slot.client.name(), "Skipping unhealthy provider");
                None
            }
        });
        join_all(checks).await.into_iter().flatten().collect()
    }

    async fn probe_health(&self, slot: &ProviderSlot) -> bool {
        tokio::time::timeout(self.config.health_check_timeout, slot.client.is_healthy())
            .await
            .unwrap_or(false)
    }

    async fn call_provider(&self, slot: &ProviderSlot, request: PurgeRequest) -> PurgeResult {
        let name = slot.client.name().to_string();
        let operation = request.operation();

        let _permit = match self.concurrency.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return PurgeResult::failure(name, operation, "edge manager closed", Duration::ZERO)
            }
        };

        let started = Instant::now();
        let client = Arc::clone(&slot.client);
        let timeout = self.config.provider_timeout;

        let outcome = slot
            .breaker
            .execute(|| async move {
                let result = with_timeout(timeout, || async {
                    Ok(match &request {
                        PurgeRequest::Url(url) => client.purge_url(url).await,
                        PurgeRequest::Tag(tag) => client.purge_by_tag(tag).await,
                        PurgeRequest::All => client.purge_all().await,
                    })
                })
                .await?;

                if result.success {
                    Ok(result)
                } else {
                    Err(CacheMeshError::provider(
                        client.name(),
                        result.error.unwrap_or_else(|| "purge failed".to_string()),
                    ))
                }
            })
            .await;

        match outcome {
            Ok(result) => result,
            Err(e) => {
                if e.is_rejection() {
                    tracing::debug!(provider = %name, operation = %operation, error = %e, "Edge purge short-circuited");
                } else {
                    tracing::warn!(provider = %name, operation = %operation, error = %e, "Edge purge failed");
                }
                let message = match e {
                    CacheMeshError::Provider { message, .. } => message,
                    other => other.to_string(),
                };
                PurgeResult::failure(name, operation, message, started.elapsed())
            }
        }
    }

    fn record(&self, result: &PurgeResult) {
        self.metrics.record_purge(result);
        for sink in &self.sinks {
            sink.record_purge(result);
        }
    }
}

/// Sums counts and cost; averages latency and hit rate over providers that
/// report a finite value
fn aggregate(stats: &[ProviderStats]) -> AggregatedStatistics {
    let mean = |values: Vec<f64>| -> Option<f64> {
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    };

    let latencies: Vec<f64> = stats
        .iter()
        .map(|s| s.average_latency_ms)
        .filter(|v| v.is_finite())
        .collect();
    let hit_rates: Vec<f64> = stats
        .iter()
        .map(|s| s.cache_hit_rate)
        .filter(|v| v.is_finite())
        .collect();

    let (weighted_hits, weighted_requests) = stats
        .iter()
        .filter(|s| s.cache_hit_rate.is_finite() && s.total_requests > 0)
        .fold((0.0, 0u64), |(hits, requests), s| {
            (
                hits + s.cache_hit_rate * s.total_requests as f64,
                requests + s.total_requests,
            )
        });

    AggregatedStatistics {
        providers_reporting: stats.len(),
        total_requests: stats.iter().map(|s| s.total_requests).sum(),
        successful_purges: stats.iter().map(|s| s.successful_purges).sum(),
        failed_purges: stats.iter().map(|s| s.failed_purges).sum(),
        total_cost: stats.iter().map(|s| s.total_cost).sum(),
        average_latency_ms: mean(latencies),
        cache_hit_rate: mean(hit_rates),
        weighted_cache_hit_rate: if weighted_requests == 0 {
            None
        } else {
            Some(weighted_hits / weighted_requests as f64)
        },
    }
}

/// Builder for [`EdgeCacheManager`]
#[derive(Default)]
pub struct EdgeCacheManagerBuilder {
    config: EdgeConfig,
    rate_limit: RateLimitConfig,
    circuit_breaker: CircuitBreakerConfig,
    providers: Vec<Arc<dyn ProviderClient>>,
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl EdgeCacheManagerBuilder {
    /// Starts from a node configuration: edge, rate limit and breaker
    /// sections, plus the `metrics` facade sink when metrics are enabled
    pub fn from_config(config: &CacheMeshConfig) -> Self {
        let builder = Self::default()
            .config(config.edge.clone())
            .rate_limit(config.rate_limit.clone())
            .circuit_breaker(config.circuit_breaker.clone());
        if config.observability.metrics_enabled {
            builder.metrics_sink(Arc::new(FacadeMetricsSink))
        } else {
            builder
        }
    }

    /// Sets the edge configuration
    pub fn config(mut self, config: EdgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the rate limiter configuration
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    /// Sets the configuration used for every provider's breaker
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Registers a provider
    pub fn provider(mut self, provider: Arc<dyn ProviderClient>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Adds a metrics sink in addition to the built-in counters
    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Validates configuration and builds the manager
    pub fn build(self) -> Result<EdgeCacheManager> {
        self.config.validate()?;

        let mut seen = HashSet::new();
        let mut providers = Vec::with_capacity(self.providers.len());
        for client in self.providers {
            let name = client.name().to_string();
            if !seen.insert(name.clone()) {
                return Err(CacheMeshError::InvalidConfig {
                    field: "edge.providers".to_string(),
                    reason: format!("duplicate provider name '{}'", name),
                });
            }
            let breaker = CircuitBreaker::new(name, self.circuit_breaker.clone())?;
            providers.push(ProviderSlot { client, breaker });
        }

        let rate_limiter = if self.rate_limit.enabled {
            Some(TokenBucket::from_config("edge-purge", &self.rate_limit)?)
        } else {
            None
        };

        tracing::info!(
            providers = providers.len(),
            rate_limited = rate_limiter.is_some(),
            "Edge cache manager initialized"
        );

        Ok(EdgeCacheManager {
            concurrency: Semaphore::new(self.config.max_concurrency),
            config: self.config,
            providers,
            rate_limiter,
            metrics: Arc::new(EdgeMetrics::new()),
            sinks: self.sinks,
        })
    }
}
