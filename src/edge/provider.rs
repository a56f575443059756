// Edge Provider Contract

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Kind of purge operation sent to a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurgeOperation {
    /// Purge a single URL
    PurgeUrl,
    /// Purge everything carrying a cache tag
    PurgeTag,
    /// Purge the whole edge cache
    PurgeAll,
}

impl fmt::Display for PurgeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PurgeUrl => write!(f, "purge_url"),
            Self::PurgeTag => write!(f, "purge_tag"),
            Self::PurgeAll => write!(f, "purge_all"),
        }
    }
}

/// Outcome of one purge operation against one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurgeResult {
    /// Provider name, or a synthetic marker such as `rate_limited`
    pub provider: String,
    /// Operation performed
    pub operation: PurgeOperation,
    /// Whether the provider accepted the purge
    pub success: bool,
    /// Number of objects purged
    pub purged_count: u64,
    /// Monetary cost charged by the provider
    pub cost: f64,
    /// Wall-clock latency of the call
    #[serde(with = "duration_millis")]
    pub latency: Duration,
    /// Error description for failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PurgeResult {
    /// Provider name used for results rejected by the rate limiter
    pub const RATE_LIMITED: &'static str = "rate_limited";

    /// Creates a success result; cost is `max(purged_count, 1) * cost_per_operation`
    pub fn success(
        provider: impl Into<String>,
        operation: PurgeOperation,
        purged_count: u64,
        cost_per_operation: f64,
        latency: Duration,
    ) -> Self {
        Self {
            provider: provider.into(),
            operation,
            success: true,
            purged_count,
            cost: purged_count.max(1) as f64 * cost_per_operation,
            latency,
            error: None,
        }
    }

    /// Creates a failure result; failures are not billed
    pub fn failure(
        provider: impl Into<String>,
        operation: PurgeOperation,
        error: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            provider: provider.into(),
            operation,
            success: false,
            purged_count: 0,
            cost: 0.0,
            latency,
            error: Some(error.into()),
        }
    }

    /// Creates the synthetic result returned when admission is refused
    pub fn rate_limited(operation: PurgeOperation) -> Self {
        Self::failure(
            Self::RATE_LIMITED,
            operation,
            "rate limit exceeded",
            Duration::ZERO,
        )
    }

    /// Checks if this is the synthetic rate limiter rejection
    pub fn is_rate_limited(&self) -> bool {
        self.provider == Self::RATE_LIMITED
    }
}

/// Statistics reported by a provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderStats {
    /// Provider name
    pub provider: String,
    /// Requests the provider has served
    pub total_requests: u64,
    /// Successful purges
    pub successful_purges: u64,
    /// Failed purges
    pub failed_purges: u64,
    /// Cost accumulated at the provider
    pub total_cost: f64,
    /// Mean latency in milliseconds; NaN when unknown
    pub average_latency_ms: f64,
    /// Edge cache hit rate in `[0, 1]`; NaN when unknown
    pub cache_hit_rate: f64,
}

/// Capability every edge cache vendor adapter implements.
///
/// Purge operations report ordinary remote failures through
/// [`PurgeResult::failure`] rather than panicking or blocking forever; the
/// manager additionally bounds each call with a timeout.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Unique provider name
    fn name(&self) -> &str;

    /// Cost charged per purged object
    fn cost_per_operation(&self) -> f64;

    /// Purges a single URL
    async fn purge_url(&self, url: &str) -> PurgeResult;

    /// Purges every object carrying `tag`
    async fn purge_by_tag(&self, tag: &str) -> PurgeResult;

    /// Purges the whole cache
    async fn purge_all(&self) -> PurgeResult;

    /// Reports whether the provider is reachable
    async fn is_healthy(&self) -> bool;

    /// Returns provider-side statistics
    async fn statistics(&self) -> ProviderStats;
}

/// Serde helper for latency as integer milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
