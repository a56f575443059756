// Edge Purge Metrics

use super::provider::PurgeResult;
use metrics::{counter, gauge, histogram};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// Destination for per-result purge metrics.
///
/// The manager records every [`PurgeResult`] it yields into each registered
/// sink; sinks must be cheap and non-blocking.
pub trait MetricsSink: Send + Sync {
    /// Records one purge result
    fn record_purge(&self, result: &PurgeResult);
}

/// f64 accumulator on top of an `AtomicU64` bit pattern
#[derive(Debug, Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn add(&self, value: f64) {
        let _ = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
            Some((f64::from_bits(bits) + value).to_bits())
        });
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }
}

/// Running counters for one scope (global or one provider)
#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    purged: AtomicU64,
    cost: AtomicF64,
    latency_sum_us: AtomicU64,
}

impl Counters {
    fn record(&self, result: &PurgeResult) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if result.success {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure.fetch_add(1, Ordering::Relaxed);
        }
        self.purged.fetch_add(result.purged_count, Ordering::Relaxed);
        self.cost.add(result.cost);
        self.latency_sum_us
            .fetch_add(result.latency.as_micros() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ProviderMetrics {
        let total = self.total.load(Ordering::Relaxed);
        let latency_sum_us = self.latency_sum_us.load(Ordering::Relaxed);
        ProviderMetrics {
            total_operations: total,
            successful_operations: self.success.load(Ordering::Relaxed),
            failed_operations: self.failure.load(Ordering::Relaxed),
            purged_objects: self.purged.load(Ordering::Relaxed),
            total_cost: self.cost.load(),
            average_latency_ms: if total == 0 {
                None
            } else {
                Some(latency_sum_us as f64 / total as f64 / 1000.0)
            },
        }
    }
}

/// In-process purge metrics backing `EdgeCacheManager::get_metrics`
#[derive(Debug, Default)]
pub struct EdgeMetrics {
    overall: Counters,
    rate_limited: AtomicU64,
    per_provider: RwLock<HashMap<String, Counters>>,
}

impl EdgeMetrics {
    /// Creates empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a consistent-enough snapshot for reporting
    pub fn snapshot(&self) -> MetricsSnapshot {
        let overall = self.overall.snapshot();
        let per_provider = self
            .per_provider
            .read()
            .iter()
            .map(|(name, counters)| (name.clone(), counters.snapshot()))
            .collect();

        MetricsSnapshot {
            total_operations: overall.total_operations,
            successful_operations: overall.successful_operations,
            failed_operations: overall.failed_operations,
            rate_limited_operations: self.rate_limited.load(Ordering::Relaxed),
            purged_objects: overall.purged_objects,
            total_cost: overall.total_cost,
            average_latency_ms: overall.average_latency_ms,
            per_provider,
        }
    }
}

impl MetricsSink for EdgeMetrics {
    fn record_purge(&self, result: &PurgeResult) {
        self.overall.record(result);

        if result.is_rate_limited() {
            self.rate_limited.fetch_add(1, Ordering::Relaxed);
            return;
        }

        {
            let providers = self.per_provider.read();
            if let Some(counters) = providers.get(&result.provider) {
                counters.record(result);
                return;
            }
        }

        let mut providers = self.per_provider.write();
        providers
            .entry(result.provider.clone())
            .or_default()
            .record(result);
    }
}

/// Forwards purge results to the `metrics` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeMetricsSink;

impl MetricsSink for FacadeMetricsSink {
    fn record_purge(&self, result: &PurgeResult) {
        let outcome = if result.success { "success" } else { "failure" };
        counter!(
            "cachemesh_edge_purges_total",
            "provider" => result.provider.clone(),
            "operation" => result.operation.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        counter!("cachemesh_edge_purged_objects_total", "provider" => result.provider.clone())
            .increment(result.purged_count);
        gauge!("cachemesh_edge_purge_cost_total", "provider" => result.provider.clone())
            .increment(result.cost);
        histogram!("cachemesh_edge_purge_latency_seconds", "provider" => result.provider.clone())
            .record(result.latency.as_secs_f64());
    }
}

/// Counters for one provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetrics {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub purged_objects: u64,
    pub total_cost: f64,
    pub average_latency_ms: Option<f64>,
}

/// Metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub rate_limited_operations: u64,
    pub purged_objects: u64,
    pub total_cost: f64,
    pub average_latency_ms: Option<f64>,
    pub per_provider: BTreeMap<String, ProviderMetrics>,
}

impl MetricsSnapshot {
    /// Fraction of operations that succeeded
    pub fn success_rate(&self) -> Option<f64> {
        if self.total_operations == 0 {
            None
        } else {
            Some(self.successful_operations as f64 / self.total_operations as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::provider::PurgeOperation;
    use std::time::Duration;

    #[test]
    fn test_records_totals_and_mean_latency() {
        let metrics = EdgeMetrics::new();
        metrics.record_purge(&PurgeResult::success(
            "fastly",
            PurgeOperation::PurgeUrl,
            1,
            0.5,
            Duration::from_millis(10),
        ));
        metrics.record_purge(&PurgeResult::failure(
            "fastly",
            PurgeOperation::PurgeUrl,
            "timeout",
            Duration::from_millis(30),
        ));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_operations, 2);
        assert_eq!(snapshot.successful_operations, 1);
        assert_eq!(snapshot.failed_operations, 1);
        assert_eq!(snapshot.total_cost, 0.5);
        assert_eq!(snapshot.average_latency_ms, Some(20.0));
        assert_eq!(snapshot.success_rate(), Some(0.5));
        assert_eq!(snapshot.per_provider["fastly"].total_operations, 2);
    }

    #[test]
    fn test_rate_limited_not_attributed_to_provider() {
        let metrics = EdgeMetrics::new();
        metrics.record_purge(&PurgeResult::rate_limited(PurgeOperation::PurgeAll));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_operations, 1);
        assert_eq!(snapshot.failed_operations, 1);
        assert_eq!(snapshot.rate_limited_operations, 1);
        assert!(snapshot.per_provider.is_empty());
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = EdgeMetrics::new().snapshot();
        assert_eq!(snapshot.average_latency_ms, None);
        assert_eq!(snapshot.success_rate(), None);
    }

    #[test]
    fn test_facade_sink_without_recorder() {
        // No recorder installed: the facade must be a no-op
        FacadeMetricsSink.record_purge(&PurgeResult::rate_limited(PurgeOperation::PurgeUrl));
    }
}
