//! Edge cache manager integration tests
//!
//! Drives the manager through scripted providers: fan-out, admission control,
//! circuit breaking, concurrency limits and batching.

#[allow(dead_code)]
mod common;

use cachemesh::edge::{EdgeCacheManager, EdgeConfig, ProviderStats, PurgeBatcher, PurgeOperation};
use cachemesh::ratelimit::RateLimitConfig;
use cachemesh::resilience::{CircuitBreakerConfig, CircuitState};
use cachemesh::shutdown::ShutdownCoordinator;
use common::{ConcurrencyTracker, MockProvider};
use std::sync::Arc;
use std::time::Duration;

fn no_rate_limit() -> RateLimitConfig {
    RateLimitConfig::disabled()
}

// =============================================================================
// Fan-out
// =============================================================================

#[tokio::test]
async fn test_purge_skips_unhealthy_providers() {
    let cloudfront = Arc::new(MockProvider::new("cloudfront"));
    let fastly = Arc::new(MockProvider::new("fastly"));
    let akamai = Arc::new(MockProvider::new("akamai").unhealthy());

    let manager = EdgeCacheManager::builder()
        .rate_limit(no_rate_limit())
        .provider(cloudfront.clone())
        .provider(fastly.clone())
        .provider(akamai.clone())
        .build()
        .unwrap();

    let mut results = manager.purge_url("https://example.com/a").await;
    results.sort_by(|a, b| a.provider.cmp(&b.provider));

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].provider, "cloudfront");
    assert_eq!(results[1].provider, "fastly");
    assert!(results.iter().all(|r| r.success));
    assert_eq!(akamai.call_count(), 0);

    let health = manager.get_health_status().await;
    assert_eq!(health.get("akamai"), Some(&false));
    assert_eq!(health.get("fastly"), Some(&true));
}

#[tokio::test]
async fn test_one_failing_provider_does_not_abort_others() {
    let good = Arc::new(MockProvider::new("good"));
    let bad = Arc::new(MockProvider::new("bad").failing());

    let manager = EdgeCacheManager::builder()
        .rate_limit(no_rate_limit())
        .provider(good.clone())
        .provider(bad.clone())
        .build()
        .unwrap();

    let results = manager.purge_by_tag("product").await;
    assert_eq!(results.len(), 2);

    let failed: Vec<_> = results.iter().filter(|r| !r.success).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].provider, "bad");
    assert_eq!(failed[0].error.as_deref(), Some("upstream returned 503"));
    assert_eq!(good.calls(), vec![(PurgeOperation::PurgeTag, "product".to_string())]);

    let metrics = manager.get_metrics();
    assert_eq!(metrics.total_operations, 2);
    assert_eq!(metrics.failed_operations, 1);
}

#[tokio::test]
async fn test_no_providers_yields_no_results() {
    let manager = EdgeCacheManager::builder()
        .rate_limit(no_rate_limit())
        .build()
        .unwrap();
    assert!(manager.purge_all().await.is_empty());
}

// =============================================================================
// Admission control
// =============================================================================

#[tokio::test]
async fn test_rate_limiter_burst() {
    let provider = Arc::new(MockProvider::new("cdn"));
    let manager = EdgeCacheManager::builder()
        .rate_limit(RateLimitConfig {
            capacity: 2.0,
            refill_rate_per_second: 0.0,
            enabled: true,
        })
        .provider(provider.clone())
        .build()
        .unwrap();

    let mut outcomes = Vec::new();
    for i in 0..3 {
        let results = manager.purge_url(&format!("/page/{}", i)).await;
        outcomes.push(results.iter().all(|r| r.success));
    }

    assert_eq!(outcomes, vec![true, true, false]);
    assert_eq!(provider.call_count(), 2);

    let rejected = manager.purge_url("/page/3").await;
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].is_rate_limited());

    let status = manager.get_rate_limiter_status().unwrap();
    assert_eq!(status.admitted, 2);
    assert_eq!(status.rejected, 2);
    assert_eq!(status.time_until_next_token_ms, None);
    assert_eq!(manager.get_metrics().rate_limited_operations, 2);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_and_recovers() {
    let provider = Arc::new(MockProvider::new("cdn").failing());
    let manager = EdgeCacheManager::builder()
        .rate_limit(no_rate_limit())
        .circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        })
        .provider(provider.clone())
        .build()
        .unwrap();

    for _ in 0..3 {
        let results = manager.purge_url("/x").await;
        assert!(!results[0].success);
    }
    assert_eq!(
        manager.get_circuit_breaker_status()["cdn"].state,
        CircuitState::Open
    );

    // Short-circuited: reported as a failure without reaching the provider
    let results = manager.purge_url("/x").await;
    assert_eq!(results.len(), 1);
    assert!(!results[0].success);
    assert_eq!(provider.call_count(), 3);

    provider.set_failing(false);
    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(
        manager.get_circuit_breaker_status()["cdn"].state,
        CircuitState::HalfOpen
    );

    let results = manager.purge_url("/x").await;
    assert!(results[0].success);
    assert_eq!(
        manager.get_circuit_breaker_status()["cdn"].state,
        CircuitState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn test_slow_provider_times_out() {
    let slow = Arc::new(MockProvider::new("slow").with_delay(Duration::from_secs(60)));
    let fast = Arc::new(MockProvider::new("fast"));
    let manager = EdgeCacheManager::builder()
        .config(EdgeConfig {
            provider_timeout: Duration::from_secs(1),
            ..Default::default()
        })
        .rate_limit(no_rate_limit())
        .provider(slow)
        .provider(fast)
        .build()
        .unwrap();

    let results = manager.purge_url("/x").await;
    assert_eq!(results.len(), 2);
    let slow_result = results.iter().find(|r| r.provider == "slow").unwrap();
    assert!(!slow_result.success);
    assert!(results.iter().any(|r| r.provider == "fast" && r.success));
}

// =============================================================================
// Concurrency and batching
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_max_concurrency_is_respected() {
    let tracker = Arc::new(ConcurrencyTracker::default());
    let provider = Arc::new(
        MockProvider::new("cdn")
            .with_delay(Duration::from_millis(20))
            .with_tracker(tracker.clone()),
    );
    let manager = EdgeCacheManager::builder()
        .config(EdgeConfig {
            max_concurrency: 2,
            ..Default::default()
        })
        .rate_limit(no_rate_limit())
        .provider(provider.clone())
        .build()
        .unwrap();

    let urls: Vec<String> = (0..8).map(|i| format!("/item/{}", i)).collect();
    let results = manager.purge_urls(urls).await;

    assert_eq!(results.len(), 8);
    assert!(results.iter().all(|r| r.success));
    assert_eq!(tracker.peak(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_purge_urls_chunks_by_batch_size() {
    let provider = Arc::new(MockProvider::new("cdn"));
    let manager = EdgeCacheManager::builder()
        .config(EdgeConfig {
            batch_size: 3,
            ..Default::default()
        })
        .rate_limit(no_rate_limit())
        .provider(provider.clone())
        .build()
        .unwrap();

    let results = manager.purge_urls((0..7).map(|i| format!("/p/{}", i))).await;
    assert_eq!(results.len(), 7);
    assert_eq!(provider.call_count(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_batcher_feeds_manager() {
    let provider = Arc::new(MockProvider::new("cdn"));
    let manager = Arc::new(
        EdgeCacheManager::builder()
            .config(EdgeConfig {
                batch_size: 4,
                batch_timeout: Duration::from_millis(50),
                ..Default::default()
            })
            .rate_limit(no_rate_limit())
            .provider(provider.clone())
            .build()
            .unwrap(),
    );

    let batcher = PurgeBatcher::spawn(manager.clone(), ShutdownCoordinator::new());
    for i in 0..6 {
        batcher.submit(format!("/b/{}", i)).await.unwrap();
    }
    let stats = batcher.shutdown().await.unwrap();

    assert_eq!(stats.total_urls, 6);
    assert_eq!(stats.full_batches, 1);
    assert_eq!(provider.call_count(), 6);
    assert_eq!(manager.get_metrics().successful_operations, 6);
}

// =============================================================================
// Statistics
// =============================================================================

#[tokio::test]
async fn test_aggregated_statistics() {
    let a = MockProvider::new("a").with_stats(ProviderStats {
        provider: "a".to_string(),
        total_requests: 100,
        successful_purges: 90,
        failed_purges: 10,
        total_cost: 1.5,
        average_latency_ms: 20.0,
        cache_hit_rate: 0.9,
    });
    let b = MockProvider::new("b").with_stats(ProviderStats {
        provider: "b".to_string(),
        total_requests: 300,
        successful_purges: 300,
        failed_purges: 0,
        total_cost: 0.5,
        average_latency_ms: f64::NAN,
        cache_hit_rate: 0.5,
    });

    let manager = EdgeCacheManager::builder()
        .provider(Arc::new(a))
        .provider(Arc::new(b))
        .build()
        .unwrap();

    let stats = manager.get_aggregated_statistics().await;
    assert_eq!(stats.providers_reporting, 2);
    assert_eq!(stats.total_requests, 400);
    assert_eq!(stats.failed_purges, 10);
    assert!((stats.total_cost - 2.0).abs() < 1e-9);
    assert_eq!(stats.average_latency_ms, Some(20.0));
    assert!((stats.cache_hit_rate.unwrap() - 0.7).abs() < 1e-9);
    assert!((stats.weighted_cache_hit_rate.unwrap() - 0.6).abs() < 1e-9);
}

#[test]
fn test_duplicate_provider_names_rejected() {
    let result = EdgeCacheManager::builder()
        .provider(Arc::new(MockProvider::new("cdn")))
        .provider(Arc::new(MockProvider::new("cdn")))
        .build();
    assert!(result.is_err());
}
