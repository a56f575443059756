//! Common test utilities for integration tests.

use async_trait::async_trait;
use cachemesh::edge::{ProviderClient, ProviderStats, PurgeOperation, PurgeResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Tracks how many calls are in flight at once.
#[derive(Debug, Default)]
pub struct ConcurrencyTracker {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyTracker {
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Scriptable in-memory edge provider.
pub struct MockProvider {
    name: String,
    cost: f64,
    healthy: AtomicBool,
    failing: AtomicBool,
    delay: Duration,
    calls: Mutex<Vec<(PurgeOperation, String)>>,
    tracker: Option<Arc<ConcurrencyTracker>>,
    stats: ProviderStats,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cost: 0.01,
            healthy: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            tracker: None,
            stats: ProviderStats {
                provider: name.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn unhealthy(self) -> Self {
        self.healthy.store(false, Ordering::SeqCst);
        self
    }

    pub fn failing(self) -> Self {
        self.failing.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<ConcurrencyTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_stats(mut self, stats: ProviderStats) -> Self {
        self.stats = stats;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Targets of every purge received, in arrival order.
    pub fn calls(&self) -> Vec<(PurgeOperation, String)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    async fn handle(&self, operation: PurgeOperation, target: &str) -> PurgeResult {
        self.calls.lock().push((operation, target.to_string()));
        if let Some(tracker) = &self.tracker {
            tracker.enter();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(tracker) = &self.tracker {
            tracker.exit();
        }

        if self.failing.load(Ordering::SeqCst) {
            PurgeResult::failure(&self.name, operation, "upstream returned 503", self.delay)
        } else {
            PurgeResult::success(&self.name, operation, 1, self.cost, self.delay)
        }
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn cost_per_operation(&self) -> f64 {
        self.cost
    }

    async fn purge_url(&self, url: &str) -> PurgeResult {
        self.handle(PurgeOperation::PurgeUrl, url).await
    }

    async fn purge_by_tag(&self, tag: &str) -> PurgeResult {
        self.handle(PurgeOperation::PurgeTag, tag).await
    }

    async fn purge_all(&self) -> PurgeResult {
        self.handle(PurgeOperation::PurgeAll, "*").await
    }

    async fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn statistics(&self) -> ProviderStats {
        self.stats.clone()
    }
}
