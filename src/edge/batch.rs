//! Time-windowed batching of URL purges.
//!
//! URLs submitted to a [`PurgeBatcher`] are grouped before being sent to the
//! edge manager:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Purge Batcher                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  1. URLs arrive and are queued                               │
//! │  2. A batch closes when it reaches batch_size, or when       │
//! │     batch_timeout has passed since its first URL             │
//! │  3. The batch is purged through EdgeCacheManager             │
//! │  4. Results are handed back to each submitter                │
//! │  5. On shutdown, queued URLs are drained before exit         │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use super::manager::EdgeCacheManager;
use super::provider::PurgeResult;
use crate::error::{CacheMeshError, Result};
use crate::shutdown::ShutdownCoordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// A queued URL and, optionally, the submitter waiting for its results.
#[derive(Debug)]
struct BatchItem {
    url: String,
    response_tx: Option<oneshot::Sender<Vec<PurgeResult>>>,
}

/// Statistics for batching operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchStats {
    /// URLs purged.
    pub total_urls: u64,
    /// Batches processed.
    pub total_batches: u64,
    /// Batches closed because they were full.
    pub full_batches: u64,
    /// Batches closed by the timeout window.
    pub timed_out_batches: u64,
    /// Batches drained during shutdown.
    pub drained_batches: u64,
}

impl BatchStats {
    /// Average URLs per batch.
    pub fn avg_batch_size(&self) -> f64 {
        if self.total_batches == 0 {
            return 0.0;
        }
        self.total_urls as f64 / self.total_batches as f64
    }
}

/// Why a batch was closed.
#[derive(Debug, Clone, Copy)]
enum Flush {
    Full,
    Timeout,
    Drain,
}

/// Background URL batcher in front of an [`EdgeCacheManager`].
pub struct PurgeBatcher {
    tx: mpsc::Sender<BatchItem>,
    handle: JoinHandle<BatchStats>,
}

impl PurgeBatcher {
    /// Spawn the batcher task. It stops when `shutdown` fires or when
    /// [`PurgeBatcher::shutdown`] is called, flushing queued URLs either way.
    pub fn spawn(manager: Arc<EdgeCacheManager>, shutdown: ShutdownCoordinator) -> Self {
        let capacity = manager.config().batch_size.saturating_mul(16).max(64);
        let (tx, rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(run_batcher(manager, rx, shutdown));
        Self { tx, handle }
    }

    /// Queue a URL without waiting for its results.
    pub async fn submit(&self, url: impl Into<String>) -> Result<()> {
        self.tx
            .send(BatchItem {
                url: url.into(),
                response_tx: None,
            })
            .await
            .map_err(|_| CacheMeshError::Internal("Purge batcher stopped".to_string()))
    }

    /// Queue a URL and wait until its batch has been purged.
    pub async fn submit_and_wait(&self, url: impl Into<String>) -> Result<Vec<PurgeResult>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(BatchItem {
                url: url.into(),
                response_tx: Some(response_tx),
            })
            .await
            .map_err(|_| CacheMeshError::Internal("Purge batcher stopped".to_string()))?;

        response_rx
            .await
            .map_err(|_| CacheMeshError::Internal("Response channel closed".to_string()))
    }

    /// Stop accepting URLs, drain everything queued and return final stats.
    pub async fn shutdown(self) -> Result<BatchStats> {
        drop(self.tx);
        self.handle
            .await
            .map_err(|e| CacheMeshError::Internal(format!("Purge batcher panicked: {}", e)))
    }
}

/// Run the batcher loop.
async fn run_batcher(
    manager: Arc<EdgeCacheManager>,
    mut rx: mpsc::Receiver<BatchItem>,
    shutdown: ShutdownCoordinator,
) -> BatchStats {
    let batch_size = manager.config().batch_size;
    let window = manager.config().batch_timeout;
    let mut stats = BatchStats::default();
    let mut batch: Vec<BatchItem> = Vec::with_capacity(batch_size);
    let mut first_item: Option<Instant> = None;

    loop {
        let deadline = match first_item {
            Some(started) => started + window,
            // Long timeout when empty
            None => Instant::now() + Duration::from_secs(3600),
        };

        tokio::select! {
            item = rx.recv() => {
                match item {
                    Some(item) => {
                        if batch.is_empty() {
                            first_item = Some(Instant::now());
                        }
                        batch.push(item);

                        if batch.len() >= batch_size {
                            process_batch(&manager, &mut batch, &mut stats, Flush::Full).await;
                            first_item = None;
                        }
                    }
                    None => {
                        // Channel closed, process remaining
                        drain(&manager, &mut rx, &mut batch, &mut stats).await;
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline), if first_item.is_some() => {
                process_batch(&manager, &mut batch, &mut stats, Flush::Timeout).await;
                first_item = None;
            }
            _ = shutdown.wait_for_shutdown() => {
                info!("Purge batcher draining for shutdown");
                rx.close();
                drain(&manager, &mut rx, &mut batch, &mut stats).await;
                break;
            }
        }
    }

    info!(
        batches = stats.total_batches,
        urls = stats.total_urls,
        "Purge batcher stopped"
    );
    stats
}

/// Flush the open batch and everything still buffered in the channel.
async fn drain(
    manager: &EdgeCacheManager,
    rx: &mut mpsc::Receiver<BatchItem>,
    batch: &mut Vec<BatchItem>,
    stats: &mut BatchStats,
) {
    let batch_size = manager.config().batch_size;
    while let Ok(item) = rx.try_recv() {
        batch.push(item);
        if batch.len() >= batch_size {
            process_batch(manager, batch, stats, Flush::Drain).await;
        }
    }
    process_batch(manager, batch, stats, Flush::Drain).await;
}

/// Process a batch of URLs.
async fn process_batch(
    manager: &EdgeCacheManager,
    batch: &mut Vec<BatchItem>,
    stats: &mut BatchStats,
    reason: Flush,
) {
    let items = std::mem::take(batch);
    if items.is_empty() {
        return;
    }

    debug!(batch_size = items.len(), reason = ?reason, "Flushing purge batch");

    let results = futures::future::join_all(
        items.iter().map(|item| manager.purge_url(&item.url)),
    )
    .await;

    stats.total_batches += 1;
    stats.total_urls += items.len() as u64;
    match reason {
        Flush::Full => stats.full_batches += 1,
        Flush::Timeout => stats.timed_out_batches += 1,
        Flush::Drain => stats.drained_batches += 1,
    }

    for (item, results) in items.into_iter().zip(results) {
        if let Some(tx) = item.response_tx {
            let _ = tx.send(results);
        }
    }
}
