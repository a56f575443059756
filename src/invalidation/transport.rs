// Pub/Sub Transport

use crate::error::{CacheMeshError, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Stream of raw payloads received on a channel
pub type Subscription = BoxStream<'static, String>;

/// Shared channel connecting every instance of the service
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Sends a payload to every subscriber of `channel`, including the sender
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Subscribes to `channel`. The stream ends when the transport goes away.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Transport over tokio broadcast channels, for instances sharing a process
pub struct InProcessTransport {
    buffer_size: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl InProcessTransport {
    /// Creates a transport; each subscriber buffers up to `buffer_size` payloads
    pub fn new(buffer_size: usize) -> Result<Self> {
        if buffer_size == 0 {
            return Err(CacheMeshError::InvalidConfig {
                field: "invalidation.buffer_size".to_string(),
                reason: "Buffer size must be non-zero".to_string(),
            });
        }
        Ok(Self {
            buffer_size,
            channels: Mutex::new(HashMap::new()),
        })
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer_size).0)
            .clone()
    }

    /// Current subscriber count of a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

#[async_trait]
impl PubSubTransport for InProcessTransport {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        // No subscribers is not an error: nobody needs to evict
        let delivered = self.sender(channel).send(payload).unwrap_or(0);
        tracing::trace!(channel, delivered, "Published payload");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let rx = self.sender(channel).subscribe();
        let channel = channel.to_string();

        let stream = stream::unfold((rx, channel), |(mut rx, channel)| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, (rx, channel))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(channel = %channel, skipped, "Invalidation subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream.boxed())
    }
}
