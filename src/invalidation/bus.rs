// Cross-Instance Invalidation Bus

use super::message::{InvalidationMessage, MessageType};
use super::transport::PubSubTransport;
use crate::error::Result;
use crate::shutdown::ShutdownCoordinator;
use crate::store::{InMemoryStore, KeyValueStore};
use async_trait::async_trait;
use futures::StreamExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Local-only eviction, applied when a peer's invalidation arrives.
///
/// Implementations must only touch this instance's cache layers; they never
/// publish, so received messages cannot echo around the cluster.
#[async_trait]
pub trait LocalEvictor: Send + Sync {
    /// Evicts one key
    async fn evict_local(&self, key: &str) -> Result<()>;

    /// Evicts every entry carrying any of `tags`
    async fn evict_local_by_tags(&self, tags: &[String]) -> Result<()>;

    /// Evicts everything
    async fn evict_local_all(&self) -> Result<()>;
}

/// Evicts from an in-process store
pub struct StoreEvictor {
    store: Arc<InMemoryStore>,
}

impl StoreEvictor {
    pub fn new(store: Arc<InMemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LocalEvictor for StoreEvictor {
    async fn evict_local(&self, key: &str) -> Result<()> {
        self.store.evict(key).await?;
        Ok(())
    }

    async fn evict_local_by_tags(&self, tags: &[String]) -> Result<()> {
        self.store.evict_by_tags(tags).await?;
        Ok(())
    }

    async fn evict_local_all(&self) -> Result<()> {
        self.store.evict_all().await
    }
}

/// What happened to a received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Published by this instance; dropped
    SelfEcho,
    /// Applied locally with this many evictor calls
    Applied { evictions: usize },
}

#[derive(Debug, Default)]
struct BusCounters {
    published: AtomicU64,
    received: AtomicU64,
    self_echo_dropped: AtomicU64,
    applied: AtomicU64,
    malformed: AtomicU64,
    failed: AtomicU64,
}

/// Bus statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub published: u64,
    pub received: u64,
    pub self_echo_dropped: u64,
    pub applied: u64,
    pub malformed: u64,
    pub failed: u64,
}

/// Publishes this instance's invalidations and applies its peers'.
pub struct InvalidationBus {
    instance_id: String,
    channel: String,
    transport: Arc<dyn PubSubTransport>,
    evictor: Arc<dyn LocalEvictor>,
    counters: BusCounters,
}

impl InvalidationBus {
    /// Creates a bus with a fresh random instance id
    pub fn new(
        channel: impl Into<String>,
        transport: Arc<dyn PubSubTransport>,
        evictor: Arc<dyn LocalEvictor>,
    ) -> Self {
        Self::with_instance_id(uuid::Uuid::new_v4().to_string(), channel, transport, evictor)
    }

    /// Creates a bus with a fixed instance id
    pub fn with_instance_id(
        instance_id: impl Into<String>,
        channel: impl Into<String>,
        transport: Arc<dyn PubSubTransport>,
        evictor: Arc<dyn LocalEvictor>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            channel: channel.into(),
            transport,
            evictor,
            counters: BusCounters::default(),
        }
    }

    /// This instance's id, stamped on every published message
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Channel this bus publishes and listens on
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publishes an invalidation to every peer
    pub async fn publish(
        &self,
        message_type: MessageType,
        keys: Vec<String>,
        tags: Vec<String>,
    ) -> Result<()> {
        let message = InvalidationMessage::new(message_type, keys, tags, self.instance_id.as_str());
        let payload = message.to_json()?;
        self.transport.publish(&self.channel, payload).await?;

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        counter!("cachemesh_invalidation_published_total", "type" => message_type.to_string())
            .increment(1);
        tracing::debug!(
            channel = %self.channel,
            message_type = %message_type,
            keys = message.keys.len(),
            tags = message.tags.len(),
            "Published invalidation"
        );
        Ok(())
    }

    /// Publishes an eviction of `keys`
    pub async fn publish_evict(&self, keys: Vec<String>) -> Result<()> {
        self.publish(MessageType::Evict, keys, Vec::new()).await
    }

    /// Publishes an eviction of everything tagged with any of `tags`
    pub async fn publish_evict_by_tags(&self, tags: Vec<String>) -> Result<()> {
        self.publish(MessageType::EvictByTags, Vec::new(), tags).await
    }

    /// Publishes a full eviction
    pub async fn publish_evict_all(&self) -> Result<()> {
        self.publish(MessageType::EvictAll, Vec::new(), Vec::new()).await
    }

    /// Handles one raw payload from the channel.
    ///
    /// Messages this instance published are dropped. Everything else goes to
    /// [`dispatch`], which only sees the local evictor and so cannot publish.
    pub async fn on_message(&self, raw: &str) -> Result<Delivery> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let message = match InvalidationMessage::from_json(raw) {
            Ok(message) => message,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                counter!("cachemesh_invalidation_received_total", "outcome" => "malformed")
                    .increment(1);
                tracing::warn!(error = %e, "Dropping malformed invalidation message");
                return Err(e);
            }
        };

        if message.origin_instance_id == self.instance_id {
            self.counters.self_echo_dropped.fetch_add(1, Ordering::Relaxed);
            counter!("cachemesh_invalidation_received_total", "outcome" => "self_echo").increment(1);
            return Ok(Delivery::SelfEcho);
        }

        match dispatch(self.evictor.as_ref(), &message).await {
            Ok(evictions) => {
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
                counter!("cachemesh_invalidation_received_total", "outcome" => "applied")
                    .increment(1);
                tracing::debug!(
                    origin = %message.origin_instance_id,
                    message_type = %message.message_type,
                    evictions,
                    "Applied peer invalidation"
                );
                Ok(Delivery::Applied { evictions })
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                counter!("cachemesh_invalidation_received_total", "outcome" => "failed")
                    .increment(1);
                Err(e)
            }
        }
    }

    /// Subscribes and applies incoming messages until `shutdown` fires or the
    /// subscription ends
    pub async fn start(self: Arc<Self>, shutdown: ShutdownCoordinator) -> Result<JoinHandle<()>> {
        let mut subscription = self.transport.subscribe(&self.channel).await?;
        tracing::info!(
            channel = %self.channel,
            instance_id = %self.instance_id,
            "Invalidation listener started"
        );

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    payload = subscription.next() => {
                        let Some(payload) = payload else {
                            tracing::info!(channel = %self.channel, "Invalidation subscription closed");
                            break;
                        };
                        if let Err(e) = self.on_message(&payload).await {
                            tracing::warn!(error = %e, "Failed to apply invalidation");
                        }
                    }
                    _ = shutdown.wait_for_shutdown() => {
                        tracing::info!(channel = %self.channel, "Invalidation listener stopping");
                        break;
                    }
                }
            }
        }))
    }

    /// Gets statistics
    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            self_echo_dropped: self.counters.self_echo_dropped.load(Ordering::Relaxed),
            applied: self.counters.applied.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

/// Applies a peer's message to the local cache only. Returns the number of
/// evictor calls made.
async fn dispatch(evictor: &dyn LocalEvictor, message: &InvalidationMessage) -> Result<usize> {
    match message.message_type {
        MessageType::Evict => {
            for key in &message.keys {
                evictor.evict_local(key).await?;
            }
            Ok(message.keys.len())
        }
        MessageType::EvictByTags => {
            if message.tags.is_empty() {
                return Ok(0);
            }
            evictor.evict_local_by_tags(&message.tags).await?;
            Ok(1)
        }
        MessageType::EvictAll => {
            evictor.evict_local_all().await?;
            Ok(1)
        }
    }
}
