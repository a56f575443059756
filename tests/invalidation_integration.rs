//! Cross-instance invalidation integration tests
//!
//! Several buses share one in-process transport, each evicting its own store,
//! the way separate service instances share a pub/sub channel.

use cachemesh::invalidation::{InProcessTransport, InvalidationBus, StoreEvictor};
use cachemesh::shutdown::ShutdownCoordinator;
use cachemesh::store::{InMemoryStore, KeyValueStore};
use std::sync::Arc;
use std::time::Duration;

const CHANNEL: &str = "cachemesh-invalidation";

struct Instance {
    store: Arc<InMemoryStore>,
    bus: Arc<InvalidationBus>,
}

async fn instance(id: &str, transport: &Arc<InProcessTransport>, shutdown: &ShutdownCoordinator) -> Instance {
    let store = Arc::new(InMemoryStore::default());
    let bus = Arc::new(InvalidationBus::with_instance_id(
        id,
        CHANNEL,
        transport.clone(),
        Arc::new(StoreEvictor::new(store.clone())),
    ));
    bus.clone().start(shutdown.clone()).await.unwrap();
    Instance { store, bus }
}

/// Waits until every bus has received `count` messages.
async fn settle(instances: &[&Instance], count: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while instances.iter().any(|i| i.bus.stats().received < count) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("messages were not delivered in time");
}

#[tokio::test]
async fn test_evict_reaches_peers_only() {
    let transport = Arc::new(InProcessTransport::new(64).unwrap());
    let shutdown = ShutdownCoordinator::new();
    let a = instance("a", &transport, &shutdown).await;
    let b = instance("b", &transport, &shutdown).await;
    let c = instance("c", &transport, &shutdown).await;

    for node in [&a, &b, &c] {
        node.store.put("user:1", b"alice".to_vec(), 0).await.unwrap();
        node.store.put("user:2", b"bob".to_vec(), 0).await.unwrap();
    }

    // The publisher evicts locally itself; the bus only tells the others
    a.store.evict("user:1").await.unwrap();
    a.bus.publish_evict(vec!["user:1".to_string()]).await.unwrap();
    settle(&[&a, &b, &c], 1).await;

    for node in [&a, &b, &c] {
        assert_eq!(node.store.get("user:1").await.unwrap(), None);
        assert!(node.store.get("user:2").await.unwrap().is_some());
    }

    let a_stats = a.bus.stats();
    assert_eq!(a_stats.published, 1);
    assert_eq!(a_stats.self_echo_dropped, 1);
    assert_eq!(a_stats.applied, 0);

    // Receivers never republish
    assert_eq!(b.bus.stats().published, 0);
    assert_eq!(b.bus.stats().applied, 1);
    assert_eq!(c.bus.stats().published, 0);

    shutdown.shutdown();
}

#[tokio::test]
async fn test_tag_and_full_eviction() {
    let transport = Arc::new(InProcessTransport::new(64).unwrap());
    let shutdown = ShutdownCoordinator::new();
    let a = instance("a", &transport, &shutdown).await;
    let b = instance("b", &transport, &shutdown).await;

    b.store
        .put_with_tags("p:1", vec![1], 0, ["product"])
        .await
        .unwrap();
    b.store.put_with_tags("u:1", vec![2], 0, ["user"]).await.unwrap();

    a.bus.publish_evict_by_tags(vec!["product".to_string()]).await.unwrap();
    settle(&[&b], 1).await;
    assert_eq!(b.store.keys().await.unwrap(), vec!["u:1".to_string()]);

    a.bus.publish_evict_all().await.unwrap();
    settle(&[&b], 2).await;
    assert_eq!(b.store.size().await.unwrap(), 0);

    shutdown.shutdown();
}

#[tokio::test]
async fn test_malformed_payload_does_not_stop_listener() {
    use cachemesh::invalidation::PubSubTransport;

    let transport = Arc::new(InProcessTransport::new(64).unwrap());
    let shutdown = ShutdownCoordinator::new();
    let a = instance("a", &transport, &shutdown).await;
    let b = instance("b", &transport, &shutdown).await;
    b.store.put("k", vec![1], 0).await.unwrap();

    transport.publish(CHANNEL, "{not json".to_string()).await.unwrap();
    a.bus.publish_evict(vec!["k".to_string()]).await.unwrap();
    settle(&[&b], 2).await;

    assert_eq!(b.bus.stats().malformed, 1);
    assert_eq!(b.store.get("k").await.unwrap(), None);

    shutdown.shutdown();
}

#[tokio::test]
async fn test_listener_stops_on_shutdown() {
    let transport = Arc::new(InProcessTransport::new(8).unwrap());
    let shutdown = ShutdownCoordinator::new();
    let store = Arc::new(InMemoryStore::default());
    let bus = Arc::new(InvalidationBus::new(
        CHANNEL,
        transport.clone(),
        Arc::new(StoreEvictor::new(store)),
    ));

    let handle = bus.start(shutdown.clone()).await.unwrap();
    assert_eq!(transport.subscriber_count(CHANNEL), 1);

    shutdown.shutdown();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transport.subscriber_count(CHANNEL), 0);
}
