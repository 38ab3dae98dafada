//! Multi-node propagation scenarios over the in-memory broker

use cachesync::cache::{CacheManager, CacheStore};
use cachesync::config::PeerSection;
use cachesync::sync::broker::{Broker, MemoryBroker, MemoryBus};
use cachesync::sync::codec;
use cachesync::sync::{ConnectionState, InvalidationEvent, NodeIdentity};
use cachesync::{PropagationService, SyncConfig};
use std::sync::Arc;
use std::time::Duration;

/// Re-evaluate a condition until it holds or two seconds pass
macro_rules! eventually {
  ($check:expr) => {{
    let mut held = false;
    for _ in 0..200 {
      if $check {
        held = true;
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    held
  }};
}

struct Node {
  service: PropagationService,
  caches: Arc<CacheManager>,
  broker: Arc<MemoryBroker>,
}

impl Node {
  fn orders(&self) -> Arc<dyn CacheStore> {
    self.caches.cache("orders")
  }
}

fn node_config(node_id: &str, cluster: &str, peers: &[&str], relay_onward: bool) -> SyncConfig {
  let mut config = SyncConfig::default();
  config.node.id = node_id.into();
  config.node.cluster = cluster.into();
  config.broker.url = "memory://integration".into();
  config.broker.backoff_initial_ms = 10;
  config.broker.backoff_max_ms = 50;
  config.propagation.enabled = true;
  config.propagation.drain_timeout_ms = 500;
  config.propagation.relay_onward = relay_onward;
  config.topology.peers = peers
    .iter()
    .map(|p| PeerSection {
      id: p.to_string(),
      channel: None,
    })
    .collect();
  config
}

async fn start_node(bus: &Arc<MemoryBus>, config: SyncConfig) -> Node {
  let broker = Arc::new(MemoryBroker::with_client_id(bus.clone(), config.node.id.clone()));
  let caches = Arc::new(CacheManager::new());
  let service = PropagationService::new(config, caches.clone(), broker.clone());
  service.start().await.unwrap();
  assert!(service.wait_connected(Duration::from_secs(2)).await);

  let expected = service.subscription_channels().len();
  let id = broker.client_id().to_string();
  assert!(eventually!(bus.subscriptions(&id).len() == expected));

  Node {
    service,
    caches,
    broker,
  }
}

/// Connected raw handle for injecting hand-built events
async fn raw_publisher(bus: &Arc<MemoryBus>) -> MemoryBroker {
  let broker = MemoryBroker::new(bus.clone());
  broker.connect().await.unwrap();
  broker
}

async fn inject(broker: &MemoryBroker, channel: &str, event: &InvalidationEvent) {
  broker
    .publish(channel, codec::encode(event).unwrap())
    .await
    .unwrap();
}

// =============================================================================
// Single cluster
// =============================================================================

#[tokio::test]
async fn test_local_mutation_reaches_connected_peer() {
  let bus = MemoryBus::new("single-cluster");
  let a = start_node(&bus, node_config("a", "x", &[], false)).await;
  let b = start_node(&bus, node_config("b", "x", &[], false)).await;

  a.orders().put(b"42".to_vec(), b"v1".to_vec()).await;
  assert!(eventually!(b.orders().get(b"42").await == Some(b"v1".to_vec())));

  a.orders().remove(b"42").await;
  assert!(eventually!(!b.orders().contains(b"42").await));

  a.orders().put(b"7".to_vec(), b"x".to_vec()).await;
  assert!(eventually!(b.orders().contains(b"7").await));
  a.orders().clear_all().await;
  assert!(eventually!(b.orders().is_empty().await));

  a.service.stop().await;
  b.service.stop().await;
}

#[tokio::test]
async fn test_no_self_application_and_no_republish() {
  let bus = MemoryBus::new("self-loop");
  let a = start_node(&bus, node_config("a", "x", &[], false)).await;
  let b = start_node(&bus, node_config("b", "x", &[], false)).await;

  a.orders().put(b"k".to_vec(), b"v".to_vec()).await;
  assert!(eventually!(b.orders().contains(b"k").await));
  assert!(eventually!(a.service.health().consumer.self_originated == 1));

  // Let any loop show itself before counting
  tokio::time::sleep(Duration::from_millis(100)).await;

  let a_health = a.service.health();
  let b_health = b.service.health();
  assert_eq!(a_health.consumer.applied, 0);
  assert_eq!(a_health.producer.published, 1);
  assert_eq!(b_health.consumer.applied, 1);
  assert_eq!(b_health.consumer.self_originated, 0);
  // Remote application never re-publishes
  assert_eq!(b_health.producer.published, 0);
  assert_eq!(bus.published(), 1);

  a.service.stop().await;
  b.service.stop().await;
}

#[tokio::test]
async fn test_stale_sequence_leaves_newer_value() {
  let bus = MemoryBus::new("stale");
  let b = start_node(&bus, node_config("b", "x", &[], false)).await;
  let raw = raw_publisher(&bus).await;
  let origin = NodeIdentity::new("a", "x");

  let newer = InvalidationEvent::update(&origin, 5, "orders", b"k".to_vec(), b"five".to_vec());
  let older = InvalidationEvent::update(&origin, 3, "orders", b"k".to_vec(), b"three".to_vec());
  inject(&raw, "orders.x.invalidation", &newer).await;
  inject(&raw, "orders.x.invalidation", &older).await;

  assert!(eventually!(b.service.health().consumer.duplicates == 1));
  assert_eq!(b.orders().get(b"k").await, Some(b"five".to_vec()));
  assert_eq!(b.service.consumer().unwrap().watermark("a"), Some(5));

  b.service.stop().await;
}

#[tokio::test]
async fn test_clear_all_then_remove_is_noop() {
  let bus = MemoryBus::new("clear-all");
  let b = start_node(&bus, node_config("b", "x", &[], false)).await;
  let raw = raw_publisher(&bus).await;
  let origin = NodeIdentity::new("a", "x");

  b.orders().put(b"1".to_vec(), b"one".to_vec()).await;
  b.orders().put(b"2".to_vec(), b"two".to_vec()).await;

  inject(&raw, "orders.x.invalidation", &InvalidationEvent::clear_all(&origin, 1, "orders")).await;
  assert!(eventually!(b.orders().is_empty().await));

  let remove = InvalidationEvent::remove(&origin, 2, "orders", b"1".to_vec());
  inject(&raw, "orders.x.invalidation", &remove).await;
  assert!(eventually!(b.service.health().consumer.applied == 2));
  assert!(b.orders().is_empty().await);

  b.service.stop().await;
}

#[tokio::test]
async fn test_malformed_message_is_dropped() {
  let bus = MemoryBus::new("malformed");
  let b = start_node(&bus, node_config("b", "x", &[], false)).await;
  let raw = raw_publisher(&bus).await;

  raw
    .publish("orders.x.invalidation", vec![0xde, 0xad])
    .await
    .unwrap();
  assert!(eventually!(b.service.health().consumer.malformed == 1));

  // Delivery continues after a bad message
  let event = InvalidationEvent::remove(&NodeIdentity::new("a", "x"), 1, "orders", b"k".to_vec());
  inject(&raw, "orders.x.invalidation", &event).await;
  assert!(eventually!(b.service.health().consumer.applied == 1));

  b.service.stop().await;
}

// =============================================================================
// Reconnect
// =============================================================================

#[tokio::test]
async fn test_disconnected_peer_catches_up_after_reconnect() {
  let bus = MemoryBus::new("reconnect");
  let a = start_node(&bus, node_config("a", "x", &[], false)).await;
  let b = start_node(&bus, node_config("b", "x", &[], false)).await;

  b.broker.set_reachable(false);
  assert!(
    eventually!(b.service.connection_state() != ConnectionState::Connected)
  );

  a.orders().put(b"42".to_vec(), b"v1".to_vec()).await;
  assert!(eventually!(bus.backlog("b") == 1));
  assert!(!b.orders().contains(b"42").await);

  b.broker.set_reachable(true);
  assert!(b.service.wait_connected(Duration::from_secs(2)).await);
  assert!(eventually!(b.orders().get(b"42").await == Some(b"v1".to_vec())));

  a.orders().remove(b"42").await;
  assert!(eventually!(!b.orders().contains(b"42").await));

  a.service.stop().await;
  b.service.stop().await;
}

// =============================================================================
// Cross-cluster relay
// =============================================================================

#[tokio::test]
async fn test_three_clusters_apply_exactly_once() {
  let bus = MemoryBus::new("three-clusters");
  let x = start_node(&bus, node_config("x1", "x", &["y", "z"], true)).await;
  let y = start_node(&bus, node_config("y1", "y", &["x", "z"], true)).await;
  let z = start_node(&bus, node_config("z1", "z", &["x", "y"], true)).await;

  x.orders().put(b"42".to_vec(), b"v1".to_vec()).await;

  assert!(eventually!(y.orders().get(b"42").await == Some(b"v1".to_vec())));
  assert!(eventually!(z.orders().get(b"42").await == Some(b"v1".to_vec())));

  // y and z each got the event from x, so relaying it to each other is not
  // a send back to the arrival cluster; those copies land as duplicates
  assert!(eventually!(y.service.health().consumer.duplicates == 1));
  assert!(eventually!(z.service.health().consumer.duplicates == 1));
  tokio::time::sleep(Duration::from_millis(100)).await;

  let (xh, yh, zh) = (x.service.health(), y.service.health(), z.service.health());
  assert_eq!(yh.consumer.applied, 1);
  assert_eq!(zh.consumer.applied, 1);
  // x only ever sees its own local publication
  assert_eq!(xh.consumer.applied, 0);
  assert_eq!(xh.consumer.duplicates, 0);
  assert_eq!(xh.consumer.self_originated, 1);
  assert_eq!(xh.dispatcher.map(|d| d.relayed), Some(2));

  x.service.stop().await;
  y.service.stop().await;
  z.service.stop().await;
}

#[tokio::test]
async fn test_chain_relay_never_returns_to_arrival_cluster() {
  let bus = MemoryBus::new("chain");
  let x = start_node(&bus, node_config("x1", "x", &["y"], true)).await;
  let y = start_node(&bus, node_config("y1", "y", &["x", "z"], true)).await;
  let z = start_node(&bus, node_config("z1", "z", &["y"], true)).await;

  x.orders().put(b"42".to_vec(), b"v1".to_vec()).await;

  assert!(eventually!(y.orders().get(b"42").await == Some(b"v1".to_vec())));
  assert!(eventually!(z.orders().get(b"42").await == Some(b"v1".to_vec())));
  tokio::time::sleep(Duration::from_millis(100)).await;

  let (xh, yh, zh) = (x.service.health(), y.service.health(), z.service.health());
  assert_eq!(xh.dispatcher.map(|d| d.relayed), Some(1));
  // y only passes it on to z
  assert_eq!(yh.consumer.relayed, 1);
  assert_eq!(yh.dispatcher.map(|d| d.relayed), Some(1));
  // z got it from y and has no other peer
  assert_eq!(zh.consumer.relayed, 0);
  assert_eq!(zh.dispatcher.map(|d| d.relayed), Some(0));
  assert_eq!(yh.consumer.applied, 1);
  assert_eq!(yh.consumer.duplicates, 0);
  assert_eq!(zh.consumer.applied, 1);
  assert_eq!(zh.consumer.duplicates, 0);
  assert_eq!(xh.consumer.applied, 0);

  x.service.stop().await;
  y.service.stop().await;
  z.service.stop().await;
}

#[tokio::test]
async fn test_direct_fanout_without_onward_relay() {
  let bus = MemoryBus::new("fanout");
  let x = start_node(&bus, node_config("x1", "x", &["y", "z"], false)).await;
  let y = start_node(&bus, node_config("y1", "y", &["x", "z"], false)).await;
  let z = start_node(&bus, node_config("z1", "z", &["x", "y"], false)).await;

  x.orders().remove(b"gone").await;
  assert!(eventually!(y.service.health().consumer.applied == 1));
  assert!(eventually!(z.service.health().consumer.applied == 1));
  tokio::time::sleep(Duration::from_millis(100)).await;

  assert_eq!(y.service.health().consumer.relayed, 0);
  assert_eq!(z.service.health().consumer.duplicates, 0);
  assert_eq!(x.service.health().consumer.applied, 0);

  x.service.stop().await;
  y.service.stop().await;
  z.service.stop().await;
}

#[tokio::test]
async fn test_request_forward_keeps_origin() {
  let bus = MemoryBus::new("forward");
  let x = start_node(&bus, node_config("x1", "x", &["y"], false)).await;
  let y = start_node(&bus, node_config("y1", "y", &["x"], false)).await;

  let foreign = NodeIdentity::new("w1", "w");
  let event = InvalidationEvent::update(&foreign, 9, "orders", b"k".to_vec(), b"v".to_vec());
  x.service.request_forward(&event, "y").unwrap();

  assert!(eventually!(y.orders().contains(b"k").await));
  assert_eq!(y.service.consumer().unwrap().watermark("w1"), Some(9));
  assert_eq!(y.service.consumer().unwrap().watermark("x1"), None);

  x.service.stop().await;
  y.service.stop().await;
}
