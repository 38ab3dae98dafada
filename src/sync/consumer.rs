//! Consumer side: decode, filter and apply remote invalidations
//!
//! Filtering happens in this order:
//! 1. undecodable payloads are dropped and logged
//! 2. events produced by this node are discarded
//! 3. events at or below the origin's watermark are discarded
//!
//! Surviving events are applied to the local cache tagged as
//! [`MutationSource::Remote`], which keeps them away from the producer.
//! Admission and application of one origin's events are serialized, so an
//! admitted event is never overwritten by an older one still applying.
//!
//! Messages received on a relay channel (`...from.<cluster>`) record that
//! cluster as their arrival point; onward relays skip it.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::broker::BrokerMessage;
use super::codec;
use super::connection::MessageHandler;
use super::dispatcher::InvalidationPropagator;
use super::event::{arrival_cluster, InvalidationEvent, NodeIdentity, Operation};
use crate::cache::{CacheManager, MutationSource};

/// Outcome of handling one delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
  Applied,
  SelfOriginated,
  /// Sequence at or below the origin's watermark
  DuplicateOrStale { last_applied: u64 },
  Malformed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerStats {
  pub applied: u64,
  pub self_originated: u64,
  pub duplicates: u64,
  pub malformed: u64,
  pub relayed: u64,
  pub tracked_origins: usize,
}

#[derive(Default)]
struct Counters {
  applied: AtomicU64,
  self_originated: AtomicU64,
  duplicates: AtomicU64,
  malformed: AtomicU64,
  relayed: AtomicU64,
}

pub struct Consumer {
  identity: NodeIdentity,
  caches: Arc<CacheManager>,
  /// Highest applied sequence per origin node. Never decreases; lost on
  /// restart.
  watermarks: Mutex<HashMap<String, u64>>,
  /// Held across admit and apply, one per origin node
  apply_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
  relay: Option<Arc<dyn InvalidationPropagator>>,
  counters: Counters,
}

impl Consumer {
  pub fn new(identity: NodeIdentity, caches: Arc<CacheManager>) -> Self {
    Self {
      identity,
      caches,
      watermarks: Mutex::new(HashMap::new()),
      apply_locks: Mutex::new(HashMap::new()),
      relay: None,
      counters: Counters::default(),
    }
  }

  /// Hand fresh events from other clusters to `relay` after applying them
  pub fn with_relay(mut self, relay: Arc<dyn InvalidationPropagator>) -> Self {
    self.relay = Some(relay);
    self
  }

  pub fn watermark(&self, origin_node_id: &str) -> Option<u64> {
    self.watermarks.lock().get(origin_node_id).copied()
  }

  fn apply_lock(&self, origin_node_id: &str) -> Arc<tokio::sync::Mutex<()>> {
    self
      .apply_locks
      .lock()
      .entry(origin_node_id.to_string())
      .or_default()
      .clone()
  }

  /// Check-and-advance in one step so concurrent deliveries of the same
  /// event apply it at most once.
  fn admit(&self, event: &InvalidationEvent) -> Result<(), Disposition> {
    let mut watermarks = self.watermarks.lock();
    match watermarks.get_mut(&event.origin_node_id) {
      Some(last) if event.sequence_number <= *last => Err(Disposition::DuplicateOrStale {
        last_applied: *last,
      }),
      Some(last) => {
        *last = event.sequence_number;
        Ok(())
      }
      None => {
        watermarks.insert(event.origin_node_id.clone(), event.sequence_number);
        Ok(())
      }
    }
  }

  async fn apply(&self, event: &InvalidationEvent) {
    match event.operation {
      Operation::Remove => {
        if let (Some(cache), Some(key)) = (self.caches.get(&event.cache_name), &event.key) {
          cache.remove_from(key, MutationSource::Remote).await;
        }
      }
      Operation::Update => {
        if let (Some(key), Some(value)) = (&event.key, &event.value) {
          self
            .caches
            .cache(&event.cache_name)
            .put_from(key.clone(), value.clone(), MutationSource::Remote)
            .await;
        }
      }
      Operation::ClearAll => {
        if let Some(cache) = self.caches.get(&event.cache_name) {
          let cleared = cache.clear_from(MutationSource::Remote).await;
          tracing::debug!(cache = %event.cache_name, cleared, "Cleared cache on remote request");
        }
      }
    }
  }

  /// Handle one event that has already been decoded
  pub async fn on_event(&self, event: InvalidationEvent) -> Disposition {
    self.on_event_from(event, None).await
  }

  /// Handle one decoded event that `arrived_from` handed over. `None` means
  /// it came straight from its origin cluster.
  pub async fn on_event_from(
    &self,
    event: InvalidationEvent,
    arrived_from: Option<&str>,
  ) -> Disposition {
    if event.origin_node_id == self.identity.node_id {
      self.counters.self_originated.fetch_add(1, Ordering::Relaxed);
      tracing::trace!(sequence = event.sequence_number, "Discarding self-originated event");
      return Disposition::SelfOriginated;
    }

    {
      let lock = self.apply_lock(&event.origin_node_id);
      let _serial = lock.lock().await;

      if let Err(disposition) = self.admit(&event) {
        if let Disposition::DuplicateOrStale { last_applied } = &disposition {
          self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
          tracing::debug!(
            origin = %event.origin_node_id,
            sequence = event.sequence_number,
            last_applied,
            "Discarding duplicate or stale event"
          );
        }
        return disposition;
      }
      self.apply(&event).await;
    }
    self.counters.applied.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(
      cache = %event.cache_name,
      key = %event.key_hex(),
      operation = %event.operation,
      origin = %event.origin_node_id,
      sequence = event.sequence_number,
      arrived_from = arrived_from.unwrap_or(event.origin_cluster_id.as_str()),
      "Applied remote invalidation"
    );

    if let Some(relay) = &self.relay {
      if event.origin_cluster_id != self.identity.cluster_id {
        let arrived_from = arrived_from.unwrap_or(event.origin_cluster_id.as_str());
        let sent = relay.propagate(&event, Some(arrived_from));
        self.counters.relayed.fetch_add(sent as u64, Ordering::Relaxed);
      }
    }

    Disposition::Applied
  }

  /// Decode and handle one raw message. Never fails: malformed input is
  /// logged and dropped.
  pub async fn on_message_bytes(&self, payload: &[u8]) -> Disposition {
    self.on_delivery(payload, None).await
  }

  async fn on_delivery(&self, payload: &[u8], arrived_from: Option<&str>) -> Disposition {
    match codec::decode(payload) {
      Ok(event) => self.on_event_from(event, arrived_from).await,
      Err(e) => {
        self.counters.malformed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(error = %e, len = payload.len(), "Dropping malformed invalidation");
        Disposition::Malformed
      }
    }
  }

  pub fn stats(&self) -> ConsumerStats {
    ConsumerStats {
      applied: self.counters.applied.load(Ordering::Relaxed),
      self_originated: self.counters.self_originated.load(Ordering::Relaxed),
      duplicates: self.counters.duplicates.load(Ordering::Relaxed),
      malformed: self.counters.malformed.load(Ordering::Relaxed),
      relayed: self.counters.relayed.load(Ordering::Relaxed),
      tracked_origins: self.watermarks.lock().len(),
    }
  }
}

#[async_trait]
impl MessageHandler for Consumer {
  async fn on_message(&self, message: BrokerMessage) {
    let arrived_from = arrival_cluster(&message.channel);
    let disposition = self.on_delivery(&message.payload, arrived_from).await;
    if disposition == Disposition::Malformed {
      tracing::debug!(channel = %message.channel, "Malformed payload received");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheMutation, CacheStore};

  fn consumer() -> (Consumer, Arc<CacheManager>) {
    let caches = Arc::new(CacheManager::new());
    (Consumer::new(NodeIdentity::new("b", "x"), caches.clone()), caches)
  }

  fn origin() -> NodeIdentity {
    NodeIdentity::new("a", "x")
  }

  #[tokio::test]
  async fn test_update_then_remove() {
    let (consumer, caches) = consumer();

    let update = InvalidationEvent::update(&origin(), 1, "orders", b"42".to_vec(), b"v1".to_vec());
    assert_eq!(consumer.on_event(update).await, Disposition::Applied);
    assert_eq!(caches.cache("orders").get(b"42").await, Some(b"v1".to_vec()));

    let remove = InvalidationEvent::remove(&origin(), 2, "orders", b"42".to_vec());
    assert_eq!(consumer.on_event(remove).await, Disposition::Applied);
    assert_eq!(caches.cache("orders").get(b"42").await, None);
  }

  #[tokio::test]
  async fn test_stale_sequence_is_noop() {
    let (consumer, caches) = consumer();

    let newer = InvalidationEvent::update(&origin(), 5, "orders", b"k".to_vec(), b"five".to_vec());
    let older = InvalidationEvent::update(&origin(), 3, "orders", b"k".to_vec(), b"three".to_vec());
    consumer.on_event(newer.clone()).await;

    assert_eq!(
      consumer.on_event(older).await,
      Disposition::DuplicateOrStale { last_applied: 5 }
    );
    assert_eq!(
      consumer.on_event(newer).await,
      Disposition::DuplicateOrStale { last_applied: 5 }
    );
    assert_eq!(caches.cache("orders").get(b"k").await, Some(b"five".to_vec()));
    assert_eq!(consumer.watermark("a"), Some(5));
    assert_eq!(consumer.stats().duplicates, 2);
  }

  #[tokio::test]
  async fn test_self_originated_discarded() {
    let (consumer, caches) = consumer();
    let own = NodeIdentity::new("b", "x");
    let event = InvalidationEvent::update(&own, 1, "orders", b"k".to_vec(), b"v".to_vec());

    assert_eq!(consumer.on_event(event).await, Disposition::SelfOriginated);
    assert!(caches.get("orders").is_none());
    assert_eq!(consumer.watermark("b"), None);
  }

  #[tokio::test]
  async fn test_malformed_payload_dropped() {
    let (consumer, _) = consumer();
    assert_eq!(consumer.on_message_bytes(&[0, 0, 0]).await, Disposition::Malformed);
    assert_eq!(consumer.stats().malformed, 1);
  }

  #[tokio::test]
  async fn test_clear_all_then_remove() {
    let (consumer, caches) = consumer();
    let orders = caches.cache("orders");
    orders.put(b"1".to_vec(), b"a".to_vec()).await;
    orders.put(b"2".to_vec(), b"b".to_vec()).await;

    let clear = InvalidationEvent::clear_all(&origin(), 1, "orders");
    assert_eq!(consumer.on_event(clear).await, Disposition::Applied);
    assert!(orders.is_empty().await);

    let remove = InvalidationEvent::remove(&origin(), 2, "orders", b"1".to_vec());
    assert_eq!(consumer.on_event(remove).await, Disposition::Applied);
    assert!(orders.is_empty().await);
  }

  #[tokio::test]
  async fn test_applied_mutations_are_tagged_remote() {
    let (consumer, caches) = consumer();
    let mut mutations = caches.subscribe_mutations();

    let event = InvalidationEvent::update(&origin(), 1, "orders", b"k".to_vec(), b"v".to_vec());
    consumer.on_event(event).await;

    let mutation: CacheMutation = mutations.recv().await.unwrap();
    assert_eq!(mutation.source, MutationSource::Remote);
    assert!(!mutation.is_local());
  }

  struct CountingRelay(AtomicU64, Mutex<Vec<Option<String>>>);

  impl InvalidationPropagator for CountingRelay {
    fn propagate(&self, _event: &InvalidationEvent, arrived_from: Option<&str>) -> usize {
      self.0.fetch_add(1, Ordering::Relaxed);
      self.1.lock().push(arrived_from.map(str::to_string));
      1
    }
  }

  #[tokio::test]
  async fn test_relays_only_foreign_cluster_events() {
    let caches = Arc::new(CacheManager::new());
    let relay = Arc::new(CountingRelay(AtomicU64::new(0), Mutex::new(Vec::new())));
    let consumer = Consumer::new(NodeIdentity::new("b", "y"), caches).with_relay(relay.clone());

    // Same cluster: no relay
    let local = InvalidationEvent::remove(&NodeIdentity::new("c", "y"), 1, "orders", b"k".to_vec());
    consumer.on_event(local).await;
    // Foreign cluster: relayed once, even if delivered twice
    let foreign = InvalidationEvent::remove(&NodeIdentity::new("a", "x"), 1, "orders", b"k".to_vec());
    consumer.on_event(foreign.clone()).await;
    consumer.on_event(foreign).await;

    assert_eq!(relay.0.load(Ordering::Relaxed), 1);
    assert_eq!(*relay.1.lock(), vec![Some("x".to_string())]);
    assert_eq!(consumer.stats().relayed, 1);
  }

  #[tokio::test]
  async fn test_relay_skips_the_cluster_it_arrived_from() {
    let caches = Arc::new(CacheManager::new());
    let relay = Arc::new(CountingRelay(AtomicU64::new(0), Mutex::new(Vec::new())));
    let consumer = Consumer::new(NodeIdentity::new("c", "z"), caches).with_relay(relay.clone());

    // Originated in x, handed over by y
    let event = InvalidationEvent::remove(&NodeIdentity::new("a", "x"), 1, "orders", b"k".to_vec());
    consumer
      .on_message(BrokerMessage {
        channel: "orders.z.invalidation.from.y".into(),
        payload: codec::encode(&event).unwrap(),
      })
      .await;

    assert_eq!(*relay.1.lock(), vec![Some("y".to_string())]);
  }

  /// Parks Update writes of `held` until released
  struct GatedStore {
    inner: crate::cache::InMemoryCacheStore,
    held: Vec<u8>,
    gate: tokio::sync::Notify,
  }

  #[async_trait]
  impl CacheStore for GatedStore {
    fn name(&self) -> &str {
      self.inner.name()
    }

    async fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
      self.inner.get(key).await
    }

    async fn put_from(&self, key: Vec<u8>, value: Vec<u8>, source: MutationSource) {
      if value == self.held {
        self.gate.notified().await;
      }
      self.inner.put_from(key, value, source).await
    }

    async fn remove_from(&self, key: &[u8], source: MutationSource) -> bool {
      self.inner.remove_from(key, source).await
    }

    async fn clear_from(&self, source: MutationSource) -> usize {
      self.inner.clear_from(source).await
    }

    async fn len(&self) -> usize {
      self.inner.len().await
    }

    async fn stats(&self) -> crate::cache::CacheStats {
      self.inner.stats().await
    }
  }

  #[tokio::test]
  async fn test_newer_event_waits_for_older_apply() {
    let caches = Arc::new(CacheManager::new());
    let store = Arc::new(GatedStore {
      inner: crate::cache::InMemoryCacheStore::new("orders", caches.hook().clone()),
      held: b"five".to_vec(),
      gate: tokio::sync::Notify::new(),
    });
    caches.register(store.clone());
    let consumer = Arc::new(Consumer::new(NodeIdentity::new("b", "x"), caches));

    let five = InvalidationEvent::update(&origin(), 5, "orders", b"k".to_vec(), b"five".to_vec());
    let six = InvalidationEvent::update(&origin(), 6, "orders", b"k".to_vec(), b"six".to_vec());

    let first = tokio::spawn({
      let consumer = consumer.clone();
      async move { consumer.on_event(five).await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let second = tokio::spawn({
      let consumer = consumer.clone();
      async move { consumer.on_event(six).await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // Seq 6 is blocked behind the parked seq 5 apply
    assert_eq!(store.get(b"k").await, None);

    store.gate.notify_one();
    assert_eq!(first.await.unwrap(), Disposition::Applied);
    assert_eq!(second.await.unwrap(), Disposition::Applied);
    assert_eq!(store.get(b"k").await, Some(b"six".to_vec()));
  }
}
