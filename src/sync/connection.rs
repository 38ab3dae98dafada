//! Broker session ownership
//!
//! `ConnectionManager` keeps one logical session to the broker alive:
//! - connects with exponential backoff (bounded, jittered)
//! - publishes with a bounded timeout, failing fast when no session exists
//! - runs one delivery task per subscription, invoking the handler
//!   sequentially so per-channel broker order is preserved
//! - reconnects and resubscribes transparently after session loss
//!
//! State transitions are published on a watch channel for health reporting.

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use super::broker::{Broker, BrokerMessage};
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
  Disconnected,
  Connecting,
  Connected,
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
      ConnectionState::Connecting => write!(f, "CONNECTING"),
      ConnectionState::Connected => write!(f, "CONNECTED"),
    }
  }
}

/// Exponential reconnect delay, doubling from `initial` up to `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
  pub initial: Duration,
  pub max: Duration,
}

impl Default for BackoffPolicy {
  fn default() -> Self {
    Self::new(Duration::from_secs(1), Duration::from_secs(30))
  }
}

impl BackoffPolicy {
  pub fn new(initial: Duration, max: Duration) -> Self {
    Self {
      initial,
      max: max.max(initial),
    }
  }

  /// Delay before retry number `attempt` (0-based), without jitter
  pub fn delay(&self, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
    self.initial.saturating_mul(factor).min(self.max)
  }

  /// `delay(attempt)` plus up to 10% random jitter, still capped at `max`
  pub fn jittered(&self, attempt: u32) -> Duration {
    let base = self.delay(attempt);
    let spread = base.as_millis() as u64 / 10;
    let jitter = if spread == 0 {
      0
    } else {
      rand::thread_rng().gen_range(0..=spread)
    };
    (base + Duration::from_millis(jitter)).min(self.max)
  }
}

/// Receives every message delivered on a subscribed channel
#[async_trait]
pub trait MessageHandler: Send + Sync {
  async fn on_message(&self, message: BrokerMessage);
}

struct Inner {
  broker: Arc<dyn Broker>,
  backoff: BackoffPolicy,
  publish_timeout: Duration,
  state_tx: watch::Sender<ConnectionState>,
  shutdown_tx: watch::Sender<bool>,
  accepting: AtomicBool,
  reconnect: Notify,
}

impl Inner {
  fn set_state(&self, state: ConnectionState) {
    let previous = self.state_tx.send_replace(state);
    if previous != state {
      tracing::info!(
        broker = %self.broker.describe(),
        from = %previous,
        to = %state,
        "Broker connection state changed"
      );
    }
  }

  fn is_shutting_down(&self) -> bool {
    *self.shutdown_tx.borrow()
  }

  /// Session loss detected by a publisher or a delivery loop
  fn mark_lost(&self) {
    if self.is_shutting_down() {
      return;
    }
    if *self.state_tx.borrow() == ConnectionState::Connected {
      self.set_state(ConnectionState::Disconnected);
    }
    self.reconnect.notify_one();
  }

  /// Connect with backoff until success or shutdown
  async fn connect_with_backoff(&self) -> Result<(), TransportError> {
    let mut shutdown = self.shutdown_tx.subscribe();
    let mut attempt = 0u32;

    loop {
      if *shutdown.borrow() {
        return Err(TransportError::Closed);
      }

      self.set_state(ConnectionState::Connecting);
      match self.broker.connect().await {
        Ok(()) => {
          self.set_state(ConnectionState::Connected);
          return Ok(());
        }
        Err(e) => {
          let delay = self.backoff.jittered(attempt);
          tracing::warn!(
            error = %e,
            attempt = attempt + 1,
            backoff_ms = delay.as_millis() as u64,
            "Broker connection failed, retrying"
          );
          self.set_state(ConnectionState::Disconnected);
          attempt = attempt.saturating_add(1);

          tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
          }
        }
      }
    }
  }

  async fn wait_connected(&self) -> bool {
    let mut state = self.state_tx.subscribe();
    let mut shutdown = self.shutdown_tx.subscribe();
    loop {
      if *shutdown.borrow() {
        return false;
      }
      if *state.borrow_and_update() == ConnectionState::Connected {
        return true;
      }
      tokio::select! {
        changed = state.changed() => {
          if changed.is_err() {
            return false;
          }
        }
        _ = shutdown.changed() => {}
      }
    }
  }
}

/// Owns the broker session. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct ConnectionManager {
  inner: Arc<Inner>,
  tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ConnectionManager {
  pub fn new(broker: Arc<dyn Broker>, backoff: BackoffPolicy, publish_timeout: Duration) -> Self {
    let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
    let (shutdown_tx, _) = watch::channel(false);
    Self {
      inner: Arc::new(Inner {
        broker,
        backoff,
        publish_timeout,
        state_tx,
        shutdown_tx,
        accepting: AtomicBool::new(true),
        reconnect: Notify::new(),
      }),
      tasks: Arc::new(Mutex::new(Vec::new())),
    }
  }

  pub fn state(&self) -> ConnectionState {
    *self.inner.state_tx.borrow()
  }

  pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
    self.inner.state_tx.subscribe()
  }

  /// Establish a session, retrying with backoff. Only fails if the manager
  /// is closed while retrying.
  pub async fn connect(&self) -> Result<(), TransportError> {
    self.inner.connect_with_backoff().await
  }

  /// Connect in the background and keep reconnecting after session loss
  pub fn start(&self) {
    let inner = self.inner.clone();
    let handle = tokio::spawn(async move {
      let mut shutdown = inner.shutdown_tx.subscribe();
      loop {
        if inner.connect_with_backoff().await.is_err() {
          break;
        }
        // Wait for a delivery loop or publisher to report the session lost
        tokio::select! {
          _ = inner.reconnect.notified() => {
            tracing::debug!("Reconnect requested");
          }
          _ = shutdown.changed() => break,
        }
        if inner.is_shutting_down() {
          break;
        }
      }
    });
    self.tasks.lock().push(handle);
  }

  /// Wait until connected or `timeout` elapses
  pub async fn wait_connected(&self, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, self.inner.wait_connected())
      .await
      .unwrap_or(false)
  }

  pub async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError> {
    if !self.inner.accepting.load(Ordering::Acquire) {
      return Err(TransportError::Closed);
    }
    if self.state() != ConnectionState::Connected {
      return Err(TransportError::NotConnected);
    }

    let timeout = self.inner.publish_timeout;
    let result = match tokio::time::timeout(timeout, self.inner.broker.publish(channel, payload)).await
    {
      Ok(result) => result,
      Err(_) => Err(TransportError::Timeout(timeout)),
    };

    if let Err(e) = &result {
      tracing::warn!(channel = %channel, error = %e, "Publish failed");
      self.inner.mark_lost();
    }
    result
  }

  /// Register `handler` for every message on `channel`.
  ///
  /// Spawns a dedicated delivery task that subscribes whenever a session is
  /// available and resubscribes after reconnects.
  pub fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) {
    let inner = self.inner.clone();
    let channel = channel.to_string();

    let handle = tokio::spawn(async move {
      let mut shutdown = inner.shutdown_tx.subscribe();

      loop {
        if !inner.wait_connected().await {
          break;
        }

        let mut stream = match inner.broker.subscribe(&channel).await {
          Ok(stream) => stream,
          Err(e) => {
            tracing::warn!(channel = %channel, error = %e, "Subscribe failed");
            inner.mark_lost();
            // Let the reconnect loop move the state off CONNECTED first
            tokio::select! {
              _ = tokio::time::sleep(inner.backoff.initial) => {}
              _ = shutdown.changed() => {}
            }
            continue;
          }
        };
        tracing::info!(channel = %channel, "Subscribed");

        loop {
          tokio::select! {
            next = stream.next() => match next {
              Some(message) => handler.on_message(message).await,
              None => {
                tracing::warn!(channel = %channel, "Subscription stream ended");
                inner.mark_lost();
                break;
              }
            },
            _ = shutdown.changed() => {
              tracing::debug!(channel = %channel, "Delivery loop stopping");
              return;
            }
          }
        }
      }
    });
    self.tasks.lock().push(handle);
  }

  /// Stop accepting new publishes without tearing down the session
  pub fn stop_accepting(&self) {
    self.inner.accepting.store(false, Ordering::Release);
  }

  pub fn is_accepting(&self) -> bool {
    self.inner.accepting.load(Ordering::Acquire)
  }

  /// Scoped shutdown: stop accepting publishes, stop delivery loops within
  /// `drain`, then release the session.
  pub async fn close(&self, drain: Duration) {
    self.stop_accepting();
    self.inner.shutdown_tx.send_replace(true);

    let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
    for handle in handles {
      let abort = handle.abort_handle();
      if tokio::time::timeout(drain, handle).await.is_err() {
        tracing::warn!("Delivery task did not stop within drain window, aborting");
        abort.abort();
      }
    }

    self.inner.broker.close().await;
    self.inner.set_state(ConnectionState::Disconnected);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sync::broker::{MemoryBroker, MemoryBus, MessageStream};
  use std::sync::atomic::AtomicUsize;
  use tokio::sync::Semaphore;

  /// Memory broker whose connect attempts are counted and can be held
  struct GatedBroker {
    inner: MemoryBroker,
    gate: Semaphore,
    attempts: AtomicUsize,
  }

  impl GatedBroker {
    fn new(bus: &str, open: bool) -> Arc<Self> {
      let permits = if open { Semaphore::MAX_PERMITS } else { 0 };
      Arc::new(Self {
        inner: MemoryBroker::new(MemoryBus::new(bus)),
        gate: Semaphore::new(permits),
        attempts: AtomicUsize::new(0),
      })
    }
  }

  #[async_trait]
  impl Broker for GatedBroker {
    async fn connect(&self) -> Result<(), TransportError> {
      self.attempts.fetch_add(1, Ordering::SeqCst);
      self
        .gate
        .acquire()
        .await
        .map_err(|_| TransportError::Closed)?
        .forget();
      self.inner.connect().await
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError> {
      self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, TransportError> {
      self.inner.subscribe(channel).await
    }

    async fn close(&self) {
      self.inner.close().await
    }

    fn describe(&self) -> String {
      self.inner.describe()
    }
  }

  fn manager(broker: Arc<GatedBroker>) -> ConnectionManager {
    ConnectionManager::new(
      broker,
      BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(40)),
      Duration::from_millis(200),
    )
  }

  async fn reach(state: &mut watch::Receiver<ConnectionState>, target: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == target))
      .await
      .expect("state not reached in time")
      .expect("state channel closed");
  }

  #[tokio::test]
  async fn test_state_sequence_through_session_loss() {
    let broker = GatedBroker::new("conn-states", false);
    let manager = manager(broker.clone());
    let mut state = manager.watch_state();
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);

    let connecting = tokio::spawn({
      let manager = manager.clone();
      async move { manager.connect().await }
    });
    reach(&mut state, ConnectionState::Connecting).await;
    assert_eq!(manager.state(), ConnectionState::Connecting);

    broker.gate.add_permits(1);
    reach(&mut state, ConnectionState::Connected).await;
    connecting.await.unwrap().unwrap();

    // Session dropped underneath: the next publish reports it lost
    broker.inner.set_reachable(false);
    assert!(manager.publish("orders.x.invalidation", vec![1]).await.is_err());
    reach(&mut state, ConnectionState::Disconnected).await;
  }

  #[tokio::test]
  async fn test_connect_retries_until_closed() {
    let broker = GatedBroker::new("conn-retry", true);
    broker.inner.set_reachable(false);
    let manager = manager(broker.clone());

    let connecting = tokio::spawn({
      let manager = manager.clone();
      async move { manager.connect().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(broker.attempts.load(Ordering::SeqCst) >= 2);
    assert_ne!(manager.state(), ConnectionState::Connected);

    manager.close(Duration::from_millis(100)).await;
    let result = tokio::time::timeout(Duration::from_secs(1), connecting)
      .await
      .unwrap()
      .unwrap();
    assert!(matches!(result, Err(TransportError::Closed)));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
  }

  #[tokio::test]
  async fn test_publish_fails_fast_without_session() {
    let broker = GatedBroker::new("conn-publish", true);
    let manager = manager(broker.clone());

    let result = tokio::time::timeout(
      Duration::from_millis(50),
      manager.publish("orders.x.invalidation", vec![1]),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(TransportError::NotConnected)));
    assert_eq!(broker.attempts.load(Ordering::SeqCst), 0);

    manager.close(Duration::from_millis(50)).await;
    assert!(matches!(
      manager.publish("orders.x.invalidation", vec![1]).await,
      Err(TransportError::Closed)
    ));
  }

  struct Collect(Mutex<Vec<BrokerMessage>>);

  #[async_trait]
  impl MessageHandler for Collect {
    async fn on_message(&self, message: BrokerMessage) {
      self.0.lock().push(message);
    }
  }

  #[tokio::test]
  async fn test_subscription_survives_reconnect() {
    let bus = MemoryBus::new("conn-resubscribe");
    let broker = Arc::new(MemoryBroker::with_client_id(bus.clone(), "b"));
    let manager = ConnectionManager::new(
      broker.clone(),
      BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(40)),
      Duration::from_millis(200),
    );
    let handler = Arc::new(Collect(Mutex::new(Vec::new())));
    manager.start();
    manager.subscribe("*.x.invalidation", handler.clone());
    assert!(manager.wait_connected(Duration::from_secs(2)).await);

    let publisher = MemoryBroker::new(bus.clone());
    publisher.connect().await.unwrap();
    while bus.subscriptions("b").is_empty() {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }

    broker.disconnect();
    publisher.publish("orders.x.invalidation", b"late".to_vec()).await.unwrap();

    let mut waited = 0;
    while handler.0.lock().is_empty() && waited < 200 {
      tokio::time::sleep(Duration::from_millis(10)).await;
      waited += 1;
    }
    assert_eq!(handler.0.lock()[0].payload, b"late".to_vec());
    assert_eq!(manager.state(), ConnectionState::Connected);

    manager.close(Duration::from_millis(100)).await;
  }

  #[test]
  fn test_backoff_doubles_to_cap() {
    let policy = BackoffPolicy::default();
    assert_eq!(policy.delay(0), Duration::from_secs(1));
    assert_eq!(policy.delay(1), Duration::from_secs(2));
    assert_eq!(policy.delay(4), Duration::from_secs(16));
    assert_eq!(policy.delay(5), Duration::from_secs(30));
    assert_eq!(policy.delay(60), Duration::from_secs(30));
  }

  #[test]
  fn test_jitter_stays_within_bounds() {
    let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(1000));
    for attempt in 0..10 {
      let d = policy.jittered(attempt);
      assert!(d >= policy.delay(attempt));
      assert!(d <= policy.max);
    }
  }

  #[test]
  fn test_max_never_below_initial() {
    let policy = BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(1));
    assert_eq!(policy.max, Duration::from_secs(5));
  }
}
