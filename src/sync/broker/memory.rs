//! In-process broker
//!
//! Every `MemoryBroker` handle attached to the same `MemoryBus` sees the
//! others' publications. Subscriptions are durable: a mailbox keeps
//! receiving while its owner is disconnected and the backlog is delivered
//! once the owner subscribes again under the same channel.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;

use super::{glob_match, Broker, BrokerMessage, MessageStream};
use crate::error::TransportError;

struct Mailbox {
  owner: String,
  pattern: String,
  queue: Mutex<VecDeque<BrokerMessage>>,
  notify: Notify,
}

/// Shared message bus
pub struct MemoryBus {
  name: String,
  mailboxes: RwLock<HashMap<String, Arc<Mailbox>>>,
  published: AtomicU64,
}

static NAMED_BUSES: OnceLock<Mutex<HashMap<String, Arc<MemoryBus>>>> = OnceLock::new();

impl MemoryBus {
  pub fn new(name: impl Into<String>) -> Arc<Self> {
    Arc::new(Self {
      name: name.into(),
      mailboxes: RwLock::new(HashMap::new()),
      published: AtomicU64::new(0),
    })
  }

  /// Process-wide bus registered under `name`
  pub fn named(name: &str) -> Arc<Self> {
    NAMED_BUSES
      .get_or_init(|| Mutex::new(HashMap::new()))
      .lock()
      .entry(name.to_string())
      .or_insert_with(|| Self::new(name))
      .clone()
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Total messages accepted by the bus
  pub fn published(&self) -> u64 {
    self.published.load(Ordering::Relaxed)
  }

  /// Fan a message out to every matching mailbox
  fn deliver(&self, message: BrokerMessage) {
    self.published.fetch_add(1, Ordering::Relaxed);
    let mailboxes = self.mailboxes.read();
    for mailbox in mailboxes.values() {
      if glob_match(&mailbox.pattern, &message.channel) {
        mailbox.queue.lock().push_back(message.clone());
        mailbox.notify.notify_one();
      }
    }
  }

  fn mailbox(&self, owner: &str, pattern: &str) -> Arc<Mailbox> {
    self
      .mailboxes
      .write()
      .entry(format!("{}|{}", owner, pattern))
      .or_insert_with(|| {
        Arc::new(Mailbox {
          owner: owner.to_string(),
          pattern: pattern.to_string(),
          queue: Mutex::new(VecDeque::new()),
          notify: Notify::new(),
        })
      })
      .clone()
  }

  fn wake_owner(&self, owner: &str) {
    for mailbox in self.mailboxes.read().values() {
      if mailbox.owner == owner {
        mailbox.notify.notify_one();
      }
    }
  }

  fn drop_owner(&self, owner: &str) {
    let removed: Vec<Arc<Mailbox>> = {
      let mut mailboxes = self.mailboxes.write();
      let keys: Vec<String> = mailboxes
        .iter()
        .filter(|(_, m)| m.owner == owner)
        .map(|(k, _)| k.clone())
        .collect();
      keys.iter().filter_map(|k| mailboxes.remove(k)).collect()
    };
    for mailbox in removed {
      mailbox.notify.notify_one();
    }
  }

  /// Channel patterns an owner currently holds mailboxes for
  pub fn subscriptions(&self, owner: &str) -> Vec<String> {
    let mut patterns: Vec<String> = self
      .mailboxes
      .read()
      .values()
      .filter(|m| m.owner == owner)
      .map(|m| m.pattern.clone())
      .collect();
    patterns.sort();
    patterns
  }

  /// Pending (undelivered) messages for an owner
  pub fn backlog(&self, owner: &str) -> usize {
    self
      .mailboxes
      .read()
      .values()
      .filter(|m| m.owner == owner)
      .map(|m| m.queue.lock().len())
      .sum()
  }
}

struct SessionState {
  reachable: AtomicBool,
  connected: AtomicBool,
  /// Bumped on every connect; streams from older sessions end
  generation: AtomicU64,
}

impl SessionState {
  fn is_live(&self, generation: u64) -> bool {
    self.connected.load(Ordering::Acquire) && self.generation.load(Ordering::Acquire) == generation
  }
}

/// One node's handle onto a `MemoryBus`
pub struct MemoryBroker {
  bus: Arc<MemoryBus>,
  client_id: String,
  session: Arc<SessionState>,
}

impl MemoryBroker {
  pub fn new(bus: Arc<MemoryBus>) -> Self {
    Self::with_client_id(bus, uuid::Uuid::new_v4().to_string())
  }

  pub fn with_client_id(bus: Arc<MemoryBus>, client_id: impl Into<String>) -> Self {
    Self {
      bus,
      client_id: client_id.into(),
      session: Arc::new(SessionState {
        reachable: AtomicBool::new(true),
        connected: AtomicBool::new(false),
        generation: AtomicU64::new(0),
      }),
    }
  }

  pub fn client_id(&self) -> &str {
    &self.client_id
  }

  pub fn bus(&self) -> &Arc<MemoryBus> {
    &self.bus
  }

  /// Simulate network reachability. Going unreachable drops the session and
  /// makes connect attempts fail until reachability is restored.
  pub fn set_reachable(&self, reachable: bool) {
    self.session.reachable.store(reachable, Ordering::Release);
    if !reachable {
      self.disconnect();
    }
  }

  /// Drop the current session without preventing reconnects
  pub fn disconnect(&self) {
    self.session.connected.store(false, Ordering::Release);
    self.bus.wake_owner(&self.client_id);
  }

  pub fn is_connected(&self) -> bool {
    self.session.connected.load(Ordering::Acquire)
  }
}

#[async_trait]
impl Broker for MemoryBroker {
  async fn connect(&self) -> Result<(), TransportError> {
    if !self.session.reachable.load(Ordering::Acquire) {
      return Err(TransportError::Broker(format!(
        "memory bus '{}' unreachable",
        self.bus.name
      )));
    }
    if !self.session.connected.load(Ordering::Acquire) {
      self.session.generation.fetch_add(1, Ordering::AcqRel);
      self.session.connected.store(true, Ordering::Release);
    }
    Ok(())
  }

  async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError> {
    if !self.is_connected() {
      return Err(TransportError::NotConnected);
    }
    self.bus.deliver(BrokerMessage {
      channel: channel.to_string(),
      payload,
    });
    Ok(())
  }

  async fn subscribe(&self, channel: &str) -> Result<MessageStream, TransportError> {
    if !self.is_connected() {
      return Err(TransportError::NotConnected);
    }

    let mailbox = self.bus.mailbox(&self.client_id, channel);
    let session = self.session.clone();
    let generation = session.generation.load(Ordering::Acquire);

    let stream = futures_util::stream::unfold(
      (mailbox, session),
      move |(mailbox, session)| async move {
        loop {
          if !session.is_live(generation) {
            // Hand any pending wakeup to a newer stream on this mailbox
            mailbox.notify.notify_one();
            return None;
          }
          let next = mailbox.queue.lock().pop_front();
          if let Some(message) = next {
            return Some((message, (mailbox, session)));
          }
          mailbox.notify.notified().await;
        }
      },
    );

    Ok(Box::pin(stream))
  }

  async fn close(&self) {
    self.session.connected.store(false, Ordering::Release);
    self.bus.drop_owner(&self.client_id);
  }

  fn describe(&self) -> String {
    format!("memory://{}", self.bus.name)
  }
}
