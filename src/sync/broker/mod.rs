//! Messaging broker abstraction
//!
//! A broker moves opaque payloads between nodes over named channels.
//! Implementations:
//! - `MemoryBroker`: in-process bus, used for tests and single-host setups
//! - `RedisBroker`: Redis Streams with one consumer group per node
//!   (feature `redis`)

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::{MemoryBroker, MemoryBus};
#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{SyncError, TransportError};

/// A message received on a subscribed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
  pub channel: String,
  pub payload: Vec<u8>,
}

/// Stream of deliveries for one subscription. Ends when the session is lost.
pub type MessageStream = BoxStream<'static, BrokerMessage>;

#[async_trait]
pub trait Broker: Send + Sync {
  /// Establish (or verify) a session
  async fn connect(&self) -> Result<(), TransportError>;

  async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError>;

  /// Subscribe to a channel; `*` and `?` make it a glob pattern
  async fn subscribe(&self, channel: &str) -> Result<MessageStream, TransportError>;

  /// Release the session
  async fn close(&self);

  fn describe(&self) -> String;
}

/// Whether a channel name is a glob pattern
pub fn is_pattern(channel: &str) -> bool {
  channel.contains(['*', '?'])
}

/// Simple glob pattern matching
pub fn glob_match(pattern: &str, text: &str) -> bool {
  let p: Vec<char> = pattern.chars().collect();
  let t: Vec<char> = text.chars().collect();
  let (mut pi, mut ti) = (0, 0);
  // Position of the last '*' and the text index it was tried at
  let mut star: Option<(usize, usize)> = None;

  while ti < t.len() {
    if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
      pi += 1;
      ti += 1;
    } else if pi < p.len() && p[pi] == '*' {
      star = Some((pi, ti));
      pi += 1;
    } else if let Some((sp, st)) = star {
      pi = sp + 1;
      ti = st + 1;
      star = Some((sp, st + 1));
    } else {
      return false;
    }
  }

  p[pi..].iter().all(|c| *c == '*')
}

/// Build a broker from a URL (`redis://`, `rediss://`, `memory://<bus>`).
/// `client_id` names this node's subscriptions on the broker.
pub fn from_url(
  url: &str,
  connect_timeout: Duration,
  client_id: &str,
) -> Result<Arc<dyn Broker>, SyncError> {
  let (scheme, rest) = url
    .split_once("://")
    .ok_or_else(|| SyncError::config(format!("invalid broker url '{}'", url)))?;

  match scheme {
    "memory" => {
      let bus = MemoryBus::named(if rest.is_empty() { "default" } else { rest });
      Ok(Arc::new(MemoryBroker::with_client_id(bus, client_id)))
    }
    #[cfg(feature = "redis")]
    "redis" | "rediss" => Ok(Arc::new(RedisBroker::new(url, connect_timeout, client_id)?)),
    _ => {
      let _ = connect_timeout;
      Err(SyncError::config(format!(
        "unsupported broker scheme '{}'",
        scheme
      )))
    }
  }
}
