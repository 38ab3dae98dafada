//! Invalidation event model

use serde::{Deserialize, Serialize};

pub use crate::cache::Operation;

/// Suffix of every invalidation channel
pub const CHANNEL_SUFFIX: &str = "invalidation";

/// Marker separating a relay channel from the cluster that sent it
pub const RELAY_MARKER: &str = ".from.";

/// Channel an event for `cache_name` is published on inside `cluster_id`
pub fn channel_name(cache_name: &str, cluster_id: &str) -> String {
  format!("{}.{}.{}", cache_name, cluster_id, CHANNEL_SUFFIX)
}

/// Channel a peer cluster `source` uses to hand `cache_name` events to
/// `cluster_id`. `source` may be `*` to build a subscription pattern.
pub fn relay_channel_name(cache_name: &str, cluster_id: &str, source: &str) -> String {
  format!("{}{}{}", channel_name(cache_name, cluster_id), RELAY_MARKER, source)
}

/// Cluster that handed over a message, read from its relay channel name.
/// `None` for plain cluster channels.
pub fn arrival_cluster(channel: &str) -> Option<&str> {
  let (_, source) = channel.rsplit_once(RELAY_MARKER)?;
  let valid = !source.is_empty() && !source.contains(['.', '*', '?']);
  valid.then_some(source)
}

/// Identity stamped on every event this node produces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
  pub node_id: String,
  pub cluster_id: String,
}

impl NodeIdentity {
  pub fn new(node_id: impl Into<String>, cluster_id: impl Into<String>) -> Self {
    Self {
      node_id: node_id.into(),
      cluster_id: cluster_id.into(),
    }
  }
}

/// The unit of propagation.
///
/// Origin fields are set once by the producing node and never rewritten by
/// relays. `key` is `None` only for `ClearAll`; `value` is `Some` only for
/// `Update`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationEvent {
  pub cache_name: String,
  pub key: Option<Vec<u8>>,
  pub operation: Operation,
  pub value: Option<Vec<u8>>,
  pub origin_node_id: String,
  pub origin_cluster_id: String,
  pub sequence_number: u64,
  /// Producer wall-clock in epoch millis, advisory only
  pub timestamp: i64,
}

impl InvalidationEvent {
  pub fn remove(origin: &NodeIdentity, sequence: u64, cache_name: &str, key: Vec<u8>) -> Self {
    Self::build(origin, sequence, cache_name, Some(key), Operation::Remove, None)
  }

  pub fn update(
    origin: &NodeIdentity,
    sequence: u64,
    cache_name: &str,
    key: Vec<u8>,
    value: Vec<u8>,
  ) -> Self {
    Self::build(
      origin,
      sequence,
      cache_name,
      Some(key),
      Operation::Update,
      Some(value),
    )
  }

  pub fn clear_all(origin: &NodeIdentity, sequence: u64, cache_name: &str) -> Self {
    Self::build(origin, sequence, cache_name, None, Operation::ClearAll, None)
  }

  /// Build an event, dropping key/value where the operation does not carry them
  pub fn build(
    origin: &NodeIdentity,
    sequence: u64,
    cache_name: &str,
    key: Option<Vec<u8>>,
    operation: Operation,
    value: Option<Vec<u8>>,
  ) -> Self {
    let (key, value) = match operation {
      Operation::Remove => (key, None),
      Operation::Update => (key, value),
      Operation::ClearAll => (None, None),
    };
    Self {
      cache_name: cache_name.to_string(),
      key,
      operation,
      value,
      origin_node_id: origin.node_id.clone(),
      origin_cluster_id: origin.cluster_id.clone(),
      sequence_number: sequence,
      timestamp: chrono::Utc::now().timestamp_millis(),
    }
  }

  /// Whether key/value presence matches the operation
  pub fn is_well_formed(&self) -> bool {
    match self.operation {
      Operation::Remove => self.key.is_some() && self.value.is_none(),
      Operation::Update => self.key.is_some() && self.value.is_some(),
      Operation::ClearAll => self.key.is_none() && self.value.is_none(),
    }
  }

  /// Hex rendering of the key for log fields
  pub fn key_hex(&self) -> String {
    self.key.as_deref().map(hex::encode).unwrap_or_else(|| "*".into())
  }
}
