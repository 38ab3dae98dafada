//! Cache entry-event hook

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

/// Kind of mutation applied to a cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
  Remove,
  Update,
  ClearAll,
}

impl Operation {
  /// Wire tag
  pub fn tag(self) -> u8 {
    match self {
      Operation::Remove => 0,
      Operation::Update => 1,
      Operation::ClearAll => 2,
    }
  }

  pub fn from_tag(tag: u8) -> Option<Self> {
    match tag {
      0 => Some(Operation::Remove),
      1 => Some(Operation::Update),
      2 => Some(Operation::ClearAll),
      _ => None,
    }
  }
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Operation::Remove => write!(f, "REMOVE"),
      Operation::Update => write!(f, "UPDATE"),
      Operation::ClearAll => write!(f, "CLEAR_ALL"),
    }
  }
}

/// Who caused a mutation.
///
/// Mutations applied on behalf of a remote node are tagged `Remote` so the
/// producer never re-publishes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationSource {
  Local,
  Remote,
}

/// A mutation observed on a named cache
#[derive(Debug, Clone)]
pub struct CacheMutation {
  pub cache_name: String,
  /// `None` for `ClearAll`
  pub key: Option<Vec<u8>>,
  pub operation: Operation,
  /// Present only for `Update`
  pub value: Option<Vec<u8>>,
  pub source: MutationSource,
  pub changed_at: DateTime<Utc>,
}

impl CacheMutation {
  pub fn new(
    cache_name: &str,
    key: Option<Vec<u8>>,
    operation: Operation,
    value: Option<Vec<u8>>,
    source: MutationSource,
  ) -> Self {
    Self {
      cache_name: cache_name.to_string(),
      key,
      operation,
      value,
      source,
      changed_at: Utc::now(),
    }
  }

  pub fn is_local(&self) -> bool {
    self.source == MutationSource::Local
  }
}

/// Fan-out point for mutation events, shared by every cache of a manager
#[derive(Clone)]
pub struct MutationHook {
  tx: broadcast::Sender<CacheMutation>,
}

impl MutationHook {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn emit(&self, mutation: CacheMutation) {
    // No observers is fine: propagation may be disabled
    let _ = self.tx.send(mutation);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<CacheMutation> {
    self.tx.subscribe()
  }
}

impl Default for MutationHook {
  fn default() -> Self {
    Self::new(1000)
  }
}
