//! Cache store implementation

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::events::{CacheMutation, MutationHook, MutationSource, Operation};

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
  pub keys: usize,
  pub hits: u64,
  pub misses: u64,
  pub remote_applied: u64,
}

impl CacheStats {
  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      0.0
    } else {
      self.hits as f64 / total as f64
    }
  }
}

/// A named cache holding opaque byte keys and values.
///
/// Every mutation reports itself through the owning manager's hook, tagged
/// with its [`MutationSource`]. Each operation is atomic per key.
#[async_trait]
pub trait CacheStore: Send + Sync {
  fn name(&self) -> &str;

  async fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

  async fn put_from(&self, key: Vec<u8>, value: Vec<u8>, source: MutationSource);

  /// Returns whether the key was present
  async fn remove_from(&self, key: &[u8], source: MutationSource) -> bool;

  /// Returns the number of entries dropped
  async fn clear_from(&self, source: MutationSource) -> usize;

  async fn len(&self) -> usize;

  async fn stats(&self) -> CacheStats;

  async fn put(&self, key: Vec<u8>, value: Vec<u8>) {
    self.put_from(key, value, MutationSource::Local).await
  }

  async fn remove(&self, key: &[u8]) -> bool {
    self.remove_from(key, MutationSource::Local).await
  }

  async fn clear_all(&self) -> usize {
    self.clear_from(MutationSource::Local).await
  }

  async fn contains(&self, key: &[u8]) -> bool {
    self.get(key).await.is_some()
  }

  async fn is_empty(&self) -> bool {
    self.len().await == 0
  }
}

/// In-memory cache store implementation
pub struct InMemoryCacheStore {
  name: String,
  data: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
  hook: MutationHook,
  hits: AtomicU64,
  misses: AtomicU64,
  remote_applied: AtomicU64,
}

impl InMemoryCacheStore {
  pub fn new(name: impl Into<String>, hook: MutationHook) -> Self {
    Self {
      name: name.into(),
      data: RwLock::new(HashMap::new()),
      hook,
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
      remote_applied: AtomicU64::new(0),
    }
  }

  fn emit_change(
    &self,
    key: Option<Vec<u8>>,
    operation: Operation,
    value: Option<Vec<u8>>,
    source: MutationSource,
  ) {
    if source == MutationSource::Remote {
      self.remote_applied.fetch_add(1, Ordering::Relaxed);
    }
    self.hook.emit(CacheMutation::new(
      &self.name, key, operation, value, source,
    ));
  }

  pub fn keys(&self) -> Vec<Vec<u8>> {
    self.data.read().keys().cloned().collect()
  }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
  fn name(&self) -> &str {
    &self.name
  }

  async fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
    let data = self.data.read();
    match data.get(key) {
      Some(value) => {
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(value.clone())
      }
      None => {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
      }
    }
  }

  // Mutations emit while still holding the write guard, so the hook sees
  // them in the order they were applied.

  async fn put_from(&self, key: Vec<u8>, value: Vec<u8>, source: MutationSource) {
    let mut data = self.data.write();
    data.insert(key.clone(), value.clone());
    self.emit_change(Some(key), Operation::Update, Some(value), source);
  }

  async fn remove_from(&self, key: &[u8], source: MutationSource) -> bool {
    let mut data = self.data.write();
    let removed = data.remove(key).is_some();
    // Propagate even when absent locally: peers may still hold the entry
    self.emit_change(Some(key.to_vec()), Operation::Remove, None, source);
    removed
  }

  async fn clear_from(&self, source: MutationSource) -> usize {
    let mut data = self.data.write();
    let dropped = data.len();
    data.clear();
    self.emit_change(None, Operation::ClearAll, None, source);
    dropped
  }

  async fn len(&self) -> usize {
    self.data.read().len()
  }

  async fn stats(&self) -> CacheStats {
    CacheStats {
      keys: self.data.read().len(),
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      remote_applied: self.remote_applied.load(Ordering::Relaxed),
    }
  }
}
