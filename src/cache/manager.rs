//! Registry of named caches sharing one mutation hook

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::events::{CacheMutation, MutationHook};
use super::store::{CacheStore, InMemoryCacheStore};

/// Owns the local caches of a node.
///
/// Caches are created lazily on first access. Every cache reports its
/// mutations through the same hook, which is what the producer observes.
pub struct CacheManager {
  caches: RwLock<HashMap<String, Arc<dyn CacheStore>>>,
  hook: MutationHook,
}

impl Default for CacheManager {
  fn default() -> Self {
    Self::new()
  }
}

impl CacheManager {
  pub fn new() -> Self {
    Self::with_hook(MutationHook::default())
  }

  pub fn with_hook(hook: MutationHook) -> Self {
    Self {
      caches: RwLock::new(HashMap::new()),
      hook,
    }
  }

  /// Get a cache by name, creating an in-memory one if missing
  pub fn cache(&self, name: &str) -> Arc<dyn CacheStore> {
    if let Some(cache) = self.caches.read().get(name) {
      return cache.clone();
    }

    self
      .caches
      .write()
      .entry(name.to_string())
      .or_insert_with(|| {
        Arc::new(InMemoryCacheStore::new(name, self.hook.clone())) as Arc<dyn CacheStore>
      })
      .clone()
  }

  /// Get a cache only if it already exists
  pub fn get(&self, name: &str) -> Option<Arc<dyn CacheStore>> {
    self.caches.read().get(name).cloned()
  }

  /// Register an externally implemented cache under its own name
  pub fn register(&self, cache: Arc<dyn CacheStore>) {
    self.caches.write().insert(cache.name().to_string(), cache);
  }

  pub fn names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.caches.read().keys().cloned().collect();
    names.sort();
    names
  }

  pub fn hook(&self) -> &MutationHook {
    &self.hook
  }

  pub fn subscribe_mutations(&self) -> broadcast::Receiver<CacheMutation> {
    self.hook.subscribe()
  }
}
