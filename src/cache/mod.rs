//! Local cache collaborator
//!
//! The propagation subsystem observes and drives caches through this API:
//! - `CacheStore`: get/put/remove/clear_all over opaque byte keys and values
//! - `MutationHook`: entry-event hook fired on every mutation, tagged with
//!   whether it was local or applied on behalf of a remote node
//! - `CacheManager`: named caches sharing one hook

mod events;
mod manager;
mod store;

pub use events::{CacheMutation, MutationHook, MutationSource, Operation};
pub use manager::CacheManager;
pub use store::{CacheStats, CacheStore, InMemoryCacheStore};
