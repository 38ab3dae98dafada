//! Cache invalidation propagation between nodes and clusters.
//!
//! Local cache mutations are published as invalidation events over a
//! shared broker; every other node subscribed to the cluster's channels
//! applies them to its own copy of the cache.

pub mod cache;
pub mod config;
pub mod error;
pub mod sync;

pub use config::SyncConfig;
pub use error::{MalformedEventError, SyncError, TransportError};
pub use sync::{InvalidationEvent, PropagationService};
