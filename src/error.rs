//! Error types for invalidation propagation

use std::time::Duration;

/// Broker unreachable or a publish/subscribe call failed.
///
/// Recovered by the connection manager's reconnect loop; never surfaced to
/// the code performing the cache mutation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
  #[error("no broker session available")]
  NotConnected,

  #[error("connection manager is closed")]
  Closed,

  #[error("broker call timed out after {0:?}")]
  Timeout(Duration),

  #[error("broker error: {0}")]
  Broker(String),
}

/// A message that could not be decoded into an invalidation event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedEventError {
  #[error("message truncated while reading {field}")]
  Truncated { field: &'static str },

  #[error("{field} is not valid UTF-8")]
  InvalidUtf8 { field: &'static str },

  #[error("unknown operation tag {0}")]
  UnknownOperation(u8),

  #[error("{field} presence does not match the operation")]
  InvalidPresence { field: &'static str },

  #[error("{field} length {len} exceeds the wire limit")]
  FieldTooLarge { field: &'static str, len: usize },

  #[error("{0} trailing bytes after event")]
  TrailingBytes(usize),
}

/// Top-level error for the propagation subsystem
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
  #[error(transparent)]
  Transport(#[from] TransportError),

  #[error("malformed event: {0}")]
  Malformed(#[from] MalformedEventError),

  #[error("configuration error: {0}")]
  Configuration(String),

  #[error("sequence generation failed: {0}")]
  Sequence(String),

  #[error("publication queue is full")]
  QueueFull,

  #[error("propagation service is not running")]
  NotRunning,
}

impl SyncError {
  pub fn config(msg: impl Into<String>) -> Self {
    SyncError::Configuration(msg.into())
  }

  /// Fatal errors stop propagation for this node until restart
  pub fn is_fatal(&self) -> bool {
    matches!(self, SyncError::Configuration(_) | SyncError::Sequence(_))
  }
}
