//! Daemon configuration
//!
//! Loaded from YAML (`cachesync.yaml`), with `$VAR` / `${VAR}` expansion
//! applied to the raw file before parsing. Every field has a default so a
//! partial file is valid; [`SyncConfig::validate`] rejects settings that
//! would make propagation unsafe to start.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::SyncError;
use crate::sync::connection::BackoffPolicy;
use crate::sync::topology::{ClusterTopology, PeerCluster};

/// Expand environment variables in a string.
/// Supports $VAR_NAME and ${VAR_NAME} syntax; unset variables expand to "".
fn expand_env_vars(input: &str) -> String {
  let mut out = String::with_capacity(input.len());
  let mut rest = input;

  while let Some(pos) = rest.find('$') {
    out.push_str(&rest[..pos]);
    let after = &rest[pos + 1..];

    if let Some(braced) = after.strip_prefix('{') {
      if let Some(end) = braced.find('}') {
        out.push_str(&std::env::var(&braced[..end]).unwrap_or_default());
        rest = &braced[end + 1..];
        continue;
      }
      out.push('$');
      rest = after;
      continue;
    }

    let name_len = if after.starts_with(|c: char| c.is_ascii_digit()) {
      0
    } else {
      after
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .count()
    };
    if name_len == 0 {
      out.push('$');
    } else {
      out.push_str(&std::env::var(&after[..name_len]).unwrap_or_default());
    }
    rest = &after[name_len..];
  }

  out.push_str(rest);
  out
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
  #[serde(default)]
  pub node: NodeSection,
  #[serde(default)]
  pub broker: BrokerSection,
  #[serde(default)]
  pub propagation: PropagationSection,
  #[serde(default)]
  pub topology: TopologySection,
  #[serde(default)]
  pub logging: LoggingSection,
}

/// Identity of this node and the cluster it belongs to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
  /// Unique node id; generated at startup when empty
  #[serde(default)]
  pub id: String,
  #[serde(default = "default_cluster")]
  pub cluster: String,
}

fn default_cluster() -> String {
  "default".into()
}

impl Default for NodeSection {
  fn default() -> Self {
    Self {
      id: String::new(),
      cluster: default_cluster(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSection {
  /// `redis://`, `rediss://` or `memory://<bus>`
  #[serde(default = "default_broker_url")]
  pub url: String,

  #[serde(default = "default_connect_timeout_ms")]
  pub connect_timeout_ms: u64,

  /// Upper bound on a single publish call
  #[serde(default = "default_publish_timeout_ms")]
  pub publish_timeout_ms: u64,

  #[serde(default = "default_backoff_initial_ms")]
  pub backoff_initial_ms: u64,

  #[serde(default = "default_backoff_max_ms")]
  pub backoff_max_ms: u64,
}

fn default_broker_url() -> String {
  "redis://127.0.0.1:6379".into()
}
fn default_connect_timeout_ms() -> u64 {
  5000
}
fn default_publish_timeout_ms() -> u64 {
  2000
}
fn default_backoff_initial_ms() -> u64 {
  1000
}
fn default_backoff_max_ms() -> u64 {
  30000
}

impl Default for BrokerSection {
  fn default() -> Self {
    Self {
      url: default_broker_url(),
      connect_timeout_ms: default_connect_timeout_ms(),
      publish_timeout_ms: default_publish_timeout_ms(),
      backoff_initial_ms: default_backoff_initial_ms(),
      backoff_max_ms: default_backoff_max_ms(),
    }
  }
}

impl BrokerSection {
  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout_ms)
  }

  pub fn publish_timeout(&self) -> Duration {
    Duration::from_millis(self.publish_timeout_ms)
  }

  pub fn backoff(&self) -> BackoffPolicy {
    BackoffPolicy::new(
      Duration::from_millis(self.backoff_initial_ms),
      Duration::from_millis(self.backoff_max_ms),
    )
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationSection {
  /// Gates whether propagation starts at all
  #[serde(default)]
  pub enabled: bool,

  /// Cache names to consume invalidations for ("*" = every cache)
  #[serde(default = "default_caches")]
  pub caches: Vec<String>,

  /// Capacity of the outbound publication queue
  #[serde(default = "default_queue_capacity")]
  pub queue_capacity: usize,

  /// Bounded drain window used on shutdown
  #[serde(default = "default_drain_timeout_ms")]
  pub drain_timeout_ms: u64,

  /// Relay events from other clusters onward to the remaining peers
  #[serde(default)]
  pub relay_onward: bool,
}

fn default_caches() -> Vec<String> {
  vec!["*".into()]
}
fn default_queue_capacity() -> usize {
  1024
}
fn default_drain_timeout_ms() -> u64 {
  5000
}

impl Default for PropagationSection {
  fn default() -> Self {
    Self {
      enabled: false,
      caches: default_caches(),
      queue_capacity: default_queue_capacity(),
      drain_timeout_ms: default_drain_timeout_ms(),
      relay_onward: false,
    }
  }
}

impl PropagationSection {
  pub fn drain_timeout(&self) -> Duration {
    Duration::from_millis(self.drain_timeout_ms)
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologySection {
  #[serde(default)]
  pub peers: Vec<PeerSection>,

  /// Extra channels (or patterns) this node consumes, for peers that
  /// address this cluster through a custom channel template
  #[serde(default)]
  pub inbound: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSection {
  pub id: String,
  /// Channel template with a `{cache}` placeholder and an optional
  /// `{source}` placeholder. Templates ending in `.from.{source}` let the
  /// receiver see which cluster handed the event over. Defaults to
  /// `<cache>.<peer>.invalidation.from.<source>`.
  #[serde(default)]
  pub channel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
  #[serde(default = "default_level")]
  pub level: String,
}
fn default_level() -> String {
  "info".into()
}
impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: default_level(),
    }
  }
}

/// Identifiers end up inside dot-separated channel names and glob patterns
fn validate_identifier(what: &str, value: &str) -> Result<(), SyncError> {
  if value.is_empty() {
    return Err(SyncError::config(format!("{} must not be empty", what)));
  }
  if let Some(c) = value
    .chars()
    .find(|c| c.is_whitespace() || matches!(c, '.' | '*' | '?' | '[' | ']'))
  {
    return Err(SyncError::config(format!(
      "{} '{}' contains invalid character '{}'",
      what, value, c
    )));
  }
  Ok(())
}

impl SyncConfig {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
    let content = std::fs::read_to_string(&path)?;
    Self::from_yaml(&content)
  }

  pub fn from_yaml(content: &str) -> Result<Self, anyhow::Error> {
    let expanded = expand_env_vars(content);
    Ok(serde_yaml::from_str(&expanded)?)
  }

  pub fn find_and_load() -> Result<Option<Self>, anyhow::Error> {
    for p in ["cachesync.yaml", "cachesync.yml"] {
      if Path::new(p).exists() {
        tracing::info!("Loading config from {}", p);
        return Ok(Some(Self::from_file(p)?));
      }
    }
    Ok(None)
  }

  /// Fill in a generated node id if none was configured
  pub fn ensure_node_id(&mut self) -> &str {
    if self.node.id.is_empty() {
      self.node.id = uuid::Uuid::new_v4().to_string();
      tracing::info!(node = %self.node.id, "No node id configured, generated one");
    }
    &self.node.id
  }

  pub fn validate(&self) -> Result<(), SyncError> {
    if !self.node.id.is_empty() {
      validate_identifier("node id", &self.node.id)?;
    }
    validate_identifier("cluster id", &self.node.cluster)?;

    let scheme = self.broker.url.split("://").next().unwrap_or_default();
    if !self.broker.url.contains("://") || !matches!(scheme, "redis" | "rediss" | "memory") {
      return Err(SyncError::config(format!(
        "unsupported broker url '{}'",
        self.broker.url
      )));
    }

    if self.broker.connect_timeout_ms == 0 || self.broker.publish_timeout_ms == 0 {
      return Err(SyncError::config("broker timeouts must be greater than zero"));
    }
    if self.broker.backoff_initial_ms == 0
      || self.broker.backoff_initial_ms > self.broker.backoff_max_ms
    {
      return Err(SyncError::config(
        "backoff_initial_ms must be > 0 and <= backoff_max_ms",
      ));
    }

    if self.propagation.queue_capacity == 0 {
      return Err(SyncError::config("queue_capacity must be greater than zero"));
    }
    if self.propagation.caches.is_empty() {
      return Err(SyncError::config("at least one cache must be configured"));
    }
    for cache in &self.propagation.caches {
      if cache != "*" {
        validate_identifier("cache name", cache)?;
      }
    }

    let mut seen = HashSet::new();
    for peer in &self.topology.peers {
      validate_identifier("peer cluster id", &peer.id)?;
      if peer.id == self.node.cluster {
        return Err(SyncError::config(format!(
          "peer '{}' is the local cluster",
          peer.id
        )));
      }
      if !seen.insert(peer.id.as_str()) {
        return Err(SyncError::config(format!("duplicate peer '{}'", peer.id)));
      }
      if let Some(template) = &peer.channel {
        if !template.contains("{cache}") || template.chars().any(char::is_whitespace) {
          return Err(SyncError::config(format!(
            "channel template for peer '{}' must contain {{cache}} and no whitespace",
            peer.id
          )));
        }
      }
    }

    if self.topology.inbound.iter().any(|c| c.trim().is_empty()) {
      return Err(SyncError::config("inbound channels must not be empty"));
    }

    Ok(())
  }

  /// Static topology snapshot, read once at startup
  pub fn topology(&self) -> ClusterTopology {
    ClusterTopology::new(
      self.node.cluster.clone(),
      self
        .topology
        .peers
        .iter()
        .map(|p| PeerCluster {
          id: p.id.clone(),
          channel_template: p.channel.clone(),
        })
        .collect(),
    )
  }
}

/// Poll `loader` immediately and then every `interval` until it yields a
/// config. Returns `None` if `shutdown` flips to true first.
pub async fn wait_for_config<F, Fut>(
  mut loader: F,
  interval: Duration,
  mut shutdown: watch::Receiver<bool>,
) -> Option<SyncConfig>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<Option<SyncConfig>, anyhow::Error>>,
{
  loop {
    if *shutdown.borrow() {
      return None;
    }

    match loader().await {
      Ok(Some(config)) => return Some(config),
      Ok(None) => tracing::debug!("Configuration not available yet"),
      Err(e) => tracing::error!("Error while checking configuration: {}", e),
    }

    tokio::select! {
      _ = tokio::time::sleep(interval) => {}
      changed = shutdown.changed() => {
        if changed.is_err() || *shutdown.borrow() {
          return None;
        }
      }
    }
  }
}
