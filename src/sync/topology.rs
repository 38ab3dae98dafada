//! Static cross-cluster topology

use serde::{Deserialize, Serialize};

use super::event::relay_channel_name;

/// A peer cluster reachable through the shared broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCluster {
  pub id: String,
  /// Channel address with a `{cache}` placeholder and an optional
  /// `{source}` placeholder for the sending cluster. Defaults to
  /// `<cache>.<peer>.invalidation.from.<source>` when absent.
  pub channel_template: Option<String>,
}

impl PeerCluster {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      channel_template: None,
    }
  }

  pub fn with_channel(mut self, template: impl Into<String>) -> Self {
    self.channel_template = Some(template.into());
    self
  }

  /// Channel carrying `cache_name` invalidations from cluster `source`
  /// into this peer
  pub fn channel_for(&self, cache_name: &str, source: &str) -> String {
    match &self.channel_template {
      Some(template) => template
        .replace("{cache}", cache_name)
        .replace("{source}", source),
      None => relay_channel_name(cache_name, &self.id, source),
    }
  }
}

/// This cluster's identity plus its peers. Immutable once built; a changed
/// topology takes effect only with a new dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
  local_cluster: String,
  peers: Vec<PeerCluster>,
}

impl ClusterTopology {
  /// Peers equal to the local cluster and repeated peer ids are dropped
  pub fn new(local_cluster: impl Into<String>, peers: Vec<PeerCluster>) -> Self {
    let local_cluster = local_cluster.into();
    let mut unique: Vec<PeerCluster> = Vec::with_capacity(peers.len());
    for peer in peers {
      if peer.id != local_cluster && !unique.iter().any(|p| p.id == peer.id) {
        unique.push(peer);
      }
    }
    Self {
      local_cluster,
      peers: unique,
    }
  }

  /// Topology with no peers: nothing is ever relayed
  pub fn isolated(local_cluster: impl Into<String>) -> Self {
    Self::new(local_cluster, Vec::new())
  }

  pub fn local_cluster(&self) -> &str {
    &self.local_cluster
  }

  pub fn peers(&self) -> &[PeerCluster] {
    &self.peers
  }

  pub fn peer(&self, id: &str) -> Option<&PeerCluster> {
    self.peers.iter().find(|p| p.id == id)
  }

  pub fn has_peers(&self) -> bool {
    !self.peers.is_empty()
  }
}
