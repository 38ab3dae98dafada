//! Cross-cluster fan-out

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::event::InvalidationEvent;
use super::producer::InvalidationSender;
use super::topology::{ClusterTopology, PeerCluster};

/// Capability to fan an event out to peer clusters.
///
/// `arrived_from` names the cluster the event was received from, if it was
/// received rather than produced locally.
pub trait InvalidationPropagator: Send + Sync {
  /// Returns the number of peers the event was handed to
  fn propagate(&self, event: &InvalidationEvent, arrived_from: Option<&str>) -> usize;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatcherStats {
  pub relayed: u64,
  pub failed: u64,
}

pub struct Dispatcher {
  topology: ClusterTopology,
  sender: Arc<dyn InvalidationSender>,
  relayed: AtomicU64,
  failed: AtomicU64,
}

impl Dispatcher {
  pub fn new(topology: ClusterTopology, sender: Arc<dyn InvalidationSender>) -> Self {
    Self {
      topology,
      sender,
      relayed: AtomicU64::new(0),
      failed: AtomicU64::new(0),
    }
  }

  pub fn topology(&self) -> &ClusterTopology {
    &self.topology
  }

  /// Peers that should receive `event`: never its origin cluster, never
  /// the cluster it arrived from, never ourselves.
  pub fn targets<'a>(
    &'a self,
    event: &InvalidationEvent,
    arrived_from: Option<&str>,
  ) -> impl Iterator<Item = &'a PeerCluster> + 'a {
    let origin = event.origin_cluster_id.clone();
    let arrived_from = arrived_from.map(str::to_string);
    let local = self.topology.local_cluster();
    self.topology.peers().iter().filter(move |peer| {
      peer.id != origin && peer.id != local && arrived_from.as_deref() != Some(peer.id.as_str())
    })
  }

  pub fn on_local_or_relayed_event(
    &self,
    event: &InvalidationEvent,
    arrived_from: Option<&str>,
  ) -> usize {
    let mut sent = 0;
    let local = self.topology.local_cluster();
    for peer in self.targets(event, arrived_from) {
      let channel = peer.channel_for(&event.cache_name, local);
      match self.sender.send(event, &channel) {
        Ok(()) => {
          sent += 1;
          tracing::trace!(
            peer = %peer.id,
            channel = %channel,
            origin = %event.origin_node_id,
            sequence = event.sequence_number,
            "Relayed invalidation"
          );
        }
        Err(e) => {
          self.failed.fetch_add(1, Ordering::Relaxed);
          tracing::warn!(
            peer = %peer.id,
            origin = %event.origin_node_id,
            sequence = event.sequence_number,
            error = %e,
            "Relay to peer cluster failed"
          );
        }
      }
    }
    self.relayed.fetch_add(sent as u64, Ordering::Relaxed);
    sent
  }

  pub fn stats(&self) -> DispatcherStats {
    DispatcherStats {
      relayed: self.relayed.load(Ordering::Relaxed),
      failed: self.failed.load(Ordering::Relaxed),
    }
  }
}

impl InvalidationPropagator for Dispatcher {
  fn propagate(&self, event: &InvalidationEvent, arrived_from: Option<&str>) -> usize {
    self.on_local_or_relayed_event(event, arrived_from)
  }
}
