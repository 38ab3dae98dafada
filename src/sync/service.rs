//! Propagation service lifecycle
//!
//! Wires the connection manager, producer, consumer and dispatcher for one
//! node and owns their background tasks. Construct it explicitly and share
//! it; there is no global instance.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::broker::{self, Broker};
use super::connection::{ConnectionManager, ConnectionState};
use super::consumer::{Consumer, ConsumerStats};
use super::dispatcher::{Dispatcher, DispatcherStats, InvalidationPropagator};
use super::event::{channel_name, relay_channel_name, InvalidationEvent, NodeIdentity};
use super::producer::{InvalidationSender, Producer, ProducerStats};
use super::sequence::SequenceGenerator;
use super::topology::{ClusterTopology, PeerCluster};
use crate::cache::CacheManager;
use crate::config::SyncConfig;
use crate::error::SyncError;

/// Point-in-time health snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
  pub node_id: String,
  pub cluster_id: String,
  pub running: bool,
  pub connection: ConnectionState,
  pub subscriptions: Vec<String>,
  pub peers: Vec<String>,
  pub producer: ProducerStats,
  pub consumer: ConsumerStats,
  pub dispatcher: Option<DispatcherStats>,
}

struct Running {
  connection: ConnectionManager,
  producer: Arc<Producer>,
  consumer: Arc<Consumer>,
  dispatcher: Option<Arc<Dispatcher>>,
  subscriptions: Vec<String>,
  publisher: JoinHandle<()>,
  observer: JoinHandle<()>,
  shutdown_tx: watch::Sender<bool>,
}

pub struct PropagationService {
  config: SyncConfig,
  identity: NodeIdentity,
  topology: ClusterTopology,
  caches: Arc<CacheManager>,
  broker: Arc<dyn Broker>,
  running: Mutex<Option<Running>>,
}

impl PropagationService {
  pub fn new(mut config: SyncConfig, caches: Arc<CacheManager>, broker: Arc<dyn Broker>) -> Self {
    config.ensure_node_id();
    let identity = NodeIdentity::new(config.node.id.clone(), config.node.cluster.clone());
    let topology = config.topology();
    Self {
      config,
      identity,
      topology,
      caches,
      broker,
      running: Mutex::new(None),
    }
  }

  /// Build the broker from `broker.url`
  pub fn from_config(mut config: SyncConfig, caches: Arc<CacheManager>) -> Result<Self, SyncError> {
    let client_id = config.ensure_node_id().to_string();
    let broker = broker::from_url(
      &config.broker.url,
      config.broker.connect_timeout(),
      &client_id,
    )?;
    Ok(Self::new(config, caches, broker))
  }

  pub fn identity(&self) -> &NodeIdentity {
    &self.identity
  }

  pub fn config(&self) -> &SyncConfig {
    &self.config
  }

  pub fn caches(&self) -> &Arc<CacheManager> {
    &self.caches
  }

  pub fn is_running(&self) -> bool {
    self.running.lock().is_some()
  }

  /// Channels this node consumes. For each configured cache: its own
  /// cluster's channel and the relay channels peers hand events over on.
  /// Extra inbound channels follow.
  pub fn subscription_channels(&self) -> Vec<String> {
    let cluster = &self.identity.cluster_id;
    let mut channels: Vec<String> = self
      .config
      .propagation
      .caches
      .iter()
      .flat_map(|cache| {
        [
          channel_name(cache, cluster),
          relay_channel_name(cache, cluster, "*"),
        ]
      })
      .collect();
    for inbound in &self.config.topology.inbound {
      if !channels.contains(inbound) {
        channels.push(inbound.clone());
      }
    }
    channels
  }

  /// Start propagation.
  ///
  /// Does nothing when propagation is disabled. Invalid configuration is
  /// fatal and nothing is started.
  pub async fn start(&self) -> Result<(), SyncError> {
    if !self.config.propagation.enabled {
      tracing::info!("Cache invalidation propagation is disabled");
      return Ok(());
    }
    if let Err(e) = self.config.validate() {
      tracing::error!(error = %e, "Refusing to start cache invalidation propagation");
      return Err(e);
    }

    let mut running = self.running.lock();
    if running.is_some() {
      return Ok(());
    }

    let sequence = SequenceGenerator::seeded()?;
    let connection = ConnectionManager::new(
      self.broker.clone(),
      self.config.broker.backoff(),
      self.config.broker.publish_timeout(),
    );
    connection.start();

    let (producer, worker) = Producer::new(
      self.identity.clone(),
      sequence,
      connection.clone(),
      self.config.propagation.queue_capacity,
    );
    let publisher = tokio::spawn(worker.run());

    let dispatcher = if self.topology.has_peers() {
      let sender: Arc<dyn InvalidationSender> = producer.clone();
      Some(Arc::new(Dispatcher::new(self.topology.clone(), sender)))
    } else {
      None
    };
    let propagator = dispatcher
      .clone()
      .map(|d| d as Arc<dyn InvalidationPropagator>);

    let mut consumer = Consumer::new(self.identity.clone(), self.caches.clone());
    if self.config.propagation.relay_onward {
      if let Some(propagator) = &propagator {
        consumer = consumer.with_relay(propagator.clone());
      }
    }
    let consumer = Arc::new(consumer);

    let subscriptions = self.subscription_channels();
    for channel in &subscriptions {
      connection.subscribe(channel, consumer.clone());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let observer = tokio::spawn(producer.clone().observe(
      self.caches.subscribe_mutations(),
      propagator,
      shutdown_rx,
    ));

    tracing::info!(
      node = %self.identity.node_id,
      cluster = %self.identity.cluster_id,
      broker = %self.broker.describe(),
      subscriptions = ?subscriptions,
      peers = self.topology.peers().len(),
      "Cache invalidation propagation started"
    );

    *running = Some(Running {
      connection,
      producer,
      consumer,
      dispatcher,
      subscriptions,
      publisher,
      observer,
      shutdown_tx,
    });
    Ok(())
  }

  /// Stop publication, drain queued events, stop listeners and release the
  /// broker session, each bounded by the drain window.
  pub async fn stop(&self) {
    let running = self.running.lock().take();
    let Some(running) = running else {
      return;
    };
    let drain = self.config.propagation.drain_timeout();

    running.shutdown_tx.send_replace(true);
    running.producer.shutdown();
    if tokio::time::timeout(drain, running.observer).await.is_err() {
      tracing::warn!("Mutation observer did not stop within drain window");
    }

    let abort = running.publisher.abort_handle();
    if tokio::time::timeout(drain, running.publisher).await.is_err() {
      tracing::warn!("Publication queue not drained in time, dropping remaining events");
      abort.abort();
    }

    running.connection.close(drain).await;
    tracing::info!(
      node = %self.identity.node_id,
      "Cache invalidation propagation stopped"
    );
  }

  pub fn connection_state(&self) -> ConnectionState {
    self
      .running
      .lock()
      .as_ref()
      .map_or(ConnectionState::Disconnected, |r| r.connection.state())
  }

  /// Wait until the broker session is up, or `timeout` elapses
  pub async fn wait_connected(&self, timeout: Duration) -> bool {
    let connection = self.running.lock().as_ref().map(|r| r.connection.clone());
    match connection {
      Some(connection) => connection.wait_connected(timeout).await,
      None => false,
    }
  }

  /// Sender capability for hosting code, available while running
  pub fn sender(&self) -> Option<Arc<dyn InvalidationSender>> {
    self
      .running
      .lock()
      .as_ref()
      .map(|r| r.producer.clone() as Arc<dyn InvalidationSender>)
  }

  /// Propagator capability, available while running with peers configured
  pub fn propagator(&self) -> Option<Arc<dyn InvalidationPropagator>> {
    self
      .running
      .lock()
      .as_ref()
      .and_then(|r| r.dispatcher.clone())
      .map(|d| d as Arc<dyn InvalidationPropagator>)
  }

  /// Forward an arbitrary event to `target_cluster`, origin untouched
  pub fn request_forward(
    &self,
    event: &InvalidationEvent,
    target_cluster: &str,
  ) -> Result<(), SyncError> {
    let sender = self.sender().ok_or(SyncError::NotRunning)?;
    let local = self.topology.local_cluster();
    let channel = match self.topology.peer(target_cluster) {
      Some(peer) => peer.channel_for(&event.cache_name, local),
      None => PeerCluster::new(target_cluster).channel_for(&event.cache_name, local),
    };
    sender.send(event, &channel)
  }

  pub fn consumer(&self) -> Option<Arc<Consumer>> {
    self.running.lock().as_ref().map(|r| r.consumer.clone())
  }

  pub fn health(&self) -> HealthReport {
    let running = self.running.lock();
    let (connection, subscriptions, producer, consumer, dispatcher) = match running.as_ref() {
      Some(r) => (
        r.connection.state(),
        r.subscriptions.clone(),
        r.producer.stats(),
        r.consumer.stats(),
        r.dispatcher.as_ref().map(|d| d.stats()),
      ),
      None => (
        ConnectionState::Disconnected,
        Vec::new(),
        ProducerStats::default(),
        ConsumerStats::default(),
        None,
      ),
    };

    HealthReport {
      node_id: self.identity.node_id.clone(),
      cluster_id: self.identity.cluster_id.clone(),
      running: running.is_some(),
      connection,
      subscriptions,
      peers: self.topology.peers().iter().map(|p| p.id.clone()).collect(),
      producer,
      consumer,
      dispatcher,
    }
  }
}
