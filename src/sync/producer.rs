//! Producer side: local mutations to published events

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

use super::codec;
use super::connection::ConnectionManager;
use super::dispatcher::InvalidationPropagator;
use super::event::{channel_name, InvalidationEvent, NodeIdentity, Operation};
use super::sequence::SequenceGenerator;
use crate::cache::CacheMutation;
use crate::error::SyncError;

/// Capability to publish an already-built event on a given channel,
/// leaving its origin untouched.
pub trait InvalidationSender: Send + Sync {
  fn send(&self, event: &InvalidationEvent, channel: &str) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProducerStats {
  pub published: u64,
  pub forwarded: u64,
  pub dropped: u64,
  pub failed: u64,
  pub last_sequence: u64,
}

#[derive(Default)]
struct Counters {
  published: AtomicU64,
  forwarded: AtomicU64,
  dropped: AtomicU64,
  failed: AtomicU64,
}

struct Outbound {
  channel: String,
  payload: Vec<u8>,
  sequence: u64,
  forwarded: bool,
}

pub struct Producer {
  identity: NodeIdentity,
  sequence: SequenceGenerator,
  queue: Mutex<Option<mpsc::Sender<Outbound>>>,
  accepting: AtomicBool,
  counters: Arc<Counters>,
}

/// Drains the publication queue in order. Finishes once the producer has
/// been shut down and the queue is empty.
pub struct PublisherWorker {
  rx: mpsc::Receiver<Outbound>,
  connection: ConnectionManager,
  counters: Arc<Counters>,
}

impl Producer {
  pub fn new(
    identity: NodeIdentity,
    sequence: SequenceGenerator,
    connection: ConnectionManager,
    capacity: usize,
  ) -> (Arc<Self>, PublisherWorker) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let counters = Arc::new(Counters::default());
    let producer = Arc::new(Self {
      identity,
      sequence,
      queue: Mutex::new(Some(tx)),
      accepting: AtomicBool::new(true),
      counters: counters.clone(),
    });
    let worker = PublisherWorker {
      rx,
      connection,
      counters,
    };
    (producer, worker)
  }

  pub fn identity(&self) -> &NodeIdentity {
    &self.identity
  }

  fn sender(&self) -> Result<mpsc::Sender<Outbound>, SyncError> {
    if !self.accepting.load(Ordering::Acquire) {
      return Err(SyncError::NotRunning);
    }
    self.queue.lock().clone().ok_or(SyncError::NotRunning)
  }

  fn enqueue(&self, tx: &mpsc::Sender<Outbound>, outbound: Outbound) -> Result<(), SyncError> {
    match tx.try_send(outbound) {
      Ok(()) => Ok(()),
      Err(mpsc::error::TrySendError::Full(out)) => {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
          channel = %out.channel,
          sequence = out.sequence,
          "Publication queue full, dropping invalidation"
        );
        Err(SyncError::QueueFull)
      }
      Err(mpsc::error::TrySendError::Closed(_)) => Err(SyncError::NotRunning),
    }
  }

  /// Build, encode and queue an event for a mutation made on this node.
  ///
  /// Never waits on the broker. Sequence allocation and queueing happen
  /// under one lock, so events leave in sequence order.
  pub fn on_local_mutation(
    &self,
    cache_name: &str,
    key: Option<Vec<u8>>,
    operation: Operation,
    value: Option<Vec<u8>>,
  ) -> Result<InvalidationEvent, SyncError> {
    let tx = self.sender()?;

    let mut sequence = self.sequence.lock()?;
    let number = sequence.advance()?;
    let event = InvalidationEvent::build(&self.identity, number, cache_name, key, operation, value);
    let payload = codec::encode(&event)?;

    self.enqueue(
      &tx,
      Outbound {
        channel: channel_name(cache_name, &self.identity.cluster_id),
        payload,
        sequence: number,
        forwarded: false,
      },
    )?;
    drop(sequence);

    tracing::trace!(
      cache = %event.cache_name,
      key = %event.key_hex(),
      operation = %event.operation,
      sequence = number,
      "Queued local invalidation"
    );
    Ok(event)
  }

  /// Re-publish a relayed event on `channel` without touching its origin
  pub fn on_forward_request(
    &self,
    event: &InvalidationEvent,
    channel: &str,
  ) -> Result<(), SyncError> {
    let tx = self.sender()?;
    let payload = codec::encode(event)?;
    self.enqueue(
      &tx,
      Outbound {
        channel: channel.to_string(),
        payload,
        sequence: event.sequence_number,
        forwarded: true,
      },
    )
  }

  /// Stop accepting events; the worker drains what is already queued
  pub fn shutdown(&self) {
    self.accepting.store(false, Ordering::Release);
    self.queue.lock().take();
  }

  pub fn is_accepting(&self) -> bool {
    self.accepting.load(Ordering::Acquire)
  }

  pub fn stats(&self) -> ProducerStats {
    ProducerStats {
      published: self.counters.published.load(Ordering::Relaxed),
      forwarded: self.counters.forwarded.load(Ordering::Relaxed),
      dropped: self.counters.dropped.load(Ordering::Relaxed),
      failed: self.counters.failed.load(Ordering::Relaxed),
      last_sequence: self.sequence.last(),
    }
  }

  /// Feed local mutations from the cache hook into the producer, handing
  /// each produced event to `relay` for cross-cluster fan-out.
  pub async fn observe(
    self: Arc<Self>,
    mut mutations: broadcast::Receiver<CacheMutation>,
    relay: Option<Arc<dyn InvalidationPropagator>>,
    mut shutdown: watch::Receiver<bool>,
  ) {
    loop {
      tokio::select! {
        received = mutations.recv() => match received {
          Ok(mutation) if mutation.is_local() => {
            match self.on_local_mutation(
              &mutation.cache_name,
              mutation.key,
              mutation.operation,
              mutation.value,
            ) {
              Ok(event) => {
                if let Some(relay) = &relay {
                  relay.propagate(&event, None);
                }
              }
              Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, "Local invalidation not published");
              }
              Err(SyncError::NotRunning) => break,
              Err(e) => tracing::debug!(error = %e, "Local invalidation not published"),
            }
          }
          // Applied on behalf of a remote node
          Ok(_) => {}
          Err(broadcast::error::RecvError::Lagged(missed)) => {
            self.counters.dropped.fetch_add(missed, Ordering::Relaxed);
            tracing::warn!(missed, "Mutation observer lagged, invalidations lost");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        },
        _ = shutdown.changed() => break,
      }
    }
    tracing::debug!("Mutation observer stopped");
  }
}

impl InvalidationSender for Producer {
  fn send(&self, event: &InvalidationEvent, channel: &str) -> Result<(), SyncError> {
    self.on_forward_request(event, channel)
  }
}

impl PublisherWorker {
  pub async fn run(mut self) {
    while let Some(out) = self.rx.recv().await {
      match self.connection.publish(&out.channel, out.payload).await {
        Ok(()) => {
          let counter = if out.forwarded {
            &self.counters.forwarded
          } else {
            &self.counters.published
          };
          counter.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
          // No outbox: durability is the broker's concern
          self.counters.failed.fetch_add(1, Ordering::Relaxed);
          tracing::warn!(
            channel = %out.channel,
            sequence = out.sequence,
            error = %e,
            "Dropping invalidation after publish failure"
          );
        }
      }
    }
    tracing::debug!("Publisher worker drained");
  }
}
