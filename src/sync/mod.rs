//! Cache invalidation propagation
//!
//! A local mutation flows through these pieces in order:
//!
//! ```text
//! CacheManager hook -> Producer -> ConnectionManager -> broker
//!                                                         |
//!          local cache <- Consumer <- ConnectionManager <-+
//!                              \-> Dispatcher -> Producer (peer channels)
//! ```
//!
//! Loops are prevented by self-origin filtering, per-origin sequence
//! watermarks, tagging remotely applied mutations so the producer ignores
//! them, and never relaying to an event's origin or arrival cluster.

pub mod broker;
pub mod codec;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod event;
pub mod producer;
pub mod sequence;
pub mod service;
pub mod topology;

pub use connection::{BackoffPolicy, ConnectionManager, ConnectionState, MessageHandler};
pub use consumer::{Consumer, ConsumerStats, Disposition};
pub use dispatcher::{Dispatcher, DispatcherStats, InvalidationPropagator};
pub use event::{channel_name, InvalidationEvent, NodeIdentity, Operation};
pub use producer::{InvalidationSender, Producer, ProducerStats, PublisherWorker};
pub use sequence::SequenceGenerator;
pub use service::{HealthReport, PropagationService};
pub use topology::{ClusterTopology, PeerCluster};
