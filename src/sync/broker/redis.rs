//! Redis Streams broker
//!
//! Every channel is a stream key. Publishing appends with `XADD` (trimmed
//! to roughly `max_len` entries). Each node reads through its own consumer
//! group, named after its client id, so every node sees every entry and
//! the group's cursor survives disconnects: a node that reconnects resumes
//! where it stopped and also replays entries it had read but not yet
//! acknowledged.
//!
//! Glob subscriptions are resolved with `SCAN ... TYPE stream` and rescanned
//! periodically to pick up streams created later.

use ::redis::aio::{ConnectionManager, MultiplexedConnection};
use ::redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use ::redis::{AsyncCommands, Client, RedisError};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use super::{is_pattern, Broker, BrokerMessage, MessageStream};
use crate::error::{SyncError, TransportError};

const PAYLOAD_FIELD: &str = "payload";
const DEFAULT_MAX_LEN: usize = 10_000;
const READ_BLOCK: Duration = Duration::from_millis(1000);
const READ_COUNT: usize = 64;
const RESCAN_INTERVAL: Duration = Duration::from_secs(1);
const SCAN_COUNT: usize = 500;

fn transport(e: RedisError) -> TransportError {
  TransportError::Broker(e.to_string())
}

/// One entry read from a stream
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
  key: String,
  id: String,
  /// `None` when the entry was trimmed away while still pending
  payload: Option<Vec<u8>>,
}

fn entries(reply: StreamReadReply) -> Vec<Entry> {
  reply
    .keys
    .into_iter()
    .flat_map(|stream| {
      let key = stream.key;
      stream.ids.into_iter().map(move |entry| Entry {
        key: key.clone(),
        payload: entry.get::<Vec<u8>>(PAYLOAD_FIELD),
        id: entry.id,
      })
    })
    .collect()
}

/// Create the group on `key` at `start`, leaving an existing group alone
async fn join_group(
  conn: &mut MultiplexedConnection,
  key: &str,
  group: &str,
  start: &str,
) -> Result<(), RedisError> {
  match conn
    .xgroup_create_mkstream::<_, _, _, ()>(key, group, start)
    .await
  {
    Ok(()) => Ok(()),
    Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
    Err(e) => Err(e),
  }
}

/// Reads one subscription's streams through the node's consumer group
struct GroupReader {
  conn: MultiplexedConnection,
  group: String,
  pattern: Option<String>,
  keys: Vec<String>,
  buffered: VecDeque<Entry>,
  /// Handed out but not acknowledged. Acknowledged when the next entry is
  /// requested, which happens only after the handler is done with it.
  delivered: Option<Entry>,
  /// Re-read this consumer's pending entries before new ones
  replay: bool,
  last_scan: Instant,
}

impl GroupReader {
  async fn discover(&mut self, start: &str) -> Result<(), RedisError> {
    let Some(pattern) = &self.pattern else {
      return Ok(());
    };

    let mut found: Vec<String> = Vec::new();
    let mut cursor: u64 = 0;
    loop {
      let (next, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
        .arg(cursor)
        .arg("MATCH")
        .arg(pattern)
        .arg("COUNT")
        .arg(SCAN_COUNT)
        .arg("TYPE")
        .arg("stream")
        .query_async(&mut self.conn)
        .await?;
      found.extend(keys);
      if next == 0 {
        break;
      }
      cursor = next;
    }

    for key in found {
      if !self.keys.contains(&key) {
        join_group(&mut self.conn, &key, &self.group, start).await?;
        tracing::debug!(stream = %key, pattern = %pattern, "Joined stream");
        self.keys.push(key);
      }
    }
    self.last_scan = Instant::now();
    Ok(())
  }

  async fn ack(&mut self, entry: &Entry) -> Result<(), RedisError> {
    self
      .conn
      .xack::<_, _, _, ()>(&entry.key, &self.group, &[&entry.id])
      .await
  }

  async fn next(&mut self) -> Result<BrokerMessage, RedisError> {
    loop {
      if let Some(done) = self.delivered.take() {
        self.ack(&done).await?;
      }

      if let Some(entry) = self.buffered.pop_front() {
        match entry.payload.clone() {
          Some(payload) => {
            let message = BrokerMessage {
              channel: entry.key.clone(),
              payload,
            };
            self.delivered = Some(entry);
            return Ok(message);
          }
          None => {
            self.ack(&entry).await?;
            continue;
          }
        }
      }

      // Streams created after the subscription started are read in full
      if self.pattern.is_some() && self.last_scan.elapsed() >= RESCAN_INTERVAL {
        self.discover("0").await?;
      }
      if self.keys.is_empty() {
        tokio::time::sleep(READ_BLOCK).await;
        continue;
      }

      let cursor = if self.replay { "0" } else { ">" };
      let ids = vec![cursor; self.keys.len()];
      let options = StreamReadOptions::default()
        .group(&self.group, &self.group)
        .count(READ_COUNT)
        .block(READ_BLOCK.as_millis() as usize);
      let reply: Option<StreamReadReply> = self
        .conn
        .xread_options(&self.keys, &ids, &options)
        .await?;

      let read = reply.map(entries).unwrap_or_default();
      if self.replay && read.is_empty() {
        self.replay = false;
      }
      self.buffered.extend(read);
    }
  }
}

/// Publishes through a shared `ConnectionManager`; every subscription reads
/// on a dedicated connection, since blocking reads would stall it.
pub struct RedisBroker {
  client: Client,
  url: String,
  group: String,
  connect_timeout: Duration,
  max_len: usize,
  connection: Mutex<Option<ConnectionManager>>,
  /// Channels subscribed at least once; later subscriptions resume them
  subscribed: Mutex<HashSet<String>>,
}

impl RedisBroker {
  pub fn new(url: &str, connect_timeout: Duration, client_id: &str) -> Result<Self, SyncError> {
    let client =
      Client::open(url).map_err(|e| SyncError::config(format!("invalid redis url: {}", e)))?;
    Ok(Self {
      client,
      url: url.to_string(),
      group: client_id.to_string(),
      connect_timeout,
      max_len: DEFAULT_MAX_LEN,
      connection: Mutex::new(None),
      subscribed: Mutex::new(HashSet::new()),
    })
  }

  /// Approximate number of entries kept per stream
  pub fn with_max_len(mut self, max_len: usize) -> Self {
    self.max_len = max_len.max(1);
    self
  }

  pub fn group(&self) -> &str {
    &self.group
  }

  fn current(&self) -> Option<ConnectionManager> {
    self.connection.lock().clone()
  }

  async fn with_timeout<T, F>(&self, fut: F) -> Result<T, TransportError>
  where
    F: std::future::Future<Output = Result<T, RedisError>>,
  {
    tokio::time::timeout(self.connect_timeout, fut)
      .await
      .map_err(|_| TransportError::Timeout(self.connect_timeout))?
      .map_err(transport)
  }
}

#[async_trait]
impl Broker for RedisBroker {
  async fn connect(&self) -> Result<(), TransportError> {
    let mut conn = match self.current() {
      Some(conn) => conn,
      None => {
        self
          .with_timeout(ConnectionManager::new(self.client.clone()))
          .await?
      }
    };

    let ping = self
      .with_timeout(::redis::cmd("PING").query_async::<()>(&mut conn))
      .await;
    if let Err(e) = ping {
      *self.connection.lock() = None;
      return Err(e);
    }

    *self.connection.lock() = Some(conn);
    Ok(())
  }

  async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError> {
    let mut conn = self.current().ok_or(TransportError::NotConnected)?;
    conn
      .xadd_maxlen::<_, _, _, _, ()>(
        channel,
        StreamMaxlen::Approx(self.max_len),
        "*",
        &[(PAYLOAD_FIELD, payload)],
      )
      .await
      .map_err(transport)
  }

  async fn subscribe(&self, channel: &str) -> Result<MessageStream, TransportError> {
    if self.current().is_none() {
      return Err(TransportError::NotConnected);
    }
    let mut conn = self
      .with_timeout(
        self
          .client
          .get_multiplexed_async_connection_with_timeouts(
            READ_BLOCK + self.connect_timeout,
            self.connect_timeout,
          ),
      )
      .await?;

    // A first subscription starts at the stream tail; a resumed one keeps
    // the group's cursor
    let resuming = !self.subscribed.lock().insert(channel.to_string());
    let start = if resuming { "0" } else { "$" };

    let mut reader = GroupReader {
      conn: conn.clone(),
      group: self.group.clone(),
      pattern: None,
      keys: Vec::new(),
      buffered: VecDeque::new(),
      delivered: None,
      replay: true,
      last_scan: Instant::now(),
    };
    if is_pattern(channel) {
      reader.pattern = Some(channel.to_string());
      reader.discover(start).await.map_err(transport)?;
    } else {
      join_group(&mut conn, channel, &self.group, start)
        .await
        .map_err(transport)?;
      reader.keys.push(channel.to_string());
    }
    tracing::debug!(
      channel = %channel,
      group = %self.group,
      streams = reader.keys.len(),
      resuming,
      "Redis stream subscription established"
    );

    let channel = channel.to_string();
    let stream = futures_util::stream::unfold(reader, move |mut reader| {
      let channel = channel.clone();
      async move {
        match reader.next().await {
          Ok(message) => Some((message, reader)),
          Err(e) => {
            tracing::warn!(channel = %channel, error = %e, "Redis stream read failed");
            None
          }
        }
      }
    });

    Ok(stream.boxed())
  }

  async fn close(&self) {
    *self.connection.lock() = None;
  }

  fn describe(&self) -> String {
    // Strip credentials from the URL before it reaches logs
    match self.url.split_once('@') {
      Some((scheme_auth, host)) => {
        let scheme = scheme_auth.split("://").next().unwrap_or("redis");
        format!("{}://***@{}", scheme, host)
      }
      None => self.url.clone(),
    }
  }
}
