//! Wire encoding for invalidation events
//!
//! Fields appear in this order, integers big-endian:
//!
//! ```text
//! cache_name         u32 len | utf-8
//! key                u8 present | [u32 len | bytes]
//! operation          u8 (0 = REMOVE, 1 = UPDATE, 2 = CLEAR_ALL)
//! value              u8 present | [u32 len | bytes]
//! origin_node_id     u32 len | utf-8
//! origin_cluster_id  u32 len | utf-8
//! sequence_number    u64
//! timestamp          i64 (epoch millis)
//! ```
//!
//! Key and value carry an explicit presence byte because the key precedes
//! the operation tag on the wire.

use crate::error::MalformedEventError;

use super::event::{InvalidationEvent, Operation};

/// Upper bound for any single length-prefixed field
pub const MAX_FIELD_LEN: usize = 64 * 1024 * 1024;

pub fn encode(event: &InvalidationEvent) -> Result<Vec<u8>, MalformedEventError> {
  if !event.is_well_formed() {
    let field = match event.operation {
      Operation::ClearAll if event.key.is_some() => "key",
      Operation::Remove | Operation::Update if event.key.is_none() => "key",
      _ => "value",
    };
    return Err(MalformedEventError::InvalidPresence { field });
  }

  let mut buf = Vec::with_capacity(
    48 + event.cache_name.len()
      + event.key.as_ref().map_or(0, Vec::len)
      + event.value.as_ref().map_or(0, Vec::len)
      + event.origin_node_id.len()
      + event.origin_cluster_id.len(),
  );

  put_bytes(&mut buf, "cache_name", event.cache_name.as_bytes())?;
  put_optional(&mut buf, "key", event.key.as_deref())?;
  buf.push(event.operation.tag());
  put_optional(&mut buf, "value", event.value.as_deref())?;
  put_bytes(&mut buf, "origin_node_id", event.origin_node_id.as_bytes())?;
  put_bytes(&mut buf, "origin_cluster_id", event.origin_cluster_id.as_bytes())?;
  buf.extend_from_slice(&event.sequence_number.to_be_bytes());
  buf.extend_from_slice(&event.timestamp.to_be_bytes());

  Ok(buf)
}

pub fn decode(data: &[u8]) -> Result<InvalidationEvent, MalformedEventError> {
  let mut reader = Reader { data, pos: 0 };

  let cache_name = reader.string("cache_name")?;
  let key = reader.optional("key")?;
  let tag = reader.u8("operation")?;
  let operation = Operation::from_tag(tag).ok_or(MalformedEventError::UnknownOperation(tag))?;
  let value = reader.optional("value")?;
  let origin_node_id = reader.string("origin_node_id")?;
  let origin_cluster_id = reader.string("origin_cluster_id")?;
  let sequence_number = u64::from_be_bytes(reader.array("sequence_number")?);
  let timestamp = i64::from_be_bytes(reader.array("timestamp")?);

  let remaining = data.len() - reader.pos;
  if remaining > 0 {
    return Err(MalformedEventError::TrailingBytes(remaining));
  }

  let event = InvalidationEvent {
    cache_name,
    key,
    operation,
    value,
    origin_node_id,
    origin_cluster_id,
    sequence_number,
    timestamp,
  };

  match operation {
    Operation::ClearAll if event.key.is_some() => {
      Err(MalformedEventError::InvalidPresence { field: "key" })
    }
    Operation::Remove | Operation::Update if event.key.is_none() => {
      Err(MalformedEventError::InvalidPresence { field: "key" })
    }
    _ if !event.is_well_formed() => Err(MalformedEventError::InvalidPresence { field: "value" }),
    _ => Ok(event),
  }
}

fn put_bytes(
  buf: &mut Vec<u8>,
  field: &'static str,
  bytes: &[u8],
) -> Result<(), MalformedEventError> {
  if bytes.len() > MAX_FIELD_LEN {
    return Err(MalformedEventError::FieldTooLarge {
      field,
      len: bytes.len(),
    });
  }
  buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
  buf.extend_from_slice(bytes);
  Ok(())
}

fn put_optional(
  buf: &mut Vec<u8>,
  field: &'static str,
  bytes: Option<&[u8]>,
) -> Result<(), MalformedEventError> {
  match bytes {
    Some(bytes) => {
      buf.push(1);
      put_bytes(buf, field, bytes)
    }
    None => {
      buf.push(0);
      Ok(())
    }
  }
}

struct Reader<'a> {
  data: &'a [u8],
  pos: usize,
}

impl<'a> Reader<'a> {
  fn take(&mut self, field: &'static str, n: usize) -> Result<&'a [u8], MalformedEventError> {
    let end = self
      .pos
      .checked_add(n)
      .filter(|end| *end <= self.data.len())
      .ok_or(MalformedEventError::Truncated { field })?;
    let slice = &self.data[self.pos..end];
    self.pos = end;
    Ok(slice)
  }

  fn array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], MalformedEventError> {
    let mut out = [0u8; N];
    out.copy_from_slice(self.take(field, N)?);
    Ok(out)
  }

  fn u8(&mut self, field: &'static str) -> Result<u8, MalformedEventError> {
    Ok(self.take(field, 1)?[0])
  }

  fn bytes(&mut self, field: &'static str) -> Result<&'a [u8], MalformedEventError> {
    let len = u32::from_be_bytes(self.array(field)?) as usize;
    if len > MAX_FIELD_LEN {
      return Err(MalformedEventError::FieldTooLarge { field, len });
    }
    self.take(field, len)
  }

  fn string(&mut self, field: &'static str) -> Result<String, MalformedEventError> {
    let bytes = self.bytes(field)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| MalformedEventError::InvalidUtf8 { field })
  }

  fn optional(&mut self, field: &'static str) -> Result<Option<Vec<u8>>, MalformedEventError> {
    match self.u8(field)? {
      0 => Ok(None),
      1 => Ok(Some(self.bytes(field)?.to_vec())),
      _ => Err(MalformedEventError::InvalidPresence { field }),
    }
  }
}
