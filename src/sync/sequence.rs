//! Per-node sequence numbers

use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::SyncError;

/// Strictly increasing sequence numbers for one origin node.
///
/// Seeded from wall-clock microseconds so that a restarted node continues
/// above the watermarks remote consumers still hold for it. Any failure
/// halts the generator permanently; the node must be restarted.
pub struct SequenceGenerator {
  last: Mutex<u64>,
  halted: AtomicBool,
}

impl SequenceGenerator {
  /// Seed from the system clock
  pub fn seeded() -> Result<Self, SyncError> {
    let micros = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map_err(|e| SyncError::Sequence(format!("system clock before UNIX epoch: {}", e)))?
      .as_micros();
    let seed = u64::try_from(micros)
      .map_err(|_| SyncError::Sequence("system clock out of range".into()))?;
    Ok(Self::starting_after(seed))
  }

  /// The first allocated number will be `last + 1`
  pub fn starting_after(last: u64) -> Self {
    Self {
      last: Mutex::new(last),
      halted: AtomicBool::new(false),
    }
  }

  pub fn next(&self) -> Result<u64, SyncError> {
    self.lock()?.advance()
  }

  /// Hold the generator while the allocated number is handed off, so that
  /// allocation order and hand-off order agree.
  pub fn lock(&self) -> Result<SequenceGuard<'_>, SyncError> {
    if self.is_halted() {
      return Err(SyncError::Sequence("sequence generator halted".into()));
    }
    Ok(SequenceGuard {
      last: self.last.lock(),
      halted: &self.halted,
    })
  }

  pub fn is_halted(&self) -> bool {
    self.halted.load(Ordering::Acquire)
  }

  pub fn last(&self) -> u64 {
    *self.last.lock()
  }
}

pub struct SequenceGuard<'a> {
  last: MutexGuard<'a, u64>,
  halted: &'a AtomicBool,
}

impl SequenceGuard<'_> {
  pub fn advance(&mut self) -> Result<u64, SyncError> {
    match self.last.checked_add(1) {
      Some(next) => {
        *self.last = next;
        Ok(next)
      }
      None => {
        self.halted.store(true, Ordering::Release);
        tracing::error!("Sequence counter exhausted, halting publication");
        Err(SyncError::Sequence("sequence counter overflow".into()))
      }
    }
  }
}
