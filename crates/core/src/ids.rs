//! Batch numbers and request ids.
//!
//! Ids come from an [`IdGenerator`] owned by whoever builds the orchestrator,
//! so tests can start the counters at known values and two orchestrators in
//! the same process never share a sequence by accident.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Number assigned to a batch when it is enqueued (newtype for type safety)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchNumber(u64);

impl BatchNumber {
  pub fn new(value: u64) -> Self {
    Self(value)
  }

  pub fn get(&self) -> u64 {
    self.0
  }
}

impl std::fmt::Display for BatchNumber {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "batch-{}", self.0)
  }
}

/// Id of a single dispatch attempt. Every attempt of a batch gets a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
  pub fn new(value: u64) -> Self {
    Self(value)
  }

  pub fn get(&self) -> u64 {
    self.0
  }
}

impl std::fmt::Display for RequestId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "req-{}", self.0)
  }
}

/// Monotonic source of batch numbers and request ids.
///
/// Lock-free; safe to share behind an `Arc` between callers that enqueue
/// concurrently. Counters are never reset, so an id is never handed out twice
/// by the same generator.
#[derive(Debug)]
pub struct IdGenerator {
  next_batch: AtomicU64,
  next_request: AtomicU64,
}

impl IdGenerator {
  /// Both sequences start at 1.
  pub fn new() -> Self {
    Self::starting_at(1, 1)
  }

  pub fn starting_at(first_batch: u64, first_request: u64) -> Self {
    Self {
      next_batch: AtomicU64::new(first_batch),
      next_request: AtomicU64::new(first_request),
    }
  }

  pub fn next_batch_number(&self) -> BatchNumber {
    BatchNumber(self.next_batch.fetch_add(1, Ordering::Relaxed))
  }

  pub fn next_request_id(&self) -> RequestId {
    RequestId(self.next_request.fetch_add(1, Ordering::Relaxed))
  }

  /// Reserve `count` consecutive batch numbers in one step.
  ///
  /// Keeps the numbers of one enqueue call contiguous even when other callers
  /// enqueue at the same time.
  pub fn reserve_batch_numbers(&self, count: usize) -> impl Iterator<Item = BatchNumber> + use<> {
    let first = self.next_batch.fetch_add(count as u64, Ordering::Relaxed);
    (first..first + count as u64).map(BatchNumber)
  }
}

impl Default for IdGenerator {
  fn default() -> Self {
    Self::new()
  }
}
