//! Concurrency cap for in-flight batches.
//!
//! Owned by the coordinator task, which is the only writer, so plain integers
//! are enough. Capacity is checked before every launch and released on every
//! terminal or retried attempt; the coordinator dispatches the next ready
//! batch as soon as a slot is released.

use tracing::debug;

#[derive(Debug)]
pub struct AdmissionController {
  max_in_flight: usize,
  in_flight: usize,
  /// Highest in_flight value seen since the last reset
  peak: usize,
}

impl AdmissionController {
  /// `max_in_flight` is clamped to at least 1.
  pub fn new(max_in_flight: usize) -> Self {
    Self {
      max_in_flight: max_in_flight.max(1),
      in_flight: 0,
      peak: 0,
    }
  }

  /// Take a slot if one is free. Never blocks.
  pub fn try_admit(&mut self) -> bool {
    if self.in_flight >= self.max_in_flight {
      return false;
    }
    self.in_flight += 1;
    self.peak = self.peak.max(self.in_flight);
    true
  }

  /// Return a slot taken by [`try_admit`](Self::try_admit).
  pub fn release(&mut self) {
    debug_assert!(self.in_flight > 0, "release without matching admit");
    self.in_flight = self.in_flight.saturating_sub(1);
  }

  /// Change the cap. Work already admitted above a lowered cap is left to
  /// drain; no new slot is granted until in_flight drops below it.
  pub fn set_max_in_flight(&mut self, max_in_flight: usize) {
    let max_in_flight = max_in_flight.max(1);
    if max_in_flight < self.in_flight {
      debug!(
        in_flight = self.in_flight,
        max_in_flight, "Lowered admission cap below current in-flight count, draining"
      );
    }
    self.max_in_flight = max_in_flight;
  }

  /// Release every slot (used when all in-flight work is discarded).
  pub fn reset(&mut self) {
    self.in_flight = 0;
    self.peak = 0;
  }

  pub fn in_flight(&self) -> usize {
    self.in_flight
  }

  pub fn max_in_flight(&self) -> usize {
    self.max_in_flight
  }

  pub fn peak(&self) -> usize {
    self.peak
  }

  pub fn available(&self) -> usize {
    self.max_in_flight.saturating_sub(self.in_flight)
  }
}
