//! Completion counters and duration statistics.
//!
//! The coordinator is the only writer. Every change is applied to a
//! [`Metrics`] value inside a `watch` channel in a single closure, so readers
//! on other threads always see a consistent snapshot: in particular
//! `succeeded + failed + timed_out == completed` holds for every snapshot.

use crate::lifecycle::LifecycleState;
use batchflow_core::{BatchNumber, BatchResult, RequestStatus};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::watch;

/// Point-in-time view of the orchestrator's counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct Metrics {
  pub state: LifecycleState,
  /// Batches enqueued since start or the last stop-and-clear
  pub total_batches: u64,
  /// Batches waiting for dispatch, including those waiting out the retry delay
  pub pending: usize,
  pub in_flight: usize,
  pub peak_in_flight: usize,
  pub max_in_flight: usize,
  pub succeeded: u64,
  /// Batches that failed on every allowed attempt
  pub failed: u64,
  /// Batches whose final attempt timed out
  pub timed_out: u64,
  pub completed: u64,
  /// Dispatch attempts, first tries and retries alike
  pub attempts: u64,
  pub retries: u64,
  pub total_duration_millis: u64,
  /// Duration of the final attempt of each completed batch
  pub durations_millis: HashMap<BatchNumber, u64>,
}

impl Metrics {
  pub fn avg_batch_duration_millis(&self) -> f64 {
    if self.completed == 0 {
      return 0.0;
    }
    self.total_duration_millis as f64 / self.completed as f64
  }

  pub fn batch_duration_by_id(&self, batch_number: BatchNumber) -> Option<u64> {
    self.durations_millis.get(&batch_number).copied()
  }

  /// Every enqueued batch has reached a terminal state
  pub fn is_drained(&self) -> bool {
    self.pending == 0 && self.in_flight == 0 && self.completed == self.total_batches
  }
}

/// Gauges owned by other parts of the coordinator, published alongside the counters
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Gauges {
  pub state: LifecycleState,
  pub pending: usize,
  pub in_flight: usize,
  pub peak_in_flight: usize,
  pub max_in_flight: usize,
}

pub(crate) struct CompletionAccumulator {
  tx: watch::Sender<Metrics>,
}

impl CompletionAccumulator {
  pub fn new() -> (Self, watch::Receiver<Metrics>) {
    let (tx, rx) = watch::channel(Metrics::default());
    (Self { tx }, rx)
  }

  pub fn add_total(&self, count: usize) {
    self.tx.send_modify(|m| m.total_batches += count as u64);
  }

  pub fn record_attempt(&self) {
    self.tx.send_modify(|m| m.attempts += 1);
  }

  pub fn record_retry(&self) {
    self.tx.send_modify(|m| m.retries += 1);
  }

  /// Count a terminal outcome. Called exactly once per batch.
  pub fn record_terminal(&self, result: &BatchResult) {
    self.tx.send_modify(|m| {
      match result.status {
        RequestStatus::Succeeded => m.succeeded += 1,
        RequestStatus::Failed => m.failed += 1,
        RequestStatus::Timeout => m.timed_out += 1,
        RequestStatus::Pending | RequestStatus::InFlight => return,
      }
      m.completed += 1;
      m.total_duration_millis += result.duration_millis;
      m.durations_millis.insert(result.batch_number, result.duration_millis);
    });
  }

  pub fn publish_gauges(&self, gauges: Gauges) {
    self.tx.send_if_modified(|m| {
      let changed = m.state != gauges.state
        || m.pending != gauges.pending
        || m.in_flight != gauges.in_flight
        || m.peak_in_flight != gauges.peak_in_flight
        || m.max_in_flight != gauges.max_in_flight;
      m.state = gauges.state;
      m.pending = gauges.pending;
      m.in_flight = gauges.in_flight;
      m.peak_in_flight = gauges.peak_in_flight;
      m.max_in_flight = gauges.max_in_flight;
      changed
    });
  }

  /// Zero every counter, keeping only the configured cap and the state.
  pub fn reset(&self) {
    self.tx.send_modify(|m| {
      *m = Metrics {
        state: m.state,
        max_in_flight: m.max_in_flight,
        ..Metrics::default()
      };
    });
  }
}
