use batchflow_core::{BatchNumber, RequestId, RequestStatus};
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle of one dispatch attempt, owned by the coordinator.
///
/// A record is created when a batch is admitted, lives in the in-flight map
/// while its task runs, and is dropped once the attempt is accounted for.
#[derive(Debug, Clone)]
pub struct RequestRecord {
  pub batch_number: BatchNumber,
  pub request_id: RequestId,
  /// 1-based attempt number
  pub attempt: u32,
  pub status: RequestStatus,
  pub started_at: Option<Instant>,
  pub ended_at: Option<Instant>,
}

impl RequestRecord {
  pub fn new(batch_number: BatchNumber, request_id: RequestId, attempt: u32) -> Self {
    Self {
      batch_number,
      request_id,
      attempt,
      status: RequestStatus::Pending,
      started_at: None,
      ended_at: None,
    }
  }

  pub(crate) fn transition(&mut self, next: RequestStatus, at: Instant) {
    debug_assert!(
      self.status.can_transition_to(next),
      "invalid transition {} -> {} for {}",
      self.status,
      next,
      self.request_id
    );
    if next == RequestStatus::InFlight {
      self.started_at = Some(at);
    } else if next.is_terminal() {
      self.ended_at = Some(at);
    }
    self.status = next;
  }

  /// `ended_at - started_at`, once the attempt has both
  pub fn duration(&self) -> Option<Duration> {
    Some(self.ended_at?.saturating_duration_since(self.started_at?))
  }

  pub fn duration_millis(&self) -> u64 {
    self.duration().map(|d| d.as_millis() as u64).unwrap_or(0)
  }
}
