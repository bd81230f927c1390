use crate::ids::{BatchNumber, RequestId};
use serde::{Deserialize, Serialize};

/// Status of one dispatch attempt.
///
/// Transitions: `Pending -> InFlight -> {Succeeded | Failed | Timeout}`.
/// `Failed` and `Timeout` go back to `Pending` when the batch is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
  Pending,
  InFlight,
  Succeeded,
  Failed,
  Timeout,
}

impl RequestStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Succeeded | Self::Failed | Self::Timeout)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::InFlight => "in_flight",
      Self::Succeeded => "succeeded",
      Self::Failed => "failed",
      Self::Timeout => "timeout",
    }
  }

  /// Whether `self -> next` is an allowed transition.
  pub fn can_transition_to(&self, next: RequestStatus) -> bool {
    use RequestStatus::*;
    matches!(
      (self, next),
      (Pending, InFlight)
        | (Pending, Failed)
        | (InFlight, Succeeded)
        | (InFlight, Failed)
        | (InFlight, Timeout)
        | (Failed, Pending)
        | (Timeout, Pending)
    )
  }
}

impl std::fmt::Display for RequestStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Why an attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailureCause {
  /// The task reported a failure. Eligible for retry.
  Transient(String),
  /// No completion arrived before the deadline. Eligible for retry.
  Timeout,
  /// The task factory failed before producing a task. Eligible for retry.
  Dispatch(String),
}

impl FailureCause {
  /// Terminal status of a batch whose last attempt failed with this cause.
  pub fn terminal_status(&self) -> RequestStatus {
    match self {
      Self::Timeout => RequestStatus::Timeout,
      Self::Transient(_) | Self::Dispatch(_) => RequestStatus::Failed,
    }
  }
}

impl std::fmt::Display for FailureCause {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Transient(msg) => write!(f, "task failed: {msg}"),
      Self::Timeout => f.write_str("timed out"),
      Self::Dispatch(msg) => write!(f, "dispatch failed: {msg}"),
    }
  }
}

/// Terminal outcome of a batch, handed to completion observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
  pub batch_number: BatchNumber,
  /// Id of the final attempt
  pub request_id: RequestId,
  pub status: RequestStatus,
  /// Number of retries performed before reaching `status`
  pub retry_count: u32,
  /// Duration of the final attempt
  pub duration_millis: u64,
  /// Cause of the final attempt's failure, if it failed
  #[serde(skip_serializing_if = "Option::is_none")]
  pub failure: Option<FailureCause>,
  /// Value supplied by the task on success
  #[serde(skip_serializing_if = "Option::is_none")]
  pub extra: Option<serde_json::Value>,
}

impl BatchResult {
  pub fn attempts(&self) -> u32 {
    self.retry_count + 1
  }

  pub fn is_success(&self) -> bool {
    self.status == RequestStatus::Succeeded
  }
}
