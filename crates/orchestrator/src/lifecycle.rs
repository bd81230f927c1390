use serde::{Deserialize, Serialize};

/// Lifecycle of an orchestrator.
///
/// `Idle -> Running` on enqueue, `Running -> Idle` once all work has drained,
/// `Running -> Stopping -> Idle` on stop-and-clear, and any state to
/// `Shutdown`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
  #[default]
  Idle,
  Running,
  Stopping,
  Shutdown,
}

impl LifecycleState {
  pub fn accepts_work(&self) -> bool {
    matches!(self, Self::Idle | Self::Running)
  }
}

impl std::fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Idle => "idle",
      Self::Running => "running",
      Self::Stopping => "stopping",
      Self::Shutdown => "shutdown",
    };
    f.write_str(s)
  }
}

/// What a stop-and-clear discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StopReport {
  /// Batches removed from the ready queue or the retry backlog
  pub cleared_pending: usize,
  /// In-flight attempts whose results will be ignored
  pub abandoned_in_flight: usize,
}
