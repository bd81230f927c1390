//! Per-request deadlines.
//!
//! Each launched attempt gets a timer task that, when it fires, reports a
//! [`FailureCause::Timeout`] through the same channel tasks use. The
//! coordinator treats that report like any other completion, so whichever of
//! the task or the timer reports first wins and the other is ignored.

use crate::task::{CompletionMessage, Outcome};
use batchflow_core::{BatchNumber, FailureCause, RequestId};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::trace;

pub(crate) struct TimeoutWatcher {
  tx: mpsc::UnboundedSender<CompletionMessage>,
}

impl TimeoutWatcher {
  pub fn new(tx: mpsc::UnboundedSender<CompletionMessage>) -> Self {
    Self { tx }
  }

  /// Arm a deadline `timeout` from now. Abort the returned handle once the
  /// attempt has completed.
  pub fn arm(&self, request_id: RequestId, batch_number: BatchNumber, epoch: u64, timeout: Duration) -> AbortHandle {
    let tx = self.tx.clone();
    let deadline = Instant::now() + timeout;

    tokio::spawn(async move {
      tokio::time::sleep_until(deadline).await;
      trace!(%request_id, "Deadline reached");
      let _ = tx.send(CompletionMessage {
        request_id,
        batch_number,
        epoch: Some(epoch),
        outcome: Outcome::Failure(FailureCause::Timeout),
        reported_at: Instant::now(),
      });
    })
    .abort_handle()
  }
}
