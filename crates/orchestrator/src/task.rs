//! The seam between the orchestrator and the code that does the real work.
//!
//! A [`TaskFactory`] turns a dispatched batch into a future. The future runs
//! on the worker pool and reports its outcome through the [`Completion`]
//! handle it was given. The handle is consumed when used, so a task can
//! report at most once; a task that never reports is timed out.

use crate::error::DispatchError;
use batchflow_core::{Batch, BatchNumber, FailureCause, RequestId};
use futures::future::BoxFuture;
use std::any::Any;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Executable unit produced by a task factory
pub type BoxTask = BoxFuture<'static, ()>;

/// Everything a task factory gets for one dispatch attempt
pub struct DispatchRequest<T> {
  pub batch: Batch<T>,
  pub batch_number: BatchNumber,
  pub request_id: RequestId,
  /// 1 for the first attempt, incremented on every retry
  pub attempt: u32,
  pub completion: Completion,
}

/// Caller-supplied constructor of tasks.
///
/// Returning an error (or panicking) counts as a failed attempt without the
/// batch ever entering the in-flight set.
pub trait TaskFactory<T>: Send + Sync + 'static {
  fn create(&self, request: DispatchRequest<T>) -> Result<BoxTask, DispatchError>;
}

impl<T, F> TaskFactory<T> for F
where
  F: Fn(DispatchRequest<T>) -> Result<BoxTask, DispatchError> + Send + Sync + 'static,
{
  fn create(&self, request: DispatchRequest<T>) -> Result<BoxTask, DispatchError> {
    self(request)
  }
}

#[derive(Debug)]
pub(crate) enum Outcome {
  Success(Option<serde_json::Value>),
  Failure(FailureCause),
}

/// Report sent to the coordinator when an attempt ends
#[derive(Debug)]
pub(crate) struct CompletionMessage {
  pub request_id: RequestId,
  pub batch_number: BatchNumber,
  /// Epoch captured at launch; `None` for reports made by id through the
  /// orchestrator handle, which are matched on request id alone
  pub epoch: Option<u64>,
  pub outcome: Outcome,
  pub reported_at: Instant,
}

/// One-shot handle a task uses to report its outcome.
#[must_use = "a task that never reports its outcome is only finished by the timeout"]
#[derive(Debug)]
pub struct Completion {
  request_id: RequestId,
  batch_number: BatchNumber,
  epoch: u64,
  tx: mpsc::UnboundedSender<CompletionMessage>,
}

impl Completion {
  pub(crate) fn new(
    request_id: RequestId,
    batch_number: BatchNumber,
    epoch: u64,
    tx: mpsc::UnboundedSender<CompletionMessage>,
  ) -> Self {
    Self {
      request_id,
      batch_number,
      epoch,
      tx,
    }
  }

  pub fn request_id(&self) -> RequestId {
    self.request_id
  }

  pub fn batch_number(&self) -> BatchNumber {
    self.batch_number
  }

  /// Report success, optionally with a value passed through to the result.
  pub fn success(self, extra: Option<serde_json::Value>) {
    self.send(Outcome::Success(extra));
  }

  /// Report a failure. The batch is retried if it has retries left.
  pub fn failure(self, cause: impl Into<String>) {
    self.send(Outcome::Failure(FailureCause::Transient(cause.into())));
  }

  fn send(self, outcome: Outcome) {
    let message = CompletionMessage {
      request_id: self.request_id,
      batch_number: self.batch_number,
      epoch: Some(self.epoch),
      outcome,
      reported_at: Instant::now(),
    };
    if self.tx.send(message).is_err() {
      debug!(request_id = %self.request_id, "Orchestrator gone, dropping completion");
    }
  }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(msg) = payload.downcast_ref::<&str>() {
    (*msg).to_string()
  } else if let Some(msg) = payload.downcast_ref::<String>() {
    msg.clone()
  } else {
    "unknown panic".to_string()
  }
}
