//! Fixed set of long-lived workers that run dispatched tasks.
//!
//! Workers share one job queue. A job carries the epoch it was launched in
//! and an abandon signal; a worker skips jobs from an older epoch and drops a
//! running task as soon as its abandon signal fires (the coordinator fires it
//! by dropping the sender when the attempt is finished, timed out or
//! cleared).

use crate::task::{BoxTask, CompletionMessage, Outcome, panic_message};
use batchflow_core::{BatchNumber, FailureCause, RequestId};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

pub(crate) struct Job {
  pub request_id: RequestId,
  pub batch_number: BatchNumber,
  pub epoch: u64,
  pub task: BoxTask,
  pub abandon: oneshot::Receiver<()>,
  /// Used to report a panicking task as failed
  pub completions: mpsc::UnboundedSender<CompletionMessage>,
}

pub(crate) struct WorkerPool {
  tx: Option<mpsc::UnboundedSender<Job>>,
  rx: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
  epoch: Arc<AtomicU64>,
  workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
  pub fn new(size: usize, epoch: Arc<AtomicU64>) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut pool = Self {
      tx: Some(tx),
      rx: Arc::new(Mutex::new(rx)),
      epoch,
      workers: Vec::new(),
    };
    pool.grow_to(size.max(1));
    pool
  }

  /// Spawn workers until there are `size` of them. Never shrinks.
  pub fn grow_to(&mut self, size: usize) {
    if self.tx.is_none() {
      return;
    }
    while self.workers.len() < size {
      let id = self.workers.len();
      let rx = Arc::clone(&self.rx);
      let epoch = Arc::clone(&self.epoch);
      self.workers.push(tokio::spawn(worker_loop(id, rx, epoch)));
    }
    debug!(workers = self.workers.len(), "Worker pool size");
  }

  pub fn size(&self) -> usize {
    self.workers.len()
  }

  /// Queue a job. Hands the job back if the pool is closed.
  pub fn submit(&self, job: Job) -> Result<(), Job> {
    match &self.tx {
      Some(tx) => tx.send(job).map_err(|e| e.0),
      None => Err(job),
    }
  }

  /// Stop accepting jobs and hand back the worker handles. Workers exit once
  /// the queue is empty.
  pub fn close(&mut self) -> Vec<JoinHandle<()>> {
    self.tx = None;
    std::mem::take(&mut self.workers)
  }
}

async fn worker_loop(id: usize, rx: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>, epoch: Arc<AtomicU64>) {
  loop {
    let job = {
      let mut rx = rx.lock().await;
      rx.recv().await
    };
    let Some(mut job) = job else {
      break;
    };

    if job.epoch != epoch.load(Ordering::Acquire) {
      debug!(worker = id, request_id = %job.request_id, "Skipping job cleared before it started");
      continue;
    }

    tokio::select! {
      result = AssertUnwindSafe(&mut job.task).catch_unwind() => {
        if let Err(payload) = result {
          let msg = panic_message(payload.as_ref());
          warn!(worker = id, request_id = %job.request_id, "Task panicked: {}", msg);
          let _ = job.completions.send(CompletionMessage {
            request_id: job.request_id,
            batch_number: job.batch_number,
            epoch: Some(job.epoch),
            outcome: Outcome::Failure(FailureCause::Transient(format!("task panicked: {msg}"))),
            reported_at: Instant::now(),
          });
        }
      }
      _ = &mut job.abandon => {
        debug!(worker = id, request_id = %job.request_id, "Abandoned task");
      }
    }
  }
  debug!(worker = id, "Worker exiting");
}
