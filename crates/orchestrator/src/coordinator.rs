//! The single task that owns all orchestrator state.
//!
//! Callers talk to it through [`Command`]s, tasks and deadline timers through
//! [`CompletionMessage`]s, and delayed retries come back on a requeue
//! channel. Messages are handled one at a time, so admission, the in-flight
//! map and the counters never need a lock.
//!
//! Stale reports are dropped before they touch any state: every report
//! carries the epoch of its launch (bumped by stop-and-clear and shutdown)
//! and must name a request that is still in the in-flight map. A request
//! leaves the map the first time it is reported on, so whichever of the task
//! or its deadline reports first decides the outcome.

use crate::accumulator::{CompletionAccumulator, Gauges};
use crate::admission::AdmissionController;
use crate::error::DispatchError;
use crate::lifecycle::{LifecycleState, StopReport};
use crate::pool::{Job, WorkerPool};
use crate::record::RequestRecord;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::task::{Completion, CompletionMessage, DispatchRequest, Outcome, TaskFactory, panic_message};
use crate::timeout::TimeoutWatcher;
use batchflow_core::{Batch, BatchNumber, BatchResult, FailureCause, IdGenerator, RequestId, RequestStatus};
use std::collections::{HashMap, VecDeque};
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Callback invoked once per terminal batch outcome
pub type CompletionObserver = Arc<dyn Fn(&BatchResult) + Send + Sync>;

pub(crate) enum Command<T> {
  Enqueue(Vec<(BatchNumber, Batch<T>)>),
  Complete(CompletionMessage),
  SetMaxInFlight(usize),
  SetTimeout(Duration),
  SetRequestDelay(Duration),
  SetMaxRetries(u32),
  Records(oneshot::Sender<Vec<RequestRecord>>),
  WhenIdle(oneshot::Sender<()>),
  StopAndClear(oneshot::Sender<StopReport>),
  Shutdown,
}

/// A batch waiting for (re)dispatch
struct PendingBatch<T> {
  batch_number: BatchNumber,
  batch: Batch<T>,
  retry_count: u32,
}

struct Active<T> {
  record: RequestRecord,
  pending: PendingBatch<T>,
  deadline: AbortHandle,
  // Dropping this tells the worker to abandon the task
  _abandon: oneshot::Sender<()>,
}

pub(crate) struct CoordinatorConfig<T> {
  pub factory: Arc<dyn TaskFactory<T>>,
  pub ids: Arc<IdGenerator>,
  pub max_in_flight: usize,
  pub timeout: Duration,
  pub retry: RetryPolicy,
  pub observer: Option<CompletionObserver>,
  pub results: broadcast::Sender<BatchResult>,
}

pub(crate) struct Coordinator<T> {
  factory: Arc<dyn TaskFactory<T>>,
  ids: Arc<IdGenerator>,
  timeout: Duration,
  retry: RetryPolicy,
  admission: AdmissionController,
  ready: VecDeque<PendingBatch<T>>,
  /// Retried batches waiting out the request delay
  delayed: HashMap<BatchNumber, AbortHandle>,
  active: HashMap<RequestId, Active<T>>,
  state: LifecycleState,
  epoch: u64,
  shared_epoch: Arc<AtomicU64>,
  pool: WorkerPool,
  timeouts: TimeoutWatcher,
  accumulator: CompletionAccumulator,
  observer: Option<CompletionObserver>,
  results: broadcast::Sender<BatchResult>,
  idle_waiters: Vec<oneshot::Sender<()>>,
  commands: mpsc::UnboundedReceiver<Command<T>>,
  completions_tx: mpsc::UnboundedSender<CompletionMessage>,
  completions_rx: mpsc::UnboundedReceiver<CompletionMessage>,
  requeue_tx: mpsc::UnboundedSender<(u64, PendingBatch<T>)>,
  requeue_rx: mpsc::UnboundedReceiver<(u64, PendingBatch<T>)>,
}

impl<T: Send + Sync + 'static> Coordinator<T> {
  /// Must be called from within a tokio runtime (spawns the worker pool).
  pub fn new(
    config: CoordinatorConfig<T>,
    accumulator: CompletionAccumulator,
    commands: mpsc::UnboundedReceiver<Command<T>>,
  ) -> Self {
    let (completions_tx, completions_rx) = mpsc::unbounded_channel();
    let (requeue_tx, requeue_rx) = mpsc::unbounded_channel();
    let shared_epoch = Arc::new(AtomicU64::new(0));
    let admission = AdmissionController::new(config.max_in_flight);
    let pool = WorkerPool::new(admission.max_in_flight(), Arc::clone(&shared_epoch));

    let coordinator = Self {
      factory: config.factory,
      ids: config.ids,
      timeout: config.timeout,
      retry: config.retry,
      admission,
      ready: VecDeque::new(),
      delayed: HashMap::new(),
      active: HashMap::new(),
      state: LifecycleState::Idle,
      epoch: 0,
      shared_epoch,
      pool,
      timeouts: TimeoutWatcher::new(completions_tx.clone()),
      accumulator,
      observer: config.observer,
      results: config.results,
      idle_waiters: Vec::new(),
      commands,
      completions_tx,
      completions_rx,
      requeue_tx,
      requeue_rx,
    };
    coordinator.publish();
    coordinator
  }

  pub async fn run(mut self) {
    info!(
      max_in_flight = self.admission.max_in_flight(),
      timeout_ms = self.timeout.as_millis() as u64,
      max_retries = self.retry.max_retries,
      "Orchestrator started"
    );

    loop {
      tokio::select! {
        command = self.commands.recv() => match command {
          Some(command) => {
            if self.handle_command(command).is_break() {
              break;
            }
          }
          None => {
            debug!("All orchestrator handles dropped");
            break;
          }
        },
        Some(message) = self.completions_rx.recv() => self.handle_completion(message),
        Some((epoch, pending)) = self.requeue_rx.recv() => self.handle_requeue(epoch, pending),
      }
      self.publish();
    }

    self.shutdown().await;
  }

  fn handle_command(&mut self, command: Command<T>) -> ControlFlow<()> {
    match command {
      Command::Enqueue(batches) => self.enqueue(batches),
      Command::Complete(message) => self.handle_completion(message),
      Command::SetMaxInFlight(max_in_flight) => {
        self.admission.set_max_in_flight(max_in_flight);
        self.pool.grow_to(self.admission.max_in_flight());
        info!(
          max_in_flight = self.admission.max_in_flight(),
          workers = self.pool.size(),
          "Updated in-flight limit"
        );
        self.pump();
      }
      Command::SetTimeout(timeout) => {
        debug!(?timeout, "Updated request timeout");
        self.timeout = timeout;
      }
      Command::SetRequestDelay(delay) => {
        debug!(?delay, "Updated request delay");
        self.retry.request_delay = delay;
      }
      Command::SetMaxRetries(max_retries) => {
        debug!(max_retries, "Updated retry limit");
        self.retry.max_retries = max_retries;
      }
      Command::Records(reply) => {
        let records = self.active.values().map(|a| a.record.clone()).collect();
        let _ = reply.send(records);
      }
      Command::WhenIdle(reply) => {
        if self.state == LifecycleState::Running {
          self.idle_waiters.push(reply);
        } else {
          let _ = reply.send(());
        }
      }
      Command::StopAndClear(reply) => {
        let report = self.stop_and_clear();
        let _ = reply.send(report);
      }
      Command::Shutdown => return ControlFlow::Break(()),
    }
    ControlFlow::Continue(())
  }

  fn enqueue(&mut self, batches: Vec<(BatchNumber, Batch<T>)>) {
    if batches.is_empty() {
      return;
    }
    if !self.state.accepts_work() {
      warn!(state = %self.state, count = batches.len(), "Rejecting batches");
      return;
    }

    let count = batches.len();
    self.accumulator.add_total(count);
    self.ready.extend(batches.into_iter().map(|(batch_number, batch)| PendingBatch {
      batch_number,
      batch,
      retry_count: 0,
    }));
    self.state = LifecycleState::Running;
    debug!(count, queued = self.ready.len(), "Enqueued batches");

    self.pump();
  }

  /// Launch ready batches while there is capacity.
  fn pump(&mut self) {
    while self.state == LifecycleState::Running && !self.ready.is_empty() && self.admission.try_admit() {
      if let Some(pending) = self.ready.pop_front() {
        self.launch(pending);
      }
    }
    self.check_idle();
  }

  /// Dispatch one admitted batch. The caller has already taken a slot.
  fn launch(&mut self, pending: PendingBatch<T>) {
    let request_id = self.ids.next_request_id();
    let batch_number = pending.batch_number;
    let attempt = pending.retry_count + 1;
    let mut record = RequestRecord::new(batch_number, request_id, attempt);
    self.accumulator.record_attempt();

    let request = DispatchRequest {
      batch: pending.batch.clone(),
      batch_number,
      request_id,
      attempt,
      completion: Completion::new(request_id, batch_number, self.epoch, self.completions_tx.clone()),
    };
    let factory = Arc::clone(&self.factory);
    let created = std::panic::catch_unwind(AssertUnwindSafe(|| factory.create(request)))
      .unwrap_or_else(|payload| Err(DispatchError::Panicked(panic_message(payload.as_ref()))));

    let task = match created {
      Ok(task) => task,
      Err(e) => {
        warn!(%batch_number, %request_id, attempt, "Dispatch failed: {}", e);
        self.admission.release();
        record.transition(RequestStatus::Failed, Instant::now());
        self.attempt_failed(pending, request_id, 0, FailureCause::Dispatch(e.to_string()));
        return;
      }
    };

    record.transition(RequestStatus::InFlight, Instant::now());
    let (abandon_tx, abandon_rx) = oneshot::channel();
    let job = Job {
      request_id,
      batch_number,
      epoch: self.epoch,
      task,
      abandon: abandon_rx,
      completions: self.completions_tx.clone(),
    };
    if self.pool.submit(job).is_err() {
      warn!(%batch_number, %request_id, "Worker pool closed, cannot launch");
      self.admission.release();
      self.attempt_failed(pending, request_id, 0, FailureCause::Dispatch("worker pool closed".into()));
      return;
    }

    let deadline = self.timeouts.arm(request_id, batch_number, self.epoch, self.timeout);
    debug!(%batch_number, %request_id, attempt, "Launched batch");
    self.active.insert(
      request_id,
      Active {
        record,
        pending,
        deadline,
        _abandon: abandon_tx,
      },
    );
  }

  fn handle_completion(&mut self, message: CompletionMessage) {
    let request_id = message.request_id;
    let Some(active) = self.active.get(&request_id) else {
      debug!(%request_id, "Ignoring completion for unknown or finished request");
      return;
    };
    if message.epoch.is_some_and(|epoch| epoch != self.epoch) {
      debug!(%request_id, "Ignoring completion from a cleared epoch");
      return;
    }
    if active.record.batch_number != message.batch_number {
      warn!(
        %request_id,
        expected = %active.record.batch_number,
        got = %message.batch_number,
        "Ignoring completion with mismatched batch number"
      );
      return;
    }
    let Some(mut active) = self.active.remove(&request_id) else {
      return;
    };

    active.deadline.abort();
    self.admission.release();

    match message.outcome {
      Outcome::Success(extra) => {
        active.record.transition(RequestStatus::Succeeded, message.reported_at);
        debug!(batch_number = %active.record.batch_number, %request_id, "Batch succeeded");
        self.finish(BatchResult {
          batch_number: active.record.batch_number,
          request_id,
          status: RequestStatus::Succeeded,
          retry_count: active.pending.retry_count,
          duration_millis: active.record.duration_millis(),
          failure: None,
          extra,
        });
      }
      Outcome::Failure(cause) => {
        let status = match cause {
          FailureCause::Timeout => {
            warn!(batch_number = %active.record.batch_number, %request_id, timeout = ?self.timeout, "Request timed out");
            RequestStatus::Timeout
          }
          _ => {
            debug!(batch_number = %active.record.batch_number, %request_id, "Attempt failed: {}", cause);
            RequestStatus::Failed
          }
        };
        active.record.transition(status, message.reported_at);
        let duration_millis = active.record.duration_millis();
        self.attempt_failed(active.pending, request_id, duration_millis, cause);
      }
    }

    self.pump();
  }

  /// Route a failed attempt through the retry policy.
  fn attempt_failed(
    &mut self,
    mut pending: PendingBatch<T>,
    request_id: RequestId,
    duration_millis: u64,
    cause: FailureCause,
  ) {
    match self.retry.on_failure(pending.retry_count) {
      RetryDecision::Retry { retry_count, delay } => {
        pending.retry_count = retry_count;
        self.accumulator.record_retry();
        debug!(batch_number = %pending.batch_number, retry_count, ?delay, "Retrying batch after {}", cause);
        if delay.is_zero() {
          self.ready.push_back(pending);
        } else {
          self.schedule_requeue(pending, delay);
        }
      }
      RetryDecision::GiveUp => {
        warn!(
          batch_number = %pending.batch_number,
          attempts = pending.retry_count + 1,
          "Batch failed permanently: {}",
          cause
        );
        self.finish(BatchResult {
          batch_number: pending.batch_number,
          request_id,
          status: cause.terminal_status(),
          retry_count: pending.retry_count,
          duration_millis,
          failure: Some(cause),
          extra: None,
        });
      }
    }
  }

  fn schedule_requeue(&mut self, pending: PendingBatch<T>, delay: Duration) {
    let tx = self.requeue_tx.clone();
    let epoch = self.epoch;
    let batch_number = pending.batch_number;
    let handle = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      let _ = tx.send((epoch, pending));
    })
    .abort_handle();
    self.delayed.insert(batch_number, handle);
  }

  fn handle_requeue(&mut self, epoch: u64, pending: PendingBatch<T>) {
    if epoch != self.epoch {
      debug!(batch_number = %pending.batch_number, "Dropping retry from a cleared epoch");
      return;
    }
    self.delayed.remove(&pending.batch_number);
    self.ready.push_back(pending);
    self.pump();
  }

  /// Account for a terminal outcome and notify observers.
  fn finish(&mut self, result: BatchResult) {
    self.accumulator.record_terminal(&result);

    if let Some(observer) = &self.observer
      && let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| observer(&result)))
    {
      warn!(
        batch_number = %result.batch_number,
        "Completion observer panicked: {}",
        panic_message(payload.as_ref())
      );
    }

    // No subscribers is fine
    let _ = self.results.send(result);
  }

  fn check_idle(&mut self) {
    if self.state == LifecycleState::Running
      && self.ready.is_empty()
      && self.delayed.is_empty()
      && self.active.is_empty()
    {
      self.state = LifecycleState::Idle;
      info!("All batches drained");
      // Waiters must see the drained snapshot
      self.publish();
      self.notify_idle();
    }
  }

  fn notify_idle(&mut self) {
    for waiter in self.idle_waiters.drain(..) {
      let _ = waiter.send(());
    }
  }

  /// Drop all queued, delayed and in-flight work and invalidate everything
  /// launched so far.
  fn clear_work(&mut self) -> StopReport {
    self.epoch += 1;
    self.shared_epoch.store(self.epoch, Ordering::Release);

    let cleared_pending = self.ready.len() + self.delayed.len();
    self.ready.clear();
    for (_, handle) in self.delayed.drain() {
      handle.abort();
    }

    let abandoned_in_flight = self.active.len();
    for (_, active) in self.active.drain() {
      active.deadline.abort();
    }
    self.admission.reset();

    StopReport {
      cleared_pending,
      abandoned_in_flight,
    }
  }

  fn stop_and_clear(&mut self) -> StopReport {
    self.state = LifecycleState::Stopping;
    self.publish();

    let report = self.clear_work();
    self.accumulator.reset();
    self.state = LifecycleState::Idle;
    self.publish();
    self.notify_idle();

    info!(
      cleared_pending = report.cleared_pending,
      abandoned_in_flight = report.abandoned_in_flight,
      epoch = self.epoch,
      "Stopped and cleared"
    );
    report
  }

  async fn shutdown(mut self) {
    let report = self.clear_work();
    self.state = LifecycleState::Shutdown;
    self.publish();
    self.notify_idle();
    info!(
      cleared_pending = report.cleared_pending,
      abandoned_in_flight = report.abandoned_in_flight,
      "Shutting down orchestrator"
    );

    for worker in self.pool.close() {
      if let Err(e) = worker.await {
        warn!("Worker task failed: {}", e);
      }
    }
    info!("Orchestrator shut down");
  }

  fn publish(&self) {
    debug_assert_eq!(self.active.len(), self.admission.in_flight());
    self.accumulator.publish_gauges(Gauges {
      state: self.state,
      pending: self.ready.len() + self.delayed.len(),
      in_flight: self.active.len(),
      peak_in_flight: self.admission.peak(),
      max_in_flight: self.admission.max_in_flight(),
    });
  }
}
