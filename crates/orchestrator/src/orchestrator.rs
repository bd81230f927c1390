//! Public handle to a running orchestrator.
//!
//! The handle is cheap to clone and can be used from any thread. Enqueueing,
//! reporting by id and changing limits never block: they post a command to
//! the coordinator task. Metrics getters read the latest published snapshot.

use crate::accumulator::{CompletionAccumulator, Metrics};
use crate::coordinator::{Command, CompletionObserver, Coordinator, CoordinatorConfig};
use crate::error::OrchestratorError;
use crate::lifecycle::{LifecycleState, StopReport};
use crate::record::RequestRecord;
use crate::retry::RetryPolicy;
use crate::task::{CompletionMessage, Outcome, TaskFactory};
use batchflow_core::{
  Batch, BatchNumber, BatchResult, FailureCause, IdGenerator, OrchestratorConfig, RequestId, split_into_batches,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

const RESULT_CHANNEL_CAPACITY: usize = 1024;

/// Limits the orchestrator starts with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
  pub max_in_flight: usize,
  pub batch_size: usize,
  pub timeout: Duration,
  pub request_delay: Duration,
  pub max_retries: u32,
}

impl Default for Settings {
  fn default() -> Self {
    Self::from(&OrchestratorConfig::default())
  }
}

impl From<&OrchestratorConfig> for Settings {
  fn from(config: &OrchestratorConfig) -> Self {
    Self {
      max_in_flight: config.max_in_flight,
      batch_size: config.batch_size,
      timeout: config.timeout(),
      request_delay: config.request_delay(),
      max_retries: config.max_retries,
    }
  }
}

impl Settings {
  pub fn validate(&self) -> Result<(), OrchestratorError> {
    if self.max_in_flight == 0 {
      return Err(OrchestratorError::InvalidSettings("max_in_flight must be at least 1".into()));
    }
    if self.batch_size == 0 {
      return Err(OrchestratorError::InvalidSettings("batch_size must be at least 1".into()));
    }
    if self.timeout.is_zero() {
      return Err(OrchestratorError::InvalidSettings("timeout must be non-zero".into()));
    }
    Ok(())
  }
}

pub struct OrchestratorBuilder<T> {
  factory: Arc<dyn TaskFactory<T>>,
  settings: Settings,
  ids: Option<Arc<IdGenerator>>,
  observer: Option<CompletionObserver>,
}

impl<T: Send + Sync + 'static> OrchestratorBuilder<T> {
  pub fn new(factory: impl TaskFactory<T>) -> Self {
    Self {
      factory: Arc::new(factory),
      settings: Settings::default(),
      ids: None,
      observer: None,
    }
  }

  pub fn with_settings(mut self, settings: Settings) -> Self {
    self.settings = settings;
    self
  }

  pub fn with_config(self, config: &OrchestratorConfig) -> Result<Self, OrchestratorError> {
    config.validate()?;
    Ok(self.with_settings(Settings::from(config)))
  }

  pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
    self.settings.max_in_flight = max_in_flight;
    self
  }

  pub fn batch_size(mut self, batch_size: usize) -> Self {
    self.settings.batch_size = batch_size;
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.settings.timeout = timeout;
    self
  }

  pub fn request_delay(mut self, delay: Duration) -> Self {
    self.settings.request_delay = delay;
    self
  }

  pub fn max_retries(mut self, max_retries: u32) -> Self {
    self.settings.max_retries = max_retries;
    self
  }

  /// Use a caller-owned id source (e.g. one shared with other components, or
  /// one starting at known values in tests).
  pub fn with_id_generator(mut self, ids: Arc<IdGenerator>) -> Self {
    self.ids = Some(ids);
    self
  }

  /// Called once per terminal outcome, on the coordinator task. Keep it short.
  pub fn on_complete(mut self, observer: impl Fn(&BatchResult) + Send + Sync + 'static) -> Self {
    self.observer = Some(Arc::new(observer));
    self
  }

  /// Start the coordinator on the current tokio runtime.
  pub fn build(self) -> Result<Orchestrator<T>, OrchestratorError> {
    self.settings.validate()?;
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| OrchestratorError::NoRuntime)?;

    let ids = self.ids.unwrap_or_default();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (results_tx, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
    let (accumulator, metrics) = CompletionAccumulator::new();

    let config = CoordinatorConfig {
      factory: self.factory,
      ids: Arc::clone(&ids),
      max_in_flight: self.settings.max_in_flight,
      timeout: self.settings.timeout,
      retry: RetryPolicy::new(self.settings.max_retries, self.settings.request_delay),
      observer: self.observer,
      results: results_tx.clone(),
    };
    let coordinator = runtime.spawn(async move {
      Coordinator::new(config, accumulator, commands_rx).run().await;
    });

    Ok(Orchestrator {
      inner: Arc::new(Inner {
        commands: commands_tx,
        ids,
        batch_size: self.settings.batch_size,
        metrics,
        results: results_tx,
        shut_down: AtomicBool::new(false),
        coordinator: Mutex::new(Some(coordinator)),
      }),
    })
  }
}

struct Inner<T> {
  commands: mpsc::UnboundedSender<Command<T>>,
  ids: Arc<IdGenerator>,
  batch_size: usize,
  metrics: watch::Receiver<Metrics>,
  results: broadcast::Sender<BatchResult>,
  shut_down: AtomicBool,
  coordinator: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a batch orchestrator
pub struct Orchestrator<T> {
  inner: Arc<Inner<T>>,
}

// Manual impl: the handle is shareable whether or not `T: Clone`.
impl<T> Clone for Orchestrator<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Send + Sync + 'static> Orchestrator<T> {
  pub fn builder(factory: impl TaskFactory<T>) -> OrchestratorBuilder<T> {
    OrchestratorBuilder::new(factory)
  }

  fn send(&self, command: Command<T>) -> Result<(), OrchestratorError> {
    if self.inner.shut_down.load(Ordering::Acquire) {
      return Err(OrchestratorError::ShutDown);
    }
    self.inner.commands.send(command).map_err(|_| OrchestratorError::ShutDown)
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  /// Queue batches for dispatch and return the batch numbers assigned to them,
  /// in order.
  pub fn enqueue(&self, batches: Vec<Batch<T>>) -> Result<Vec<BatchNumber>, OrchestratorError> {
    if self.inner.shut_down.load(Ordering::Acquire) {
      return Err(OrchestratorError::ShutDown);
    }
    let numbered: Vec<(BatchNumber, Batch<T>)> = self
      .inner
      .ids
      .reserve_batch_numbers(batches.len())
      .zip(batches)
      .collect();
    let numbers = numbered.iter().map(|(n, _)| *n).collect();
    self.send(Command::Enqueue(numbered))?;
    Ok(numbers)
  }

  /// Split `items` into batches of the configured size and queue them.
  pub fn enqueue_items(&self, items: Vec<T>) -> Result<Vec<BatchNumber>, OrchestratorError> {
    self.enqueue(split_into_batches(items, self.inner.batch_size))
  }

  /// Drop all pending work, ignore whatever is in flight, and reset counters.
  pub async fn stop_and_clear(&self) -> Result<StopReport, OrchestratorError> {
    let (tx, rx) = oneshot::channel();
    self.send(Command::StopAndClear(tx))?;
    rx.await.map_err(|_| OrchestratorError::ShutDown)
  }

  /// Stop the coordinator and wait for the worker pool to drain.
  ///
  /// Idempotent: later calls return immediately.
  pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
    if self.inner.shut_down.swap(true, Ordering::AcqRel) {
      return Ok(());
    }
    // Send directly: the flag is already set
    let _ = self.inner.commands.send(Command::Shutdown);

    if let Some(handle) = self.inner.coordinator.lock().await.take()
      && let Err(e) = handle.await
    {
      warn!("Coordinator task failed: {}", e);
    }
    Ok(())
  }

  /// Resolve once nothing is pending or in flight (immediately if idle).
  pub async fn wait_idle(&self) -> Result<(), OrchestratorError> {
    let (tx, rx) = oneshot::channel();
    self.send(Command::WhenIdle(tx))?;
    rx.await.map_err(|_| OrchestratorError::ShutDown)
  }

  // ==========================================================================
  // Completion by id
  // ==========================================================================

  /// Report success for a request by id. Reports for requests that are no
  /// longer in flight (already finished, timed out, or cleared) are ignored.
  pub fn complete_success(&self, request_id: RequestId, batch_number: BatchNumber, extra: Option<serde_json::Value>) {
    self.complete(request_id, batch_number, Outcome::Success(extra));
  }

  /// Report failure for a request by id. Same rules as [`complete_success`](Self::complete_success).
  pub fn complete_failure(&self, request_id: RequestId, batch_number: BatchNumber, cause: impl Into<String>) {
    self.complete(
      request_id,
      batch_number,
      Outcome::Failure(FailureCause::Transient(cause.into())),
    );
  }

  fn complete(&self, request_id: RequestId, batch_number: BatchNumber, outcome: Outcome) {
    let message = CompletionMessage {
      request_id,
      batch_number,
      epoch: None,
      outcome,
      reported_at: Instant::now(),
    };
    if self.send(Command::Complete(message)).is_err() {
      debug!(%request_id, "Orchestrator shut down, dropping completion");
    }
  }

  // ==========================================================================
  // Runtime configuration
  // ==========================================================================

  pub fn set_max_in_flight(&self, max_in_flight: usize) -> Result<(), OrchestratorError> {
    if max_in_flight == 0 {
      return Err(OrchestratorError::InvalidSettings("max_in_flight must be at least 1".into()));
    }
    self.send(Command::SetMaxInFlight(max_in_flight))
  }

  /// Applies to attempts launched after the change.
  pub fn set_timeout(&self, timeout: Duration) -> Result<(), OrchestratorError> {
    if timeout.is_zero() {
      return Err(OrchestratorError::InvalidSettings("timeout must be non-zero".into()));
    }
    self.send(Command::SetTimeout(timeout))
  }

  pub fn set_request_delay(&self, delay: Duration) -> Result<(), OrchestratorError> {
    self.send(Command::SetRequestDelay(delay))
  }

  pub fn set_max_retries(&self, max_retries: u32) -> Result<(), OrchestratorError> {
    self.send(Command::SetMaxRetries(max_retries))
  }

  // ==========================================================================
  // Metrics
  // ==========================================================================

  pub fn metrics(&self) -> Metrics {
    self.inner.metrics.borrow().clone()
  }

  /// Receiver that is notified whenever the metrics change
  pub fn watch_metrics(&self) -> watch::Receiver<Metrics> {
    self.inner.metrics.clone()
  }

  /// Stream of terminal results. Slow receivers may lag and miss results.
  pub fn subscribe(&self) -> broadcast::Receiver<BatchResult> {
    self.inner.results.subscribe()
  }

  /// Records of the attempts currently in flight
  pub async fn records(&self) -> Result<Vec<RequestRecord>, OrchestratorError> {
    let (tx, rx) = oneshot::channel();
    self.send(Command::Records(tx))?;
    rx.await.map_err(|_| OrchestratorError::ShutDown)
  }

  pub fn state(&self) -> LifecycleState {
    self.inner.metrics.borrow().state
  }

  pub fn in_flight(&self) -> usize {
    self.inner.metrics.borrow().in_flight
  }

  pub fn pending(&self) -> usize {
    self.inner.metrics.borrow().pending
  }

  pub fn peak_in_flight(&self) -> usize {
    self.inner.metrics.borrow().peak_in_flight
  }

  pub fn total_batches(&self) -> u64 {
    self.inner.metrics.borrow().total_batches
  }

  pub fn batches_completed(&self) -> u64 {
    self.inner.metrics.borrow().completed
  }

  pub fn succeeded(&self) -> u64 {
    self.inner.metrics.borrow().succeeded
  }

  pub fn failed(&self) -> u64 {
    self.inner.metrics.borrow().failed
  }

  pub fn timed_out(&self) -> u64 {
    self.inner.metrics.borrow().timed_out
  }

  pub fn retries(&self) -> u64 {
    self.inner.metrics.borrow().retries
  }

  pub fn avg_batch_duration_millis(&self) -> f64 {
    self.inner.metrics.borrow().avg_batch_duration_millis()
  }

  pub fn total_batch_duration_millis(&self) -> u64 {
    self.inner.metrics.borrow().total_duration_millis
  }

  pub fn batch_duration_by_id(&self, batch_number: BatchNumber) -> Option<u64> {
    self.inner.metrics.borrow().batch_duration_by_id(batch_number)
  }
}
