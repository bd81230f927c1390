//! Simulated workload runner
//!
//! Splits `0..items` into batches and dispatches them through an
//! [`Orchestrator`] whose tasks sleep for a fixed latency. Failures and hangs
//! are injected deterministically by batch number so runs are reproducible.

use anyhow::{Context, Result};
use batchflow_core::{BatchResult, Config, OrchestratorConfig};
use clap::Args;
use futures::FutureExt;
use orchestrator::{BoxTask, DispatchError, DispatchRequest, Metrics, Orchestrator, StopReport, TaskFactory};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Minimum gap between progress log lines
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
  /// Number of work items to process
  #[arg(long, default_value = "256")]
  pub items: u64,
  /// Items per batch (default: from config)
  #[arg(long)]
  pub batch_size: Option<usize>,
  /// Maximum batches in flight (default: from config)
  #[arg(long)]
  pub max_in_flight: Option<usize>,
  /// Per-attempt timeout in milliseconds (default: from config)
  #[arg(long)]
  pub timeout_ms: Option<u64>,
  /// Delay before a retried batch is dispatched again, in milliseconds
  #[arg(long)]
  pub delay_ms: Option<u64>,
  /// Retries after the first attempt (default: from config)
  #[arg(long)]
  pub max_retries: Option<u32>,
  /// Simulated latency of each attempt in milliseconds
  #[arg(long, default_value = "20")]
  pub latency_ms: u64,
  /// Fail the first attempt of every K-th batch
  #[arg(long, value_name = "K")]
  pub fail_every: Option<u64>,
  /// Never complete the first attempt of every K-th batch (it times out)
  #[arg(long, value_name = "K")]
  pub hang_every: Option<u64>,
  /// Print the summary as JSON
  #[arg(long)]
  pub json: bool,
}

impl RunArgs {
  /// Apply command-line overrides on top of the loaded config
  fn apply(&self, config: &mut OrchestratorConfig) {
    if let Some(batch_size) = self.batch_size {
      config.batch_size = batch_size;
    }
    if let Some(max_in_flight) = self.max_in_flight {
      config.max_in_flight = max_in_flight;
    }
    if let Some(timeout_ms) = self.timeout_ms {
      config.timeout_millis = timeout_ms;
    }
    if let Some(delay_ms) = self.delay_ms {
      config.request_delay_millis = delay_ms;
    }
    if let Some(max_retries) = self.max_retries {
      config.max_retries = max_retries;
    }
  }
}

/// Task factory standing in for a real backend
#[derive(Debug, Clone)]
struct Simulation {
  latency: Duration,
  fail_every: Option<u64>,
  hang_every: Option<u64>,
}

impl Simulation {
  fn from_args(args: &RunArgs) -> Self {
    Self {
      latency: Duration::from_millis(args.latency_ms),
      fail_every: args.fail_every.filter(|k| *k > 0),
      hang_every: args.hang_every.filter(|k| *k > 0),
    }
  }

  fn hits(every: Option<u64>, request: &DispatchRequest<u64>) -> bool {
    request.attempt == 1 && every.is_some_and(|k| request.batch_number.get() % k == 0)
  }
}

impl TaskFactory<u64> for Simulation {
  fn create(&self, request: DispatchRequest<u64>) -> Result<BoxTask, DispatchError> {
    let latency = self.latency;
    let hang = Self::hits(self.hang_every, &request);
    let fail = Self::hits(self.fail_every, &request);
    let items = request.batch.len();
    let sum: u64 = request.batch.iter().sum();
    let completion = request.completion;

    Ok(
      async move {
        if hang {
          let _completion = completion;
          futures::future::pending::<()>().await;
          return;
        }
        tokio::time::sleep(latency).await;
        if fail {
          completion.failure("simulated failure");
        } else {
          completion.success(Some(serde_json::json!({ "items": items, "sum": sum })));
        }
      }
      .boxed(),
    )
  }
}

#[derive(Debug, Serialize)]
struct RunSummary {
  items: u64,
  batches: usize,
  elapsed_millis: u64,
  interrupted: Option<StopReport>,
  metrics: Metrics,
  /// Batches that did not succeed
  failures: Vec<BatchResult>,
}

pub async fn cmd_run(config: Config, args: RunArgs) -> Result<()> {
  let interrupt = async {
    // Without a signal handler the run just goes to completion
    if tokio::signal::ctrl_c().await.is_err() {
      futures::future::pending::<()>().await;
    }
  };
  let summary = run_workload(config, &args, interrupt).await?;

  if args.json {
    println!("{}", serde_json::to_string_pretty(&summary)?);
  } else {
    print_summary(&summary);
  }
  Ok(())
}

/// Run the simulated workload until it drains or `interrupt` resolves.
async fn run_workload(mut config: Config, args: &RunArgs, interrupt: impl Future<Output = ()>) -> Result<RunSummary> {
  args.apply(&mut config.orchestrator);
  config.orchestrator.validate().context("Invalid orchestrator settings")?;

  // Collected as results arrive; the broadcast channel only keeps the most recent ones
  let failures = Arc::new(Mutex::new(Vec::new()));
  let sink = Arc::clone(&failures);
  let orchestrator = Orchestrator::builder(Simulation::from_args(args))
    .with_config(&config.orchestrator)?
    .on_complete(move |result: &BatchResult| {
      if !result.is_success()
        && let Ok(mut failures) = sink.lock()
      {
        failures.push(result.clone());
      }
    })
    .build()
    .context("Failed to start orchestrator")?;
  let progress = tokio::spawn(log_progress(orchestrator.clone()));

  info!(
    items = args.items,
    batch_size = config.orchestrator.batch_size,
    max_in_flight = config.orchestrator.max_in_flight,
    "Starting run"
  );
  let start = Instant::now();
  let numbers = orchestrator.enqueue_items((0..args.items).collect())?;

  let (metrics, interrupted) = tokio::select! {
    result = orchestrator.wait_idle() => {
      result?;
      (orchestrator.metrics(), None)
    }
    _ = interrupt => {
      warn!("Interrupted, clearing remaining work");
      // Stop-and-clear resets the counters, so keep what was finished
      let metrics = orchestrator.metrics();
      (metrics, Some(orchestrator.stop_and_clear().await?))
    }
  };
  let elapsed = start.elapsed();

  orchestrator.shutdown().await?;
  progress.abort();

  let mut failures = failures.lock().map(|mut f| std::mem::take(&mut *f)).unwrap_or_default();
  failures.sort_by_key(|r| r.batch_number);

  Ok(RunSummary {
    items: args.items,
    batches: numbers.len(),
    elapsed_millis: elapsed.as_millis() as u64,
    interrupted,
    metrics,
    failures,
  })
}

/// Log a progress line whenever the metrics change, at most every PROGRESS_INTERVAL
async fn log_progress(orchestrator: Orchestrator<u64>) {
  let mut rx = orchestrator.watch_metrics();
  let mut last = Instant::now();
  while rx.changed().await.is_ok() {
    if last.elapsed() < PROGRESS_INTERVAL {
      continue;
    }
    last = Instant::now();
    let m = rx.borrow_and_update().clone();
    info!(
      completed = m.completed,
      total = m.total_batches,
      in_flight = m.in_flight,
      pending = m.pending,
      retries = m.retries,
      "Progress"
    );
  }
}

fn print_summary(summary: &RunSummary) {
  let m = &summary.metrics;
  println!("Run complete");
  println!("============");
  println!();
  if let Some(report) = &summary.interrupted {
    println!(
      "Interrupted: cleared {} pending, abandoned {} in flight",
      report.cleared_pending, report.abandoned_in_flight
    );
    println!();
  }
  println!("Items:          {}", summary.items);
  println!("Batches:        {}", summary.batches);
  println!("Elapsed:        {} ms", summary.elapsed_millis);
  println!();
  println!("Succeeded:      {}", m.succeeded);
  println!("Failed:         {}", m.failed);
  println!("Timed out:      {}", m.timed_out);
  println!("Attempts:       {}", m.attempts);
  println!("Retries:        {}", m.retries);
  println!("Peak in flight: {} / {}", m.peak_in_flight, m.max_in_flight);
  println!("Avg duration:   {:.1} ms", m.avg_batch_duration_millis());

  if !summary.failures.is_empty() {
    println!();
    println!("Failures:");
    for result in &summary.failures {
      let cause = result.failure.as_ref().map(|c| c.to_string()).unwrap_or_default();
      println!(
        "  {} [{}] after {} attempt(s): {}",
        result.batch_number,
        result.status,
        result.attempts(),
        cause
      );
    }
  }
}
