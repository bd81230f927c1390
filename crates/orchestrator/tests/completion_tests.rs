//! Completion handling integration tests
//!
//! Tests: completion by id, late and stale reports, dispatch errors and
//! panics, retry ordering and delay, durations, observers.

mod common;

use common::{ConcurrencyProbe, always_fail, batches, collect_results, probed, succeed_after};
use futures::FutureExt;
use orchestrator::{
  BatchNumber, BoxTask, DispatchError, DispatchRequest, FailureCause, IdGenerator, Orchestrator, RequestId,
  RequestStatus,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Factory whose tasks wait for the test to report them by id
fn external() -> (
  impl Fn(DispatchRequest<u32>) -> Result<BoxTask, DispatchError> + Send + Sync,
  mpsc::UnboundedReceiver<(RequestId, BatchNumber)>,
) {
  let (tx, rx) = mpsc::unbounded_channel();
  let factory = move |request: DispatchRequest<u32>| -> Result<BoxTask, DispatchError> {
    let _ = tx.send((request.request_id, request.batch_number));
    Ok(
      async move {
        let _completion = request.completion;
        futures::future::pending::<()>().await;
      }
      .boxed(),
    )
  };
  (factory, rx)
}

#[tokio::test]
async fn test_complete_success_by_id() {
  let (factory, mut launched) = external();
  let orchestrator = Orchestrator::builder(factory)
    .with_id_generator(Arc::new(IdGenerator::starting_at(100, 500)))
    .build()
    .expect("Failed to build orchestrator");
  let mut results = orchestrator.subscribe();

  orchestrator.enqueue(batches(1)).expect("Failed to enqueue");
  let (request_id, batch_number) = launched.recv().await.expect("nothing launched");
  assert_eq!(batch_number, BatchNumber::new(100));
  assert_eq!(request_id, RequestId::new(500));

  orchestrator.complete_success(request_id, batch_number, Some(serde_json::json!({"rows": 12})));

  let result = collect_results(&mut results, 1, Duration::from_secs(2)).await.remove(0);
  assert_eq!(result.status, RequestStatus::Succeeded);
  assert_eq!(result.request_id, request_id);
  assert_eq!(result.extra, Some(serde_json::json!({"rows": 12})));

  orchestrator.wait_idle().await.expect("wait_idle failed");
  assert_eq!(orchestrator.succeeded(), 1);
  orchestrator.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_complete_failure_by_id_retries_with_new_request_id() {
  let (factory, mut launched) = external();
  let orchestrator = Orchestrator::builder(factory)
    .max_retries(1)
    .build()
    .expect("Failed to build orchestrator");

  orchestrator.enqueue(batches(1)).expect("Failed to enqueue");
  let (first_id, batch_number) = launched.recv().await.expect("nothing launched");
  orchestrator.complete_failure(first_id, batch_number, "connection reset");

  let (second_id, retried_batch) = launched.recv().await.expect("no retry launched");
  assert_eq!(retried_batch, batch_number);
  assert_ne!(second_id, first_id);

  // The first attempt is over; reporting it again changes nothing
  orchestrator.complete_success(first_id, batch_number, None);
  orchestrator.complete_success(second_id, batch_number, None);
  orchestrator.wait_idle().await.expect("wait_idle failed");

  assert_eq!(orchestrator.succeeded(), 1);
  assert_eq!(orchestrator.batches_completed(), 1);
  assert_eq!(orchestrator.retries(), 1);
  orchestrator.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_late_completion_after_timeout_is_ignored() {
  let (factory, mut launched) = external();
  let orchestrator = Orchestrator::builder(factory)
    .timeout(Duration::from_millis(40))
    .max_retries(0)
    .build()
    .expect("Failed to build orchestrator");
  let mut results = orchestrator.subscribe();

  orchestrator.enqueue(batches(1)).expect("Failed to enqueue");
  let (request_id, batch_number) = launched.recv().await.expect("nothing launched");

  let result = collect_results(&mut results, 1, Duration::from_secs(2)).await.remove(0);
  assert_eq!(result.status, RequestStatus::Timeout);

  orchestrator.complete_success(request_id, batch_number, None);
  orchestrator.complete_failure(request_id, batch_number, "too late");
  orchestrator.wait_idle().await.expect("wait_idle failed");

  assert_eq!(orchestrator.timed_out(), 1);
  assert_eq!(orchestrator.succeeded(), 0);
  assert_eq!(orchestrator.failed(), 0);
  assert_eq!(orchestrator.batches_completed(), 1);
  assert!(results.try_recv().is_err());
  orchestrator.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_timeout_is_retried() {
  let (factory, mut launched) = external();
  let orchestrator = Orchestrator::builder(factory)
    .timeout(Duration::from_millis(30))
    .max_retries(2)
    .build()
    .expect("Failed to build orchestrator");
  let mut results = orchestrator.subscribe();

  orchestrator.enqueue(batches(1)).expect("Failed to enqueue");
  let result = collect_results(&mut results, 1, Duration::from_secs(2)).await.remove(0);

  assert_eq!(result.status, RequestStatus::Timeout);
  assert_eq!(result.retry_count, 2);

  let mut launches = 0;
  while launched.try_recv().is_ok() {
    launches += 1;
  }
  assert_eq!(launches, 3);
  orchestrator.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_completion_after_stop_and_clear_is_ignored() {
  let (factory, mut launched) = external();
  let orchestrator = Orchestrator::builder(factory).build().expect("Failed to build orchestrator");
  let mut results = orchestrator.subscribe();

  orchestrator.enqueue(batches(2)).expect("Failed to enqueue");
  let (request_id, batch_number) = launched.recv().await.expect("nothing launched");

  orchestrator.stop_and_clear().await.expect("stop_and_clear failed");
  orchestrator.complete_success(request_id, batch_number, None);
  orchestrator.wait_idle().await.expect("wait_idle failed");

  assert_eq!(orchestrator.batches_completed(), 0);
  assert_eq!(orchestrator.succeeded(), 0);
  assert!(results.try_recv().is_err());
  orchestrator.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_mismatched_batch_number_is_ignored() {
  let (factory, mut launched) = external();
  let orchestrator = Orchestrator::builder(factory).build().expect("Failed to build orchestrator");

  orchestrator.enqueue(batches(1)).expect("Failed to enqueue");
  let (request_id, batch_number) = launched.recv().await.expect("nothing launched");

  orchestrator.complete_success(request_id, BatchNumber::new(batch_number.get() + 1), None);
  let records = orchestrator.records().await.expect("records failed");
  assert_eq!(records.len(), 1);
  assert_eq!(records[0].request_id, request_id);

  orchestrator.complete_success(request_id, batch_number, None);
  orchestrator.wait_idle().await.expect("wait_idle failed");
  assert_eq!(orchestrator.succeeded(), 1);
  orchestrator.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_unknown_request_id_is_ignored() {
  let orchestrator = Orchestrator::builder(succeed_after(Duration::ZERO))
    .build()
    .expect("Failed to build orchestrator");

  orchestrator.complete_success(RequestId::new(999), BatchNumber::new(1), None);
  orchestrator.wait_idle().await.expect("wait_idle failed");
  assert_eq!(orchestrator.batches_completed(), 0);
  orchestrator.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_dispatch_error_is_retried() {
  let factory = |request: DispatchRequest<u32>| -> Result<BoxTask, DispatchError> {
    if request.attempt == 1 {
      return Err(DispatchError::factory("pool exhausted"));
    }
    Ok(async move { request.completion.success(None) }.boxed())
  };
  let orchestrator = Orchestrator::builder(factory).build().expect("Failed to build orchestrator");
  let mut results = orchestrator.subscribe();

  orchestrator.enqueue(batches(1)).expect("Failed to enqueue");
  let result = collect_results(&mut results, 1, Duration::from_secs(2)).await.remove(0);

  assert_eq!(result.status, RequestStatus::Succeeded);
  assert_eq!(result.retry_count, 1);
  orchestrator.wait_idle().await.expect("wait_idle failed");
  assert_eq!(orchestrator.metrics().attempts, 2);
  assert_eq!(orchestrator.in_flight(), 0);
  orchestrator.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_persistent_dispatch_error_fails_batch() {
  let factory = |_request: DispatchRequest<u32>| -> Result<BoxTask, DispatchError> {
    Err(DispatchError::factory("bad credentials"))
  };
  let orchestrator = Orchestrator::builder(factory)
    .max_retries(2)
    .build()
    .expect("Failed to build orchestrator");
  let mut results = orchestrator.subscribe();

  orchestrator.enqueue(batches(1)).expect("Failed to enqueue");
  let result = collect_results(&mut results, 1, Duration::from_secs(2)).await.remove(0);

  assert_eq!(result.status, RequestStatus::Failed);
  assert_eq!(result.retry_count, 2);
  assert!(matches!(result.failure, Some(FailureCause::Dispatch(_))));
  assert_eq!(result.duration_millis, 0);
  orchestrator.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_factory_panic_is_a_failed_attempt() {
  let factory = |request: DispatchRequest<u32>| -> Result<BoxTask, DispatchError> {
    if request.attempt == 1 {
      panic!("factory exploded");
    }
    Ok(async move { request.completion.success(None) }.boxed())
  };
  let orchestrator = Orchestrator::builder(factory).build().expect("Failed to build orchestrator");

  orchestrator.enqueue(batches(1)).expect("Failed to enqueue");
  orchestrator.wait_idle().await.expect("wait_idle failed");

  assert_eq!(orchestrator.succeeded(), 1);
  assert_eq!(orchestrator.retries(), 1);
  orchestrator.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_task_panic_is_a_failed_attempt() {
  let factory = |request: DispatchRequest<u32>| -> Result<BoxTask, DispatchError> {
    let attempt = request.attempt;
    let completion = request.completion;
    Ok(
      async move {
        if attempt == 1 {
          panic!("task exploded");
        }
        completion.success(None);
      }
      .boxed(),
    )
  };
  let orchestrator = Orchestrator::builder(factory).build().expect("Failed to build orchestrator");
  let mut results = orchestrator.subscribe();

  orchestrator.enqueue(batches(1)).expect("Failed to enqueue");
  let result = collect_results(&mut results, 1, Duration::from_secs(2)).await.remove(0);

  assert_eq!(result.status, RequestStatus::Succeeded);
  assert_eq!(result.retry_count, 1);
  orchestrator.shutdown().await.expect("shutdown failed");
}

/// A retried batch goes to the back of the queue
#[tokio::test]
async fn test_retry_rejoins_queue_at_tail() {
  let order = Arc::new(Mutex::new(Vec::new()));
  let seen = Arc::clone(&order);
  let factory = move |request: DispatchRequest<u32>| -> Result<BoxTask, DispatchError> {
    seen.lock().unwrap().push((request.batch_number.get(), request.attempt));
    let fail = request.batch_number.get() == 1 && request.attempt == 1;
    Ok(
      async move {
        if fail {
          request.completion.failure("flaky");
        } else {
          request.completion.success(None);
        }
      }
      .boxed(),
    )
  };
  let orchestrator = Orchestrator::builder(factory)
    .max_in_flight(1)
    .build()
    .expect("Failed to build orchestrator");

  orchestrator.enqueue(batches(3)).expect("Failed to enqueue");
  orchestrator.wait_idle().await.expect("wait_idle failed");

  let order = order.lock().unwrap().clone();
  assert_eq!(order, vec![(1, 1), (2, 1), (3, 1), (1, 2)]);
  orchestrator.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_request_delay_spaces_retries() {
  let attempts = Arc::new(AtomicUsize::new(0));
  let orchestrator = Orchestrator::builder(always_fail(Arc::clone(&attempts)))
    .max_retries(2)
    .request_delay(Duration::from_millis(60))
    .build()
    .expect("Failed to build orchestrator");

  let start = Instant::now();
  orchestrator.enqueue(batches(1)).expect("Failed to enqueue");

  // Waiting out the delay still counts as pending work
  tokio::time::sleep(Duration::from_millis(20)).await;
  assert_eq!(orchestrator.pending(), 1);
  assert_eq!(orchestrator.in_flight(), 0);

  orchestrator.wait_idle().await.expect("wait_idle failed");
  assert!(start.elapsed() >= Duration::from_millis(120));
  assert_eq!(attempts.load(Ordering::SeqCst), 3);
  assert_eq!(orchestrator.failed(), 1);
  orchestrator.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_durations_are_recorded_per_batch() {
  let orchestrator = Orchestrator::builder(succeed_after(Duration::from_millis(40)))
    .max_in_flight(3)
    .build()
    .expect("Failed to build orchestrator");

  let numbers = orchestrator.enqueue(batches(3)).expect("Failed to enqueue");
  orchestrator.wait_idle().await.expect("wait_idle failed");

  let durations: Vec<u64> = numbers
    .iter()
    .map(|n| orchestrator.batch_duration_by_id(*n).expect("missing duration"))
    .collect();
  assert!(durations.iter().all(|d| *d >= 40), "durations: {:?}", durations);

  let total: u64 = durations.iter().sum();
  assert_eq!(orchestrator.total_batch_duration_millis(), total);
  assert_eq!(orchestrator.avg_batch_duration_millis(), total as f64 / 3.0);
  assert_eq!(orchestrator.batch_duration_by_id(BatchNumber::new(9999)), None);
  orchestrator.shutdown().await.expect("shutdown failed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_raising_max_in_flight_at_runtime() {
  let probe = Arc::new(ConcurrencyProbe::default());
  let orchestrator = Orchestrator::builder(probed(Arc::clone(&probe), Duration::from_millis(40)))
    .max_in_flight(1)
    .build()
    .expect("Failed to build orchestrator");

  orchestrator.enqueue(batches(8)).expect("Failed to enqueue");
  orchestrator.set_max_in_flight(4).expect("set_max_in_flight failed");
  orchestrator.wait_idle().await.expect("wait_idle failed");

  assert_eq!(orchestrator.succeeded(), 8);
  assert!(probe.peak() <= 4);
  assert!(orchestrator.peak_in_flight() > 1);
  assert!(orchestrator.peak_in_flight() <= 4);
  assert_eq!(orchestrator.metrics().max_in_flight, 4);
  orchestrator.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_observer_sees_every_result() {
  let observed = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&observed);
  let orchestrator = Orchestrator::builder(succeed_after(Duration::ZERO))
    .on_complete(move |result| {
      if result.batch_number == BatchNumber::new(1) {
        panic!("observer exploded");
      }
      counter.fetch_add(1, Ordering::SeqCst);
    })
    .build()
    .expect("Failed to build orchestrator");

  orchestrator.enqueue(batches(4)).expect("Failed to enqueue");
  orchestrator.wait_idle().await.expect("wait_idle failed");

  assert_eq!(observed.load(Ordering::SeqCst), 3);
  assert_eq!(orchestrator.succeeded(), 4);
  orchestrator.shutdown().await.expect("shutdown failed");
}
