//! Shared task factories and helpers for orchestrator integration tests

#![allow(dead_code)]

use futures::FutureExt;
use orchestrator::{BatchResult, BoxTask, DispatchError, DispatchRequest};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

/// Succeeds after `latency`
pub fn succeed_after(latency: Duration) -> impl Fn(DispatchRequest<u32>) -> Result<BoxTask, DispatchError> + Send + Sync {
  move |request: DispatchRequest<u32>| -> Result<BoxTask, DispatchError> {
    Ok(
      async move {
        tokio::time::sleep(latency).await;
        request.completion.success(None);
      }
      .boxed(),
    )
  }
}

/// Holds on to its completion handle and never reports
pub fn never_complete() -> impl Fn(DispatchRequest<u32>) -> Result<BoxTask, DispatchError> + Send + Sync {
  |request: DispatchRequest<u32>| -> Result<BoxTask, DispatchError> {
    Ok(
      async move {
        let _completion = request.completion;
        futures::future::pending::<()>().await;
      }
      .boxed(),
    )
  }
}

/// Reports failure immediately on every attempt
pub fn always_fail(attempts: Arc<AtomicUsize>) -> impl Fn(DispatchRequest<u32>) -> Result<BoxTask, DispatchError> + Send + Sync {
  move |request: DispatchRequest<u32>| -> Result<BoxTask, DispatchError> {
    attempts.fetch_add(1, Ordering::SeqCst);
    Ok(async move { request.completion.failure("upstream unavailable") }.boxed())
  }
}

/// Tracks how many tasks run at the same time
#[derive(Default)]
pub struct ConcurrencyProbe {
  current: AtomicUsize,
  peak: AtomicUsize,
}

impl ConcurrencyProbe {
  pub fn enter(&self) {
    let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
  }

  pub fn exit(&self) {
    self.current.fetch_sub(1, Ordering::SeqCst);
  }

  pub fn peak(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }
}

/// Succeeds after `latency`, recording concurrency in `probe`
pub fn probed(
  probe: Arc<ConcurrencyProbe>,
  latency: Duration,
) -> impl Fn(DispatchRequest<u32>) -> Result<BoxTask, DispatchError> + Send + Sync {
  move |request: DispatchRequest<u32>| -> Result<BoxTask, DispatchError> {
    let probe = Arc::clone(&probe);
    Ok(
      async move {
        probe.enter();
        tokio::time::sleep(latency).await;
        probe.exit();
        request.completion.success(None);
      }
      .boxed(),
    )
  }
}

/// Receive `count` results, failing the test if they take longer than `limit`
pub async fn collect_results(rx: &mut broadcast::Receiver<BatchResult>, count: usize, limit: Duration) -> Vec<BatchResult> {
  tokio::time::timeout(limit, async {
    let mut results = Vec::with_capacity(count);
    while results.len() < count {
      results.push(rx.recv().await.expect("result channel closed"));
    }
    results
  })
  .await
  .expect("timed out waiting for results")
}

pub fn batches(count: usize) -> Vec<orchestrator::Batch<u32>> {
  (0..count as u32).map(|i| orchestrator::Batch::new(vec![i])).collect()
}
