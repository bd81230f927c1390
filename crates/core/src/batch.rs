use std::ops::Deref;
use std::sync::Arc;

/// An ordered, immutable group of work items dispatched as one request.
///
/// Cloning is cheap (the items are shared), which lets a failed batch be
/// re-dispatched without copying its payload. The items are opaque to the
/// orchestrator.
#[derive(Debug)]
pub struct Batch<T> {
  items: Arc<[T]>,
}

impl<T> Batch<T> {
  pub fn new(items: Vec<T>) -> Self {
    Self { items: items.into() }
  }

  pub fn items(&self) -> &[T] {
    &self.items
  }
}

// Manual impl: cloning shares the Arc and must not require `T: Clone`.
impl<T> Clone for Batch<T> {
  fn clone(&self) -> Self {
    Self {
      items: Arc::clone(&self.items),
    }
  }
}

impl<T> Deref for Batch<T> {
  type Target = [T];

  fn deref(&self) -> &[T] {
    &self.items
  }
}

impl<T> From<Vec<T>> for Batch<T> {
  fn from(items: Vec<T>) -> Self {
    Self::new(items)
  }
}

/// Split work items into batches of at most `batch_size`, keeping their order.
///
/// Only the last batch may be shorter. A `batch_size` of 0 is treated as 1.
pub fn split_into_batches<T>(items: Vec<T>, batch_size: usize) -> Vec<Batch<T>> {
  let batch_size = batch_size.max(1);
  let mut batches = Vec::with_capacity(items.len().div_ceil(batch_size));
  let mut remaining = items.into_iter();

  loop {
    let chunk: Vec<T> = remaining.by_ref().take(batch_size).collect();
    if chunk.is_empty() {
      break;
    }
    batches.push(Batch::new(chunk));
  }

  batches
}
