// Retry decisions for failed and timed-out batches
//
// A batch gets at most max_retries + 1 attempts. A retried batch rejoins the
// ready queue at the tail after request_delay; it is not moved ahead of
// batches that have never been attempted.

use std::time::Duration;

/// What to do with a batch whose attempt did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
  /// Requeue after `delay` with the given retry count
  Retry { retry_count: u32, delay: Duration },
  /// Retries exhausted; the batch is terminal
  GiveUp,
}

/// Configuration for batch retries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Retries allowed after the first attempt
  pub max_retries: u32,
  /// Delay before a retried batch becomes eligible for dispatch again
  pub request_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      request_delay: Duration::ZERO,
    }
  }
}

impl RetryPolicy {
  pub fn new(max_retries: u32, request_delay: Duration) -> Self {
    Self {
      max_retries,
      request_delay,
    }
  }

  /// Decide the fate of a batch that has been retried `retry_count` times so far.
  pub fn on_failure(&self, retry_count: u32) -> RetryDecision {
    if retry_count < self.max_retries {
      RetryDecision::Retry {
        retry_count: retry_count + 1,
        delay: self.request_delay,
      }
    } else {
      RetryDecision::GiveUp
    }
  }

  pub fn max_attempts(&self) -> u32 {
    self.max_retries.saturating_add(1)
  }
}
