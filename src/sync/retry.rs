//! Retry limits and exponential backoff for failed sync items.

use std::time::Duration;

/// How failed items are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Failures tolerated before an item stays `Failed`
  pub max_retries: u32,
  pub initial: Duration,
  pub max: Duration,
  pub factor: f64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 5,
      initial: Duration::from_secs(1),
      max: Duration::from_secs(300),
      factor: 2.0,
    }
  }
}

impl RetryPolicy {
  /// No backoff delay, for tests.
  #[cfg(test)]
  pub fn immediate(max_retries: u32) -> Self {
    Self {
      max_retries,
      initial: Duration::ZERO,
      max: Duration::ZERO,
      factor: 1.0,
    }
  }

  /// Whether an item that has now failed `retry_count` times may be retried.
  pub fn allows(&self, retry_count: u32) -> bool {
    retry_count <= self.max_retries
  }

  /// Delay before attempt number `retry_count` (1-based).
  pub fn backoff(&self, retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(63) as i32;
    let delay = self.initial.as_nanos() as f64 * self.factor.powi(exponent);
    if !delay.is_finite() || delay >= self.max.as_nanos() as f64 {
      return self.max;
    }
    Duration::from_nanos(delay as u64)
  }
}
