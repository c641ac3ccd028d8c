//! Retry arithmetic for downstream delivery attempts.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::http::HttpResponse;

/// Predicate function to determine if a response should be retried.
///
/// Takes an HTTP response and returns true if the request should be retried.
pub type ShouldRetryFn = Arc<dyn Fn(&HttpResponse) -> bool + Send + Sync>;

/// Default retry predicate: retry on server errors (5xx), rate limits (429), and timeouts (408).
pub fn default_should_retry(response: &HttpResponse) -> bool {
    response.status >= 500 || response.status == 429 || response.status == 408
}

/// Exponential backoff schedule for delivery attempts.
///
/// Attempt numbering is 1-based and includes the first try: with
/// `max_attempts = 5` an operation is tried at most five times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,

    /// Backoff after the first failed attempt, in milliseconds.
    pub backoff_ms: u64,

    /// Factor by which the backoff grows with each further attempt.
    pub backoff_factor: u64,

    /// Ceiling for a single backoff, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 2_000,
            backoff_factor: 2,
            max_backoff_ms: 32_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff to wait after `attempt` (1-based) has failed.
    ///
    /// Attempt 1 waits `backoff_ms`, attempt 2 waits
    /// `backoff_ms * backoff_factor`, and so on, capped at `max_backoff_ms`.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let ms = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(exponent))
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Whether the attempt budget is spent after `attempts_made` tries.
    pub fn is_exhausted(&self, attempts_made: u32) -> bool {
        attempts_made >= self.max_attempts
    }
}
