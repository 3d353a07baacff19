//! Retry with exponential backoff for one call unit

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::pacing::RequestPacer;
use crate::client::QuoteError;

/// Highest exponent applied to the base delay
const MAX_BACKOFF_SHIFT: u32 = 16;

/// How many times a unit is attempted and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per unit, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Wait after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        self.base_delay.saturating_mul(1 << shift)
    }

    pub fn should_retry(&self, attempt: u32, err: &QuoteError) -> bool {
        err.is_transient() && attempt < self.max_attempts
    }
}

/// Result of running a unit through the retry loop
#[derive(Debug, PartialEq)]
pub enum Attempt<T> {
    Done(T),
    /// Retries exhausted or the error was not retryable
    Failed(QuoteError),
    /// Cancelled while waiting to start or between attempts
    Cancelled,
}

/// Runs `call` until it succeeds, fails for good, or the run is cancelled
///
/// Every attempt waits for a pacer slot first and is reported through
/// `record` with whether it succeeded.
pub async fn call_with_retry<T, F, Fut, R>(
    policy: &RetryPolicy,
    pacer: &RequestPacer,
    cancel: &CancellationToken,
    unit: &str,
    mut record: R,
    mut call: F,
) -> Attempt<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, QuoteError>>,
    R: FnMut(bool),
{
    let mut attempt = 1;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Attempt::Cancelled,
            _ = pacer.wait() => {}
        }

        let result = call().await;
        record(result.is_ok());

        let err = match result {
            Ok(value) => return Attempt::Done(value),
            Err(err) => err,
        };

        if err.is_unexpected() {
            error!(unit, attempt, error = %err, "unexpected error from pricing service");
        }

        if !policy.should_retry(attempt, &err) {
            if err.is_transient() {
                warn!(unit, attempts = attempt, error = %err, "giving up after retries");
            } else {
                warn!(unit, error = %err, "pricing call failed without retry");
            }
            return Attempt::Failed(err);
        }

        let delay = policy.delay_after(attempt);
        debug!(unit, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying after transient failure");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Attempt::Cancelled,
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
