//! Fixed-delay retry for coordinator transfers.
//!
//! Uploads and downloads are retried a bounded number of times with a
//! constant pause. Each attempt tells the loop whether its failure is worth
//! another try.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempt budget and pause between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Pause after a retryable failure, skipped after the last attempt.
    pub delay: Duration,
    /// Operation name for logging.
    pub operation_name: String,
}

impl RetryPolicy {
    pub fn new(operation_name: impl Into<String>, max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            operation_name: operation_name.into(),
        }
    }

    /// Job validation: 3 attempts, 32 seconds apart.
    pub fn validation() -> Self {
        Self::new("validate_job", 3, Duration::from_secs(32))
    }

    /// Archive download: 5 attempts, back to back.
    pub fn download() -> Self {
        Self::new("download", 5, Duration::ZERO)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Outcome of a single attempt.
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// Succeeded, stop.
    Done(T),
    /// Failed in a way retrying cannot fix, stop.
    Fatal(E),
    /// Failed, worth another attempt.
    Retry(E),
}

/// Run `operation` until it succeeds, fails fatally or the budget runs out.
///
/// `operation` receives the 1-based attempt number. On exhaustion the error
/// of the last attempt is returned.
pub async fn retry_fixed<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1u32;

    loop {
        match operation(attempt).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fatal(e) => {
                debug!("{} attempt {} failed fatally: {}", policy.operation_name, attempt, e);
                return Err(e);
            }
            Attempt::Retry(e) if attempt < policy.max_attempts => {
                warn!(
                    operation = %policy.operation_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_secs = policy.delay.as_secs(),
                    "Attempt failed, retrying: {}",
                    e
                );
                crate::metrics::record_retry(&policy.operation_name);
                if !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay).await;
                }
                attempt += 1;
            }
            Attempt::Retry(e) => {
                warn!(
                    operation = %policy.operation_name,
                    attempts = attempt,
                    "Giving up: {}",
                    e
                );
                return Err(e);
            }
        }
    }
}

/// Quiets a background loop that keeps failing the same way.
///
/// The first `max_logged` failures in a row are reported, the rest are
/// swallowed until a success resets the streak.
#[derive(Debug, Default)]
pub struct FailureTracker {
    streak: u32,
    max_logged: u32,
}

impl FailureTracker {
    pub fn new(max_logged: u32) -> Self {
        Self { streak: 0, max_logged }
    }

    /// Record a success; ends the current streak.
    pub fn record_success(&mut self) {
        if self.streak > self.max_logged {
            debug!("Recovered after {} consecutive failures", self.streak);
        }
        self.streak = 0;
    }

    /// Record a failure. Returns `true` if it should be logged.
    pub fn record_failure(&mut self) -> bool {
        self.streak += 1;
        if self.streak == self.max_logged + 1 {
            warn!("Suppressing further failure logs after {} in a row", self.max_logged);
        }
        self.streak <= self.max_logged
    }

    pub fn failure_count(&self) -> u32 {
        self.streak
    }
}
