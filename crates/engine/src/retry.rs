//! Bounded retry with exponential backoff for transient store conflicts.

use std::future::Future;
use std::time::Duration;

use ledger_store::StoreError;
use tokio::time::sleep;

use crate::error::EngineError;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 10ms
/// - `max_delay`: 200ms
/// - `multiplier`: 2.0 (delay doubles each retry)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: usize,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap for the exponential backoff
    pub max_delay: Duration,
    /// Multiplier applied per retry
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the default cap and multiplier.
    pub fn new(max_retries: usize, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            ..Self::default()
        }
    }

    /// A policy that gives up on the first conflict.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Calculates the delay before retry number `attempt` (zero based).
    ///
    /// delay = initial_delay * multiplier^attempt, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(delay_ms as u64)
    }
}

/// Runs `operation` until it succeeds, fails terminally, or exhausts the
/// policy's retries on transient conflicts.
///
/// Each attempt must be a complete unit of work: a conflicting attempt has
/// been rolled back by the store before it returns.
pub async fn retry_on_conflict<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut attempt_fn: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;

    loop {
        match attempt_fn().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(operation, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() => {
                if attempt >= policy.max_retries {
                    tracing::error!(
                        operation,
                        attempts = attempt + 1,
                        error = %err,
                        "operation abandoned after repeated conflicts"
                    );
                    return Err(EngineError::Conflict {
                        attempts: attempt + 1,
                    });
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient conflict, retrying"
                );
                metrics::counter!("ledger_conflict_retries_total", "operation" => operation)
                    .increment(1);

                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}
