//! Retrying request executor: one attempt loop shared by external
//! fetches and remote edits.
//!
//! The operation is an async callback returning a classified outcome.
//! Classification drives policy: transient failures and rate limits
//! retry with exponential backoff, a server-provided delay hint
//! overrides the computed backoff exactly, and unrecoverable failures
//! abort without spending further attempts. Call sites differ only in
//! the operation, the limits, and the classification mapping.

use std::future::Future;
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Outcome classification for a single remote call.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// 429-equivalent. `retry_after` carries the server's suggested
    /// delay when it provided one.
    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    /// Network errors, 5xx, unclassified failures.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Permission denied, not found, malformed request. Never retried.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

/// Terminal failure of a logical operation.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("unrecoverable after {attempts} attempt(s): {message}")]
    Unrecoverable { attempts: u32, message: String },
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: CallError },
}

/// Retry limits and backoff shape for one class of operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries beyond the first attempt; total attempts = max_retries + 1.
    pub max_retries: u32,
    /// Multiplier applied to the backoff after every failed attempt.
    pub backoff_base: f64,
    /// Backoff unit; the delay after attempt n is base_delay * backoff_base^n.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2.0,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Run `op` under `policy`, retrying per classification.
///
/// `label` names the service or resource for log context. Cancellation
/// of the enclosing task aborts at any await point without consuming a
/// retry or sleeping; partially completed sequences are simply dropped.
pub async fn execute<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    let total_attempts = policy.max_retries + 1;
    let mut backoff = policy.base_delay;

    for attempt in 1..=total_attempts {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(label = %label, attempt, "call succeeded after retries");
                }
                return Ok(value);
            }
            Err(CallError::Unrecoverable(message)) => {
                warn!(
                    label = %label,
                    attempt,
                    error = %message,
                    "unrecoverable failure, not retrying"
                );
                return Err(RetryError::Unrecoverable {
                    attempts: attempt,
                    message,
                });
            }
            Err(err) => {
                backoff = backoff.mul_f64(policy.backoff_base);
                if attempt == total_attempts {
                    warn!(
                        label = %label,
                        attempts = total_attempts,
                        error = %err,
                        "retry budget exhausted"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: total_attempts,
                        last: err,
                    });
                }

                // A server-provided hint overrides the computed backoff.
                let wait = match &err {
                    CallError::RateLimited {
                        retry_after: Some(hint),
                        ..
                    } => *hint,
                    _ => backoff,
                };
                warn!(
                    label = %label,
                    attempt,
                    max_attempts = total_attempts,
                    wait_secs = wait.as_secs_f64(),
                    error = %err,
                    "call failed, backing off before retry"
                );
                sleep(wait).await;
            }
        }
    }
    unreachable!("attempt loop returns on every path")
}
