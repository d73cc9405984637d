//! Bounded retries for the signing call.
//!
//! Each attempt gets its own timeout. Only transient failures are retried;
//! anything else is returned to the caller after the attempt that produced
//! it. A [`CancellationToken`] aborts both the in-flight attempt and the
//! pause between attempts.
//!
//! # Example
//!
//! ```ignore
//! use sentry_identity::retry::{call_with_retry, is_retryable_status, RetryPolicy};
//!
//! let (response, attempts) = call_with_retry(
//!     &RetryPolicy::default(),
//!     &cancel,
//!     "sign_certificate",
//!     || client.clone().sign_certificate(request.clone()),
//!     is_retryable_status,
//! )
//! .await?;
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::{debug, warn};

/// How often and how long to try an operation.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Values below 1 are
    /// treated as 1.
    pub max_attempts: u32,
    /// Upper bound on a single attempt.
    pub per_attempt_timeout: Duration,
    /// Pause between attempts.
    pub backoff: Duration,
    /// Fraction of `backoff` applied as random jitter in either direction.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            per_attempt_timeout: Duration::from_secs(3),
            backoff: Duration::from_millis(50),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Default policy with a different attempt limit.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    fn jittered_backoff(&self) -> Duration {
        if self.jitter <= 0.0 || self.backoff.is_zero() {
            return self.backoff;
        }
        let jitter = self.jitter.min(1.0);
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::from_secs_f64(self.backoff.as_secs_f64() * factor)
    }
}

/// Why a retried operation did not produce a value.
#[derive(Debug)]
pub enum RetryError<E> {
    /// A non-retryable failure. No further attempts were made.
    Rejected {
        /// Attempts made, including the rejected one.
        attempts: u32,
        /// The error returned by the operation.
        error: E,
    },
    /// Every attempt failed transiently.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Description of the last failure.
        last_error: String,
    },
    /// The cancellation token fired.
    Cancelled {
        /// Attempts started before cancellation.
        attempts: u32,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Rejected { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }
}

/// Returns true for gRPC codes that indicate a transient server condition.
pub fn is_retryable_status(status: &Status) -> bool {
    matches!(status.code(), Code::Unavailable | Code::ResourceExhausted)
}

/// Runs `operation` under `policy`.
///
/// Returns the value together with the number of attempts it took. A local
/// per-attempt timeout always counts as transient.
pub async fn call_with_retry<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
    is_retryable: P,
) -> Result<(T, u32), RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { attempts: attempt });
        }
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(operation = %operation_name, attempt, "cancelled during attempt");
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            outcome = tokio::time::timeout(policy.per_attempt_timeout, operation()) => outcome,
        };

        let last_error = match outcome {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    debug!(operation = %operation_name, attempt, "succeeded after retry");
                }
                return Ok((value, attempt));
            }
            Ok(Err(e)) if !is_retryable(&e) => {
                return Err(RetryError::Rejected {
                    attempts: attempt,
                    error: e,
                });
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "attempt timed out after {}ms",
                policy.per_attempt_timeout.as_millis()
            ),
        };

        if attempt >= max_attempts {
            warn!(
                operation = %operation_name,
                attempt,
                error = %last_error,
                "giving up after max attempts"
            );
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last_error,
            });
        }

        let delay = policy.jittered_backoff();
        warn!(
            operation = %operation_name,
            attempt,
            error = %last_error,
            delay_ms = delay.as_millis() as u64,
            "transient failure, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
