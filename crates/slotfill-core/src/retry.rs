//! Retry with exponential backoff.
//!
//! Every upstream request goes through [`with_retry_outcome`]. A request moves
//! through a small state machine:
//!
//! ```text
//! Idle ─► Requesting ─┬─► Success
//!                     ├─► Backoff ─► Requesting      (rate limited / transient)
//!                     └─► Exhausted                  (budget spent or fatal)
//! ```
//!
//! Rate-limit responses may carry a server-provided `Retry-After`, which
//! replaces the computed delay for that attempt.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{ApiError, Error, Result};

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Initial delay before first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each retry.
    pub backoff_factor: f64,
    /// Random jitter range as percentage (0.1 = ±10%).
    pub jitter_percent: f64,
    /// Maximum number of attempts, including the first. None = unbounded.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(4),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with the specified parameters.
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
            max_attempts,
        }
    }

    /// Policy that never sleeps; used by tests and dry runs.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
            jitter_percent: 0.0,
            max_attempts: Some(max_attempts),
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        // 31 doublings already exceed any practical max_delay
        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 && base_ms > 0.0 {
            let jitter_range = base_ms * self.jitter_percent;
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let delay_ms = (base_ms + jitter).max(0.0);
        Duration::from_millis(delay_ms as u64)
    }

    /// Delay for the next attempt, honoring a server-provided hint.
    #[must_use]
    pub fn delay_with_hint(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        hint.unwrap_or_else(|| self.delay_for_attempt(attempt))
    }
}

/// Where a request currently is in its retry lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Requesting { attempt: u32 },
    Backoff { attempt: u32, delay: Duration },
    Success { attempts: u32 },
    Exhausted { attempts: u32 },
}

impl RetryState {
    /// Whether no further transitions will happen.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::Exhausted { .. })
    }
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The result (success or final error).
    pub result: Result<T>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent (including delays).
    pub elapsed: Duration,
    /// Terminal state reached.
    pub state: RetryState,
}

/// Check if an error is retryable.
#[must_use]
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Api(e) => match e {
            ApiError::RateLimited { .. } => true,
            ApiError::Transient(_) => true,
            ApiError::RateLimitExceeded { .. } => false,
            ApiError::Rejected { status, .. } => *status >= 500,
            ApiError::Decode(_) => false,
        },
        Error::Io(_) => true,
        Error::Storage(_) => false,
        Error::InvalidRange(_) => false,
        Error::Config(_) => false,
        Error::Json(_) => false,
        Error::Cancelled(_) => false,
    }
}

fn retry_after_hint(error: &Error) -> Option<Duration> {
    match error {
        Error::Api(ApiError::RateLimited { retry_after }) => *retry_after,
        _ => None,
    }
}

/// Execute an async operation with smart retry, returning detailed outcome.
///
/// Non-retryable errors end the loop immediately. When the budget runs out on
/// a rate-limit response the error becomes [`ApiError::RateLimitExceeded`].
pub async fn with_retry_outcome<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        total_attempts = attempt + 1,
                        retries = attempt,
                        "Request succeeded after retries"
                    );
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    elapsed: start.elapsed(),
                    state: RetryState::Success {
                        attempts: attempt + 1,
                    },
                };
            }
            Err(e) => {
                attempt += 1;

                if !is_retryable(&e) {
                    debug!(attempt, error = %e, "Non-retryable error, giving up");
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                        state: RetryState::Exhausted { attempts: attempt },
                    };
                }

                if let Some(max) = policy.max_attempts {
                    if attempt >= max {
                        warn!(
                            attempt,
                            max_attempts = max,
                            error = %e,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "Request failed after all retry attempts"
                        );
                        let err = match e {
                            Error::Api(ApiError::RateLimited { .. }) => {
                                Error::Api(ApiError::RateLimitExceeded { attempts: attempt })
                            }
                            other => other,
                        };
                        return RetryOutcome {
                            result: Err(err),
                            attempts: attempt,
                            elapsed: start.elapsed(),
                            state: RetryState::Exhausted { attempts: attempt },
                        };
                    }
                }

                let delay = policy.delay_with_hint(attempt - 1, retry_after_hint(&e));
                let state = RetryState::Backoff { attempt, delay };
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    state = ?state,
                    "Backing off before retry"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
