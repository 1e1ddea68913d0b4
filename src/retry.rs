//! Retry strategies, predicates and the retry wrapper.
//!
//! Retrying is only safe when the server cannot have acted on the request
//! yet, or when acting on it twice has no extra effect. The default predicate
//! [`RetryOnSafeFailure`] encodes that rule; [`RetryStrategy`] decides how many
//! times and how fast.

use crate::{chain::Next, error::TransportStage, Envelope, Error, Request, Result, Wrapper};
use async_trait::async_trait;
use http::StatusCode;
use rand::Rng;
use std::time::Duration;

/// Defines how many times and how quickly to retry.
///
/// # Examples
///
/// ```
/// use cplane::RetryStrategy;
/// use std::time::Duration;
///
/// // Two immediate retries (the default)
/// let default = RetryStrategy::default();
/// assert_eq!(default.max_retries(), Some(2));
///
/// // Exponential backoff: 100ms, 200ms, 400ms, 800ms...
/// let exponential = RetryStrategy::ExponentialBackoff {
///     initial_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(30),
///     max_retries: 5,
///     jitter: true,
/// };
/// ```
#[derive(Debug, Clone)]
pub enum RetryStrategy {
    /// Do not retry failed requests.
    None,

    /// Retry right away, up to `max_retries` times.
    Immediate {
        /// The maximum number of retry attempts.
        max_retries: usize,
    },

    /// Retry with a fixed delay between attempts.
    Linear {
        /// The delay between retry attempts.
        delay: Duration,
        /// The maximum number of retry attempts.
        max_retries: usize,
    },

    /// Retry with exponentially increasing delays.
    ///
    /// Each retry waits for `initial_delay * 2^(attempt - 1)` (capped at
    /// `max_delay`). Optional jitter scales each delay to 50-100%.
    ExponentialBackoff {
        /// The initial delay before the first retry.
        initial_delay: Duration,
        /// The maximum delay between retries.
        max_delay: Duration,
        /// The maximum number of retry attempts.
        max_retries: usize,
        /// Whether to add random jitter to delays.
        jitter: bool,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Immediate { max_retries: 2 }
    }
}

impl RetryStrategy {
    /// Returns the delay before the given retry, or `None` if retries are
    /// exhausted.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The retry number (1-indexed, so 1 = first retry)
    pub fn delay_for_attempt(&self, attempt: usize) -> Option<Duration> {
        match self {
            RetryStrategy::None => None,
            RetryStrategy::Immediate { max_retries } => {
                (attempt <= *max_retries).then_some(Duration::ZERO)
            }
            RetryStrategy::Linear { delay, max_retries } => {
                (attempt <= *max_retries).then_some(*delay)
            }
            RetryStrategy::ExponentialBackoff {
                initial_delay,
                max_delay,
                max_retries,
                jitter,
            } => {
                if attempt > *max_retries {
                    return None;
                }

                let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1) as u32);
                let delay = initial_delay.saturating_mul(multiplier).min(*max_delay);

                if *jitter {
                    let jitter_factor = rand::thread_rng().gen_range(0.5..=1.0);
                    Some(delay.mul_f64(jitter_factor))
                } else {
                    Some(delay)
                }
            }
        }
    }

    /// Returns the maximum number of retries.
    pub fn max_retries(&self) -> Option<usize> {
        match self {
            RetryStrategy::None => Some(0),
            RetryStrategy::Immediate { max_retries } => Some(*max_retries),
            RetryStrategy::Linear { max_retries, .. } => Some(*max_retries),
            RetryStrategy::ExponentialBackoff { max_retries, .. } => Some(*max_retries),
        }
    }
}

/// The outcome of one attempt, as seen by a [`RetryPredicate`].
#[derive(Debug, Clone, Copy)]
pub enum Attempt<'a> {
    /// No response was obtained.
    Failed(&'a Error),
    /// A response was obtained.
    Answered(&'a Envelope),
}

/// Decides whether an attempt should be repeated.
///
/// # Examples
///
/// ```
/// use cplane::retry::{Attempt, RetryPredicate};
/// use cplane::Request;
///
/// struct RetryOnConflict;
///
/// impl RetryPredicate for RetryOnConflict {
///     fn should_retry(&self, _request: &Request, attempt: Attempt<'_>, _n: usize) -> bool {
///         matches!(attempt, Attempt::Answered(e) if e.status.as_u16() == 409)
///     }
/// }
/// ```
pub trait RetryPredicate: Send + Sync {
    /// Returns `true` if `request` should be sent again.
    ///
    /// # Arguments
    ///
    /// * `request` - The request that was sent
    /// * `attempt` - What happened
    /// * `n` - The attempt number (1-indexed)
    fn should_retry(&self, request: &Request, attempt: Attempt<'_>, n: usize) -> bool;
}

/// Retries only when doing so cannot repeat a side effect.
///
/// - Connection failures: always (nothing was sent).
/// - Broken-off exchanges and timeouts: idempotent methods only.
/// - 502/503/504 with a body that is not a structured error: idempotent
///   methods only.
///
/// A response carrying a structured application error is never retried.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryOnSafeFailure;

impl RetryPredicate for RetryOnSafeFailure {
    fn should_retry(&self, request: &Request, attempt: Attempt<'_>, _n: usize) -> bool {
        match attempt {
            Attempt::Failed(Error::Request {
                stage: TransportStage::Connect,
                ..
            }) => true,
            Attempt::Failed(e) => e.is_retryable() && request.is_idempotent(),
            Attempt::Answered(envelope) => {
                request.is_idempotent()
                    && matches!(
                        envelope.status,
                        StatusCode::BAD_GATEWAY
                            | StatusCode::SERVICE_UNAVAILABLE
                            | StatusCode::GATEWAY_TIMEOUT
                    )
                    && matches!(envelope.error(), Some(Error::RawHttpStatus { .. }))
            }
        }
    }
}

/// Retries only transport failures where nothing was sent.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnConnectionError;

impl RetryPredicate for RetryOnConnectionError {
    fn should_retry(&self, _request: &Request, attempt: Attempt<'_>, _n: usize) -> bool {
        matches!(
            attempt,
            Attempt::Failed(Error::Request {
                stage: TransportStage::Connect,
                ..
            })
        )
    }
}

/// Combine multiple retry predicates with OR logic.
pub struct OrPredicate {
    predicates: Vec<Box<dyn RetryPredicate>>,
}

impl OrPredicate {
    /// Creates a new `OrPredicate` from a list of predicates.
    pub fn new(predicates: Vec<Box<dyn RetryPredicate>>) -> Self {
        Self { predicates }
    }
}

impl RetryPredicate for OrPredicate {
    fn should_retry(&self, request: &Request, attempt: Attempt<'_>, n: usize) -> bool {
        self.predicates
            .iter()
            .any(|p| p.should_retry(request, attempt, n))
    }
}

/// Wrapper that re-sends a request on failures its predicate accepts.
///
/// Every attempt sends the same [`Request`] value, so the body is identical
/// on each try. When retries run out the last outcome is returned unchanged:
/// the last error, or the last envelope.
pub struct RetryWrapper {
    strategy: RetryStrategy,
    predicate: Box<dyn RetryPredicate>,
}

impl RetryWrapper {
    /// Creates a retry wrapper with the default predicate.
    pub fn new(strategy: RetryStrategy) -> Self {
        Self::with_predicate(strategy, Box::new(RetryOnSafeFailure))
    }

    /// Creates a retry wrapper with a custom predicate.
    pub fn with_predicate(strategy: RetryStrategy, predicate: Box<dyn RetryPredicate>) -> Self {
        Self {
            strategy,
            predicate,
        }
    }
}

#[async_trait]
impl Wrapper for RetryWrapper {
    async fn wrap(&self, request: &Request, next: Next<'_>) -> Result<Envelope> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = next.run(request).await;

            let retry = match &result {
                Ok(envelope) if envelope.is_success() => false,
                Ok(envelope) => {
                    self.predicate
                        .should_retry(request, Attempt::Answered(envelope), attempt)
                }
                Err(e) => self
                    .predicate
                    .should_retry(request, Attempt::Failed(e), attempt),
            };

            let delay = if retry {
                self.strategy.delay_for_attempt(attempt)
            } else {
                None
            };

            let Some(delay) = delay else {
                return result.map(|mut envelope| {
                    envelope.attempts = attempt;
                    envelope
                });
            };

            match &result {
                Err(e) => tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    method = %request.method(),
                    "Request failed"
                ),
                Ok(envelope) => tracing::warn!(
                    status = envelope.status.as_u16(),
                    attempt = attempt,
                    method = %request.method(),
                    "Request failed"
                ),
            }
            tracing::info!(
                delay_ms = delay.as_millis(),
                attempt = attempt,
                "Retrying request after delay"
            );

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}
