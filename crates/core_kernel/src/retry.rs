//! Retry execution
//!
//! [`Retrier`] repeatedly invokes a fallible async operation according to a
//! [`RetryPolicy`]. Attempts run strictly one after another; the only
//! suspension point between them is the backoff wait, which races against
//! a [`CancellationToken`].
//!
//! A call ends in one of four ways:
//!
//! - the operation succeeds and its value is returned
//! - the policy predicate rejects the error ([`RetryError::NonRetryable`])
//! - the attempt budget is consumed ([`RetryError::Exhausted`])
//! - the token is cancelled ([`RetryError::Cancelled`])
//!
//! # Example
//!
//! ```rust,ignore
//! use core_kernel::{Retrier, RetryPolicy, BackoffPolicy};
//! use tokio_util::sync::CancellationToken;
//!
//! let policy = RetryPolicy::new()
//!     .with_max_attempts(5)
//!     .with_backoff(BackoffPolicy::exponential(base, 2.0, max))
//!     .with_predicate(|e: &MyError| e.is_transient());
//! let retrier = Retrier::new(policy);
//!
//! let value = retrier.run(&CancellationToken::new(), || fetch()).await?;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::{BackoffPolicy, RandomSource, ThreadRandom};

/// Default attempt budget
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Outcome of a retried operation that did not succeed
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Cancellation fired before an attempt or during a backoff wait
    #[error("operation cancelled")]
    Cancelled,

    /// The operation failed with an error the policy will not retry
    #[error("unretryable error: {0}")]
    NonRetryable(#[source] E),

    /// Every permitted attempt failed; carries the last failure
    #[error("all {attempts} attempts failed: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    /// Returns true if the call was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }

    /// Returns true if the predicate rejected the failure
    pub fn is_non_retryable(&self) -> bool {
        matches!(self, RetryError::NonRetryable(_))
    }

    /// Returns true if the attempt budget was consumed
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    /// The wrapped operation error, if any
    pub fn inner(&self) -> Option<&E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::NonRetryable(e) | RetryError::Exhausted { source: e, .. } => Some(e),
        }
    }

    /// Consumes the error and returns the wrapped operation error, if any
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::NonRetryable(e) | RetryError::Exhausted { source: e, .. } => Some(e),
        }
    }
}

type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Immutable retry configuration
///
/// Built once and shared; cloning is cheap and all clones behave identically.
pub struct RetryPolicy<E> {
    max_attempts: u32,
    backoff: BackoffPolicy,
    is_retryable: Predicate<E>,
    random: Arc<dyn RandomSource>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            is_retryable: Arc::clone(&self.is_retryable),
            random: Arc::clone(&self.random),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("random", &self.random)
            .finish_non_exhaustive()
    }
}

impl<E> Default for RetryPolicy<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> RetryPolicy<E> {
    /// Creates a policy with three attempts, the default linear backoff,
    /// and a predicate that retries every error
    pub fn new() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            is_retryable: Arc::new(|_: &E| true),
            random: Arc::new(ThreadRandom),
        }
    }

    /// Sets the attempt budget; zero means unbounded
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the backoff strategy
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the predicate deciding whether a failure may be retried
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.is_retryable = Arc::new(predicate);
        self
    }

    /// Sets the random source used for jitter
    pub fn with_random_source<R>(mut self, random: R) -> Self
    where
        R: RandomSource + 'static,
    {
        self.random = Arc::new(random);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Returns true if the policy permits retrying `error`
    pub fn is_retryable(&self, error: &E) -> bool {
        (self.is_retryable)(error)
    }

    fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }
}

/// Stateless executor applying a [`RetryPolicy`] to async operations
///
/// Holds no per-call state, so one instance can serve any number of
/// concurrent callers.
pub struct Retrier<E> {
    policy: RetryPolicy<E>,
}

impl<E> Clone for Retrier<E> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
        }
    }
}

impl<E> fmt::Debug for Retrier<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retrier").field("policy", &self.policy).finish()
    }
}

impl<E> Default for Retrier<E> {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl<E> Retrier<E> {
    /// Creates a retrier for the given policy
    pub fn new(policy: RetryPolicy<E>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy<E> {
        &self.policy
    }
}

impl<E> Retrier<E>
where
    E: fmt::Display,
{
    /// Runs `operation` until it succeeds, fails terminally, exhausts the
    /// attempt budget, or `cancel` fires
    ///
    /// The operation is never invoked once the token is cancelled, and a
    /// cancellation during a backoff wait returns immediately.
    ///
    /// # Errors
    ///
    /// * [`RetryError::Cancelled`] - the token fired first
    /// * [`RetryError::NonRetryable`] - the policy predicate rejected the failure
    /// * [`RetryError::Exhausted`] - `max_attempts` failures in a row
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !self.policy.is_retryable(&error) {
                warn!(attempt, error = %error, "operation failed with unretryable error");
                return Err(RetryError::NonRetryable(error));
            }

            if !self.policy.allows_attempt(attempt.saturating_add(1)) {
                warn!(
                    attempts = self.policy.max_attempts,
                    error = %error,
                    "all retry attempts failed"
                );
                return Err(RetryError::Exhausted {
                    attempts: self.policy.max_attempts,
                    source: error,
                });
            }

            let delay = self.policy.backoff.next(attempt, self.policy.random.as_ref());
            debug!(attempt, ?delay, error = %error, "operation failed, retrying");

            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            attempt = attempt.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "boom")
        }
    }

    #[test]
    fn test_policy_defaults() {
        let policy: RetryPolicy<Boom> = RetryPolicy::new();

        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(*policy.backoff(), BackoffPolicy::default());
        assert!(policy.is_retryable(&Boom));
    }

    #[test]
    fn test_unbounded_policy_allows_any_attempt() {
        let policy: RetryPolicy<Boom> = RetryPolicy::new().with_max_attempts(0);
        assert!(policy.allows_attempt(u32::MAX - 1));
    }

    #[test]
    fn test_retry_error_inner() {
        let err: RetryError<Boom> = RetryError::Exhausted {
            attempts: 3,
            source: Boom,
        };
        assert!(err.is_exhausted());
        assert!(err.inner().is_some());
        assert_eq!(err.to_string(), "all 3 attempts failed: boom");

        let cancelled: RetryError<Boom> = RetryError::Cancelled;
        assert!(cancelled.into_inner().is_none());
    }
}
