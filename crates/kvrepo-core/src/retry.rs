//! Bounded retry with linear backoff.
//!
//! [`RetryPolicy::run`] repeats an operation while it fails with a retryable
//! [`RepoError`]. Attempt `i` (0-indexed) that will be retried sleeps
//! `base_delay * (i + 1)` first. Non-retryable errors return on the spot,
//! and the last error is returned as-is when attempts run out.
//!
//! Callers pick the attempt budget per operation: [`NO_RETRIES`] for
//! anything whose effect is not safe to repeat (increments, appends,
//! exchanges), a larger budget for reads and overwrites.

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::error::RepoError;

/// Attempt budget for non-idempotent operations.
pub const NO_RETRIES: u32 = 1;

/// Default backoff base delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);

/// Retry settings shared by a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY)
    }
}

impl RetryPolicy {
    /// A policy sleeping `base_delay * (attempt + 1)` between attempts.
    pub const fn new(base_delay: Duration) -> Self {
        Self { base_delay }
    }

    /// The backoff base delay.
    pub const fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Sleep before retrying after 0-indexed `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.saturating_add(1))
    }

    /// Run `op` up to `max_attempts` times. A budget of 0 is treated as 1.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error, or the last retryable one
    /// once the budget is spent. Errors are never wrapped.
    pub async fn run<T, F, Fut>(&self, max_attempts: u32, mut op: F) -> Result<T, RepoError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RepoError>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            if attempt.saturating_add(1) >= max_attempts {
                error!(attempt, max_attempts, error = %err, "Failed");
                return Err(err);
            }
            warn!(attempt, max_attempts, error = %err, "Retrying");
            tokio::time::sleep(self.delay_for(attempt)).await;
            attempt = attempt.saturating_add(1);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use kvrepo_store::StoreError;
    use tokio::time::Instant;

    use super::*;

    #[test]
    fn delays_grow_linearly() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(50));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(4), Duration::from_millis(250));
        assert_eq!(
            RetryPolicy::new(Duration::MAX).delay_for(3),
            Duration::MAX
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_budget_and_returns_original_error() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result: Result<(), _> = RetryPolicy::default()
            .run(3, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RepoError::Store(StoreError::Timeout)) }
            })
            .await;

        assert_eq!(result, Err(RepoError::Store(StoreError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 50ms after the first attempt, 100ms after the second, none after the last.
        assert_eq!(started.elapsed(), Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result: Result<(), _> = RetryPolicy::default()
            .run(5, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RepoError::CommitFailed) }
            })
            .await;

        assert_eq!(result, Err(RepoError::CommitFailed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_never_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run(NO_RETRIES, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RepoError::Store(StoreError::Io("reset".to_owned()))) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let value = RetryPolicy::default()
            .run(5, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(RepoError::Store(StoreError::Timeout))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_runs_once() {
        let calls = AtomicU32::new(0);
        let value = RetryPolicy::default()
            .run(0, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, RepoError>(7) }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
