//! Exponential backoff around fallible async operations

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::E2eError;

/// Decides whether an error is worth another attempt
pub type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Attempt budget, backoff base and retry eligibility
pub struct RetryPolicy<E = E2eError> {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Cap applied to any single delay
    pub max_delay: Duration,
    is_retryable: RetryPredicate<E>,
}

impl RetryPolicy {
    /// Policy retrying timeout, connection and network errors
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self::with_predicate(max_attempts, base_delay, E2eError::is_transient)
    }
}

impl<E> RetryPolicy<E> {
    pub fn with_predicate<P>(max_attempts: u32, base_delay: Duration, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::MAX,
            is_retryable: Arc::new(predicate),
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Same budget, different eligibility rule
    pub fn retrying<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.is_retryable = Arc::new(predicate);
        self
    }

    pub fn is_retryable(&self, error: &E) -> bool {
        (self.is_retryable)(error)
    }

    /// Wait after the `attempt`-th failure: `base_delay * 2^(attempt-1)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            is_retryable: Arc::clone(&self.is_retryable),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

/// Runs operations under a [`RetryPolicy`]
#[derive(Debug)]
pub struct RetryExecutor<E = E2eError> {
    policy: RetryPolicy<E>,
}

impl<E> Clone for RetryExecutor<E> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
        }
    }
}

impl<E: fmt::Display> RetryExecutor<E> {
    pub fn new(policy: RetryPolicy<E>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy<E> {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget is spent. The final error is returned as-is.
    pub async fn execute<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = label, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if attempt < self.policy.max_attempts && self.policy.is_retryable(&err) => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryExecutor {
        RetryExecutor::new(RetryPolicy::new(max_attempts, Duration::from_millis(1)))
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));

        let capped = policy.with_max_delay(Duration::from_millis(250));
        assert_eq!(capped.delay_for(3), Duration::from_millis(250));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.max_attempts, 1);
    }

    #[tokio::test]
    async fn test_retries_transient_until_budget_spent() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), E2eError> = fast(3)
            .execute("restore", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(E2eError::Timeout { operation: format!("attempt {}", n), millis: 1 })
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(E2eError::Timeout { operation, .. }) => assert_eq!(operation, "attempt 3"),
            other => panic!("expected the last timeout unchanged, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_fails_on_first_attempt() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), E2eError> = fast(5)
            .execute("guarded delete", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(E2eError::AssertionFailed("customer row missing".into()))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(E2eError::AssertionFailed(_))));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let calls = &AtomicU32::new(0);
        let value = fast(3)
            .execute("lookup", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(E2eError::Step("connection reset by peer".into()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_custom_predicate_and_error_type() {
        let calls = &AtomicU32::new(0);
        let executor = RetryExecutor::new(RetryPolicy::with_predicate(
            4,
            Duration::from_millis(1),
            |e: &String| e.starts_with("busy"),
        ));

        let result: Result<(), String> = executor
            .execute("custom", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("busy".to_string())
                } else {
                    Err("broken".to_string())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err(), "broken");
    }
}
