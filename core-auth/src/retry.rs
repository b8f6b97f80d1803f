//! Transient-Failure Retry Policy
//!
//! Wraps a fallible async operation with selective, bounded retry. Only
//! transport-layer failures are re-issued; application-level rejections and
//! malformed-payload errors return immediately on first occurrence.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::error::Result;

/// Bounded retry with linearly increasing backoff.
///
/// `max_retries` is the total number of attempts: a policy with
/// `max_retries = 3` over an always-transiently-failing operation invokes
/// it exactly three times and returns the last error. `max_retries = 0`
/// behaves as a single attempt with no retry.
///
/// The backoff before re-issuing attempt `n + 1` is `base_delay * n`, so
/// successive delays strictly increase with the attempt number. The delay
/// is an async suspension, never a thread block.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Backoff to wait after `attempt` failed attempts.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    /// Run `operation`, re-issuing it on transient failure until it
    /// succeeds, fails permanently, or the attempt budget is exhausted.
    ///
    /// The closure is invoked once per attempt and must produce a fresh
    /// future each time.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient failure, retrying after backoff"
                    );
                    sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn transient() -> AuthError {
        AuthError::RequestFailed("connection reset".to_string())
    }

    fn permanent() -> AuthError {
        AuthError::Backend {
            code: Some("401".to_string()),
            message: "invalid credentials".to_string(),
            details: None,
        }
    }

    fn counting_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_success_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = counting_policy();

        let result: Result<u32> = policy
            .run(|| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_exhaustion_invokes_exactly_max_retries_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = counting_policy();

        let result: Result<()> = policy
            .run(|| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                }
            })
            .await;

        assert_eq!(result.unwrap_err(), transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_invokes_exactly_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = counting_policy();

        let result: Result<()> = policy
            .run(|| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(permanent())
                }
            })
            .await;

        assert_eq!(result.unwrap_err(), permanent());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = counting_policy();

        let result: Result<&'static str> = policy
            .run(|| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok("recovered")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_max_retries_is_a_single_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(0, Duration::from_millis(1));

        let result: Result<()> = policy
            .run(|| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_strictly_increases_with_attempt_number() {
        let policy = RetryPolicy::new(5, Duration::from_millis(200));
        let delays: Vec<_> = (1..5).map(|n| policy.delay_for(n)).collect();

        for pair in delays.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(delays[0], Duration::from_millis(200));
        assert_eq!(delays[3], Duration::from_millis(800));
    }
}
