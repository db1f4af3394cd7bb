//! Bounded exponential-backoff retry.
//!
//! [`RetryExecutor`] wraps any async operation. It knows nothing about what it
//! wraps: the caller supplies a predicate that classifies retryable failures.
//!
//! # Schedule
//!
//! The delay before retry `n` (counting from 0) is
//! `min(max_delay, initial_delay * factor^n)`. With the defaults
//! (100 ms, ×2, 10 s ceiling) that is 0.1 s, 0.2 s, 0.4 s, … 6.4 s, 10 s, 10 s.
//! After `max_attempts` total attempts the last error is returned.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};

/// Parameters of the backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_secs(10),
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            factor: config.factor,
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
        }
    }

    /// Same schedule with a different attempt budget (used for startup probes).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before the retry with zero-based index `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.initial_delay.as_millis() as f64 * exp;
        let ceiling = self.max_delay.as_millis() as f64;
        if !millis.is_finite() || millis >= ceiling {
            self.max_delay
        } else {
            Duration::from_millis(millis as u64)
        }
    }
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.
    pub async fn run<T, E, F, Fut, P>(&self, mut op: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if !is_retryable(&err) || attempt >= max_attempts {
                        return Err(err);
                    }
                    let delay = self.policy.delay_for(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// [`run`](Self::run) specialised to [`SyncError`] and its own
    /// retryability classification.
    pub async fn run_sync<T, F, Fut>(&self, op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        self.run(op, SyncError::is_retryable).await
    }
}

/// Bound a single call. An elapsed timer becomes [`SyncError::Timeout`],
/// which the executor treats as transient.
pub async fn with_timeout<T, Fut>(limit: Duration, fut: Fut) -> SyncResult<T>
where
    Fut: Future<Output = SyncResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }

    #[test]
    fn delay_grows_then_caps() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(800));
        assert_eq!(p.delay_for(4), Duration::from_millis(1000));
        assert_eq!(p.delay_for(60), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let exec = RetryExecutor::new(policy());
        let start = Instant::now();

        let result = exec
            .run_sync(move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(SyncError::SourceUnavailable("connection refused".into()))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff under paused time
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_fails_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let exec = RetryExecutor::new(policy());
        let start = Instant::now();

        let result: SyncResult<()> = exec
            .run_sync(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::SourceQuery("relation does not exist".into()))
            })
            .await;

        assert!(matches!(result, Err(SyncError::SourceQuery(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts_with_last_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let exec = RetryExecutor::new(policy());

        let result: SyncResult<()> = exec
            .run_sync(move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::IndexUnavailable(format!("attempt {}", n)))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        match result {
            Err(SyncError::IndexUnavailable(msg)) => assert_eq!(msg, "attempt 4"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn custom_predicate_is_respected() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let exec = RetryExecutor::new(policy());

        let result: Result<(), String> = exec
            .run(
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("fatal".to_string())
                },
                |e: &String| e != "fatal",
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_reported_as_retryable() {
        let result: SyncResult<()> = with_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, SyncError::Timeout(_)));
        assert!(err.is_retryable());
    }
}
