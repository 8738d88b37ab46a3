//! Bounded retry with backoff and cancellation.
//!
//! Used for reconnects (linear backoff) and publishes (fixed delay). The
//! operation receives the 1-based attempt number; sleeps between attempts
//! end early when the cancellation token fires.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failure.
    Fixed,
    /// `delay * attempt` after the n-th failure.
    Linear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            delay: base_delay,
            backoff: Backoff::Linear,
        }
    }

    /// Delay to wait after the given failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Linear => self.delay.saturating_mul(attempt.max(1)),
        }
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed; `last` is the final error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    /// The operation reported an error that retrying cannot fix.
    #[error("aborted: {0}")]
    Aborted(E),
    /// The cancellation token fired before success.
    #[error("cancelled")]
    Cancelled,
}

/// Sleep for `duration` unless `cancel` fires first. Returns `false` when cancelled.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Run `op` until it succeeds, the attempts run out, or `cancel` fires.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    retry_when(policy, cancel, op, |_| true).await
}

/// Like [`retry_with_backoff`], but errors for which `retryable` returns
/// `false` stop immediately with [`RetryError::Aborted`].
pub async fn retry_when<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
    retryable: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !retryable(&e) => return Err(RetryError::Aborted(e)),
            Err(e) if attempt >= max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: e,
                })
            }
            Err(e) => {
                let wait = policy.delay_for(attempt);
                debug!(
                    attempt,
                    max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %e,
                    "Attempt failed, backing off"
                );
                if !sleep_or_cancel(wait, cancel).await {
                    return Err(RetryError::Cancelled);
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_linear_delay_grows_with_attempt() {
        let policy = RetryPolicy::linear(5, Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(6));

        let fixed = RetryPolicy::fixed(5, Duration::from_secs(1));
        assert_eq!(fixed.delay_for(4), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_error_messages() {
        use crate::error::TransportError;

        let exhausted = RetryError::Exhausted {
            attempts: 5,
            last: TransportError::Dial("refused".to_string()),
        };
        assert!(exhausted.to_string().starts_with("gave up after 5 attempts: "));
        assert!(exhausted.to_string().contains("refused"));
        assert_eq!(RetryError::Aborted("bad frame").to_string(), "aborted: bad frame");
        assert_eq!(RetryError::<String>::Cancelled.to_string(), "cancelled");

        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(exhausted);
        assert!(boxed.to_string().contains("refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(5, Duration::from_secs(1));
        let result = retry_with_backoff(&policy, &CancellationToken::new(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err("down")
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reports_last_error() {
        let policy = RetryPolicy::linear(3, Duration::from_millis(10));
        let result: Result<(), _> =
            retry_with_backoff(&policy, &CancellationToken::new(), |attempt| async move {
                Err(format!("failure {}", attempt))
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, "failure 3");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::linear(5, Duration::from_secs(2));

        let task = {
            let calls = calls.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                retry_with_backoff(&policy, &cancel, |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("refused") }
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_aborts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let result: Result<(), _> = retry_when(
            &policy,
            &CancellationToken::new(),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("closed") }
            },
            |e| *e != "closed",
        )
        .await;

        assert!(matches!(result, Err(RetryError::Aborted("closed"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
