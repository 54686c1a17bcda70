// Retry
//
// Provider calls that fail transiently are retried. Only errors accepted by
// the caller's predicate are retried; everything else surfaces immediately.
// Backoff grows linearly: attempt `n` is followed by a sleep of
// `n * backoff_step`.

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::config::TimingConfig;
use crate::error::{Error, Result};

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn from_timing(timing: &TimingConfig) -> Self {
        Self {
            max_attempts: timing.rate_limit_attempts.max(1),
            backoff_step: timing.rate_limit_backoff(),
        }
    }
}

/// Run `operation`, retrying while `retryable` accepts the error. Exhausting
/// the attempts on a retryable error is reported as a discovery failure.
pub async fn retry_when<F, Fut, T, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    retryable: P,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !retryable(&e) => return Err(e),
            Err(e) if attempt >= policy.max_attempts => {
                error!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "giving up after repeated throttling"
                );
                return Err(Error::discovery(format!(
                    "{} failed after {} attempts: {}",
                    operation_name, attempt, e
                )));
            }
            Err(e) => {
                let delay = policy.backoff_step * attempt;
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "throttled, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_step: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_throttling() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = retry_when(&fast(), "describe", Error::is_rate_limit, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::RateLimit("Request limit exceeded".into()))
                } else {
                    Ok("i-123")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "i-123");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<()> = retry_when(&fast(), "describe", Error::is_rate_limit, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::RateLimit("RequestLimitExceeded".into()))
            }
        })
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Discovery(_)));
        assert!(err.to_string().contains("after 3 attempts"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<()> = retry_when(&fast(), "describe", Error::is_rate_limit, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::discovery("UnauthorizedOperation"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_policy_from_timing() {
        let policy = RetryPolicy::from_timing(&TimingConfig::default());
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_step, Duration::from_secs(10));
    }
}
