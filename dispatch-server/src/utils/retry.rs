//! 指数退避重试
//!
//! 只重试 [`AppError::is_retryable`] 的错误（外部依赖故障），其余错误立即返回。

use std::future::Future;
use std::time::Duration;

use super::AppError;

/// 退避策略
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 最多尝试次数（含第一次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay before the retry that follows `attempt` failed attempts:
    /// `base * 2^attempt`, capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay, attempt, self.max_delay)
    }
}

/// `base * 2^attempt`, capped at `max`
pub fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up (the last error is returned).
pub async fn retry_with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation = what,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, retrying: {e}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, 0, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 1, max), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 4, max), Duration::from_secs(32));
        assert_eq!(backoff_delay(base, 5, max), Duration::from_secs(60));
        assert_eq!(backoff_delay(base, 40, max), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(1));

        let c = calls.clone();
        let result = retry_with_backoff(policy, "test", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AppError::unavailable("flaky"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(2, Duration::from_millis(10), Duration::from_secs(1));

        let c = calls.clone();
        let result: Result<(), _> = retry_with_backoff(policy, "test", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(AppError::unavailable("down"))
            }
        })
        .await;

        assert!(matches!(result, Err(AppError::ExternalUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, Duration::from_millis(10), Duration::from_secs(1));

        let c = calls.clone();
        let result: Result<(), _> = retry_with_backoff(policy, "test", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(AppError::validation("bad"))
            }
        })
        .await;

        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
