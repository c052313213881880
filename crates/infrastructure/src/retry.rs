use std::future::Future;
use std::time::Duration;

use tracing::warn;

use scheduler_errors::SchedulerResult;

/// 瞬时错误的重试策略：固定次数，线性退避
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// 重试整个操作；只有可重试的错误才会重试，其他错误直接返回
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> SchedulerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SchedulerResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "存储操作失败，准备重试"
                    );
                    tokio::time::sleep(self.interval * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1_000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_errors::SchedulerError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result = policy
            .run("op", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SchedulerError::persistence("busy"))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let result: SchedulerResult<()> = policy
            .run("op", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SchedulerError::already_exists("job", "DEFAULT.a"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let result: SchedulerResult<()> = policy
            .run("op", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SchedulerError::lock_unavailable("TRIGGER_ACCESS"))
            })
            .await;
        assert!(matches!(
            result,
            Err(SchedulerError::ClusterLockUnavailable { .. })
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
