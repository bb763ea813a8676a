use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::CoreError;

/// Exponential backoff with jitter: delay `base * 2^i`, capped
/// at `max_delay`, plus up to 20% jitter. Only `CoreError::is_retryable`
/// errors are retried; everything else returns on the first attempt.
/// Honors an explicit `Retry-After` hint over the computed backoff delay.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        Self { max_attempts: max_attempts.max(1), base_delay, max_delay }
    }

    fn backoff_delay(
        &self,
        attempt: u32,
    ) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let scaled = base_ms.saturating_mul(1u64 << attempt.min(32));
        let capped = scaled.min(self.max_delay.as_millis() as u64);
        let jitter_fraction: f64 = rand::thread_rng().gen_range(0.0..0.2);
        let jittered = capped + (capped as f64 * jitter_fraction) as u64;
        Duration::from_millis(jittered)
    }

    /// Runs `f` (a closure producing a fresh future per attempt), retrying
    /// transient failures.
    pub async fn run<F, Fut, T>(
        &self,
        mut f: F,
    ) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 >= self.max_attempts || !e.is_retryable() => {
                    return Err(e);
                }
                Err(e) => {
                    let delay = e
                        .retry_after_secs()
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| self.backoff_delay(attempt));
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use super::*;

    #[tokio::test]
    async fn retries_transient_until_success() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(5));
        let attempts = AtomicU32::new(0);
        let result = policy
            .run(|| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(CoreError::Transient(anyhow::anyhow!("boom")))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(5));
        let attempts = AtomicU32::new(0);
        let result: Result<(), CoreError> = policy
            .run(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(CoreError::Permanent("bad request".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stops_after_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));
        let attempts = AtomicU32::new(0);
        let result: Result<(), CoreError> = policy
            .run(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(CoreError::Transient(anyhow::anyhow!("boom"))) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
