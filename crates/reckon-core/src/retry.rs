//! Exponential backoff with full jitter for transient upstream failures

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::JobsConfig;
use crate::error::Result;

/// Retry policy for calls to external capabilities
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl From<&JobsConfig> for RetryPolicy {
    fn from(config: &JobsConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: config.backoff_base,
            max: config.backoff_max,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts (tests)
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Upper bound of the delay before retry number `attempt` (1-based)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Full jitter: uniform in [0, ceiling]
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

/// Run `op`, retrying transient errors until the policy runs out
///
/// Permanent errors are returned immediately.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error_kind = e.kind(),
                    "Transient failure, backing off"
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
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_ceiling_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(policy.ceiling(1), Duration::from_millis(100));
        assert_eq!(policy.ceiling(2), Duration::from_millis(200));
        assert_eq!(policy.ceiling(3), Duration::from_millis(400));
        assert_eq!(policy.ceiling(4), Duration::from_millis(500));
        for attempt in 1..6 {
            assert!(policy.delay(attempt) <= policy.ceiling(attempt));
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_backoff(&RetryPolicy::immediate(3), "test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::RateLimited("mock".to_string()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_backoff(&RetryPolicy::immediate(2), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Timeout(1))
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(1))));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_backoff(&RetryPolicy::immediate(5), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Llm("bad request".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
