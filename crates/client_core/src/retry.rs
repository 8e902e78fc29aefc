use std::{fmt::Display, future::Future, time::Duration};

use tracing::warn;

/// Exponential backoff with a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (zero based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let bounded = self
            .base_delay_ms
            .saturating_mul(multiplier)
            .min(self.max_delay_ms);
        Duration::from_millis(bounded)
    }

    /// Whether another attempt may follow `failures` consecutive failures.
    pub fn allows_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(500, 30_000, 10)
    }
}

/// Runs `operation` until it succeeds, `should_retry` rejects the error, or the
/// policy runs out of attempts. The last error is returned.
pub async fn retry_async<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    should_retry: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut failures = 0_u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                failures += 1;
                if !should_retry(&error) || !policy.allows_retry(failures) {
                    return Err(error);
                }
                let delay = policy.delay_for_attempt(failures - 1);
                warn!(
                    operation = what,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
