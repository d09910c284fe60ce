use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

use super::HypervisorError;

/// Exponential backoff bounds for lock-contended hypervisor calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Profile for template-heavy work (replication, conversion) where the
    /// source stays locked for minutes at a time.
    pub fn template_heavy() -> Self {
        Self {
            max_attempts: 15,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[derive(Debug)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
}

/// Retries an operation only while it fails with lock contention.
/// Every other error is returned after the first attempt.
#[derive(Debug, Clone)]
pub struct LockRetry {
    policy: RetryPolicy,
}

impl LockRetry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds, fails terminally, or the attempt
    /// ceiling is reached. The closure receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        mut operation: F,
    ) -> Result<(T, u32), RetryFailure<HypervisorError>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, HypervisorError>>,
    {
        let max_attempts = self.policy.attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            operation = label,
                            attempts = attempt,
                            "Operation succeeded after lock retries"
                        );
                    }
                    return Ok((value, attempt));
                }
                Err(e) if e.is_lock_contention() && attempt < max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        operation = label,
                        error = e.to_string(),
                        retry_count = attempt,
                        max_attempts,
                        delay_secs = delay.as_secs_f64(),
                        "Resource locked, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_lock_contention() {
                        error!(
                            operation = label,
                            error = e.to_string(),
                            attempts = attempt,
                            "Maximum lock retries reached"
                        );
                    }
                    return Err(RetryFailure {
                        error: e,
                        attempts: attempt,
                    });
                }
            }
        }
    }
}
