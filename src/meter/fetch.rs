use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use log::{debug, warn};

use super::{MeterSource, TransportError};

/// Bounded exponential backoff: after failed attempt `n` wait
/// `base * 2^(n-1)`, never less than `base` and never more than `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        return RetryPolicy {
            max_attempts: 15,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Pause after the failed attempt `attempt` (1 based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .saturating_mul(factor)
            .clamp(self.base_delay, self.max_delay.max(self.base_delay))
    }

    /// Runs `op` until it succeeds, fails with an error `retryable` rejects,
    /// or `max_attempts` calls were made. The last error is handed back.
    pub async fn run<T, E, F, Fut, P>(&self, label: &str, mut op: F, retryable: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{label}: succeeded on attempt {attempt}");
                    }
                    return Ok(value);
                }
                Err(e) if attempt < self.max_attempts && retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    warn!("{label}: attempt {attempt}/{} failed ({e}), retrying in {}s",
                          self.max_attempts, delay.as_secs_f32());
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// GET `url` with the policy's retry budget around transient failures.
pub async fn fetch<S>(source: &S, url: &str, timeout: Duration, policy: &RetryPolicy) -> Result<String, TransportError>
where
    S: MeterSource + ?Sized,
{
    policy.run(url, |_| source.get_text(url, timeout), TransportError::is_transient).await
}
