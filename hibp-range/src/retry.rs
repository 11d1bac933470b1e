use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Exponential backoff bounded by a total time budget.
///
/// The delay doubles from `initial_interval` on every failed attempt, capped at
/// `max_interval`. No further attempt is made once the next sleep would end
/// past `max_elapsed` measured from the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            max_elapsed: Duration::from_secs(10),
        }
    }
}

/// The last failure of an operation that ran out of retry budget.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub last: E,
    pub attempts: u32,
}

impl Backoff {
    /// Sleep before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_interval.saturating_mul(factor).min(self.max_interval)
    }

    /// Runs `op` until it succeeds or the budget is spent.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, Exhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let last = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let delay = self.delay(attempts);
            if start.elapsed() + delay > self.max_elapsed {
                return Err(Exhausted { last, attempts });
            }

            debug!(attempt = attempts, delay_ms = delay.as_millis() as u64, error = %last, "retrying");
            tokio::time::sleep(delay).await;
        }
    }
}
