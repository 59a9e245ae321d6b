use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Default ceiling for reconnect waits (5 minutes).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

/// Upper bound, exclusive, of the uniform jitter added to each wait.
const JITTER_MS: u64 = 1000;

/// Escalating wait after repeated failures.
///
/// `longer()` bumps the attempt counter and sleeps for
/// `min(max_delay, 2^attempt s + jitter)`; `zero()` forgets every failure.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    max_delay: Duration,
}

impl Backoff {
    pub fn new(max_delay: Duration) -> Self {
        Self {
            attempt: 0,
            max_delay,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay for a given attempt and jitter, capped at `max_delay`.
    pub fn compute_delay(attempt: u32, jitter: Duration, max_delay: Duration) -> Duration {
        let base = 2u64
            .checked_pow(attempt)
            .map(Duration::from_secs)
            .unwrap_or(Duration::MAX);
        base.saturating_add(jitter).min(max_delay)
    }

    /// Increment the attempt counter and return the delay to wait, without sleeping.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let jitter = Duration::from_millis(rand::rng().random_range(0..JITTER_MS));
        Self::compute_delay(self.attempt, jitter, self.max_delay)
    }

    /// Register a failure and wait out the resulting delay.
    pub async fn longer(&mut self) -> Duration {
        let delay = self.next_delay();
        debug!(
            component = "backoff",
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Backing off"
        );
        tokio::time::sleep(delay).await;
        delay
    }

    pub fn zero(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DELAY)
    }
}
