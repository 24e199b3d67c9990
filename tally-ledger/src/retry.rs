//! Exponential backoff with cap and jitter for accrual re-polls.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first re-poll, before jitter.
    pub base_delay: Duration,
    /// Cap on the exponential curve, before jitter.
    pub max_delay: Duration,
    /// Total polls allowed for one order, the first one included.
    pub max_attempts: u32,
    /// The delay is multiplied by a random factor in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 12,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^attempt, max_delay)`, without jitter. `attempt` is 0-indexed.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exponential_ms = base_ms.saturating_mul(1u64 << attempt.min(20));
        Duration::from_millis(exponential_ms.min(self.max_delay.as_millis() as u64))
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return capped;
        }

        let factor = 1.0 + rand::rng().random_range(-jitter..=jitter);
        capped.mul_f64(factor)
    }

    /// Whether poll number `attempt` (0-indexed) may still be issued.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
