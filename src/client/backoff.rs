//! Reconnect backoff
//!
//! Exponential delay (`base * 2^attempt`, capped) with jitter over the upper
//! half of the window, so a crowd of clients dropped at once does not
//! reconnect in lockstep.

use std::time::Duration;

use rand::Rng;

/// Cap on the doubling exponent; the ceiling usually binds long before this
const MAX_EXPONENT: u32 = 16;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Failed attempts since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Upper bound of the next delay
    pub fn ceiling(&self) -> Duration {
        let factor = 1u32 << self.attempt.min(MAX_EXPONENT);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay before the next attempt, using the thread-local RNG
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    /// Delay before the next attempt: uniform in `[ceiling / 2, ceiling]`
    pub fn next_delay_with<R: Rng>(&mut self, rng: &mut R) -> Duration {
        let ceiling = self.ceiling();
        let half = ceiling / 2;
        let jitter_ms = rng.gen_range(0..=(ceiling - half).as_millis() as u64);

        self.attempt = self.attempt.saturating_add(1);
        half + Duration::from_millis(jitter_ms)
    }

    /// Start over after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
