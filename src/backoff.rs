use rand::Rng;
use std::time::Duration;

/// Exponential delay with proportional jitter, tracking its own attempt count.
///
/// Used by observers that reconnect to the store; session operations never retry.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base_ms: u64,
    max_ms: u64,
    jitter_percent: u64,
    attempt: u32,
}

impl ReconnectBackoff {
    pub const fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter_percent: 10,
            attempt: 0,
        }
    }

    pub fn with_jitter(mut self, jitter_percent: u64) -> Self {
        self.jitter_percent = jitter_percent;
        self
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for the current attempt, then advance.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Call after a successful reconnect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn delay(&self, attempt: u32) -> Duration {
        let exponential_delay = self
            .base_ms
            .saturating_mul(2u64.saturating_pow(attempt.min(20)));
        let capped_delay = exponential_delay.min(self.max_ms);
        let jitter = if self.jitter_percent > 0 {
            rand::thread_rng().gen_range(0..capped_delay * self.jitter_percent / 100 + 1)
        } else {
            0
        };
        Duration::from_millis(capped_delay + jitter)
    }
}
