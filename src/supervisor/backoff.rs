//! Exponential backoff between attempts

use std::time::Duration;

use crate::config::RetryPolicy;

/// Delay generator: `initial * multiplier^(n-1)` for the n-th consecutive failure, capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: u32,
    next: Duration,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            initial: policy.initial_backoff,
            max: policy.max_backoff,
            multiplier: policy.multiplier.max(1),
            next: policy.initial_backoff.min(policy.max_backoff),
        }
    }

    /// Delay to wait before the next attempt; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = delay
            .checked_mul(self.multiplier)
            .unwrap_or(self.max)
            .min(self.max);
        delay
    }

    /// Start over from the initial delay.
    pub fn reset(&mut self) {
        self.next = self.initial.min(self.max);
    }
}
