//! Exponential backoff with jitter for outbox delivery retries.

use std::time::Duration;

use rand::Rng;

/// Retry pacing for one drain worker run.
///
/// The delay doubles per failure up to a cap; the attempt budget itself is
/// tracked per outbox entry in the store, so a restart never resets it.
#[derive(Debug, Clone)]
pub struct RetryState {
    initial: Duration,
    current: Duration,
    max: Duration,
}

impl RetryState {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            current: initial,
            max,
        }
    }

    /// Delay to sleep before the next attempt, with up to 50% random
    /// jitter on top of the doubling base.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        with_jitter(base)
    }

    /// Back to the initial delay after a successful delivery.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

fn with_jitter(base: Duration) -> Duration {
    let half = base.as_millis() as u64 / 2;
    let extra = rand::thread_rng().gen_range(0..=half);
    base + Duration::from_millis(extra)
}
