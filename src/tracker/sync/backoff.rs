use std::time::Duration;

use tracing::{info, warn};

/// Exponential delay between failed sync cycles. Doubles per consecutive failure, never drops
/// below the base interval and never exceeds the cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn delay(&self) -> Duration {
        if self.failures == 0 {
            return self.base;
        }
        let factor = 1u32 << self.failures.min(16);
        self.base.saturating_mul(factor).min(self.max).max(self.base)
    }

    /// Counts a failure and returns the delay until the next attempt.
    pub fn register_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.delay();
        warn!(
            "Sync failed {} times in a row, retrying in {}s",
            self.failures,
            delay.as_secs()
        );
        delay
    }

    pub fn reset(&mut self) {
        if self.failures > 0 {
            info!("Sync recovered after {} failures", self.failures);
        }
        self.failures = 0;
    }
}
