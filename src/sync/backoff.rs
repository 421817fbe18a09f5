//! Exponential backoff for failed sync cycles.

use rand::Rng;
use std::time::Duration;

/// Doubles a base delay per consecutive failure up to a cap, with ±20%
/// jitter so a fleet of devices does not retry in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn from_secs(base_secs: u64, cap_secs: u64) -> Self {
        Self::new(Duration::from_secs(base_secs), Duration::from_secs(cap_secs))
    }

    /// Delay before the next attempt, given how many consecutive failures
    /// have occurred (1 = first failure).
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 || self.base.is_zero() {
            return Duration::ZERO;
        }
        let exp = failures.saturating_sub(1).min(16);
        let raw = self.base.saturating_mul(1u32 << exp);
        let capped = raw.min(self.cap);

        let jitter = rand::rng().random_range(0.8..1.2);
        capped.mul_f64(jitter).min(self.cap)
    }
}
