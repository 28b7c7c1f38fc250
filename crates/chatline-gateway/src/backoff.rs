use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff shared by delivery jobs and broker consumers.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let pow = attempt.saturating_sub(1).min(16);
        let mult = self.factor.max(1).saturating_pow(pow);
        self.initial_delay
            .saturating_mul(mult)
            .min(self.max_delay)
            .max(self.initial_delay.min(self.max_delay))
    }

    /// Same as `delay` with up to 10% random jitter added.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let base = self.delay(attempt);
        let spread = base.as_millis() as u64 / 10;
        if spread == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=spread))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(40), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let d = policy.jittered(2);
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(220));
        }
    }
}
