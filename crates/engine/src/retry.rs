//! Backoff schedule for mutations that failed on a retryable error.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with an upper bound and optional jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Base delay for exponential backoff (milliseconds).
    pub base_backoff_ms: u64,
    /// Maximum backoff delay (milliseconds).
    pub max_backoff_ms: u64,
    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    pub jitter_enabled: bool,
    /// Consecutive failures after which a mutation is parked as stuck.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            jitter_enabled: true,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_base_backoff_ms(mut self, ms: u64) -> Self {
        self.base_backoff_ms = ms;
        self
    }

    #[must_use]
    pub const fn with_max_backoff_ms(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    #[must_use]
    pub const fn with_jitter_enabled(mut self, enabled: bool) -> Self {
        self.jitter_enabled = enabled;
        self
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Un-jittered delay after `failures` consecutive failures (1-based).
    pub fn compute_backoff_ms(&self, failures: u32) -> u64 {
        let exp = failures.saturating_sub(1).min(30);
        self.base_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms)
    }

    /// `factor` is clamped to `[0, 1]` and mapped onto `[0.5, 1.0]` of the base delay.
    pub fn compute_backoff_with_jitter_ms(&self, failures: u32, factor: f64) -> u64 {
        let base = self.compute_backoff_ms(failures);
        if !self.jitter_enabled {
            return base;
        }
        let scale = factor.clamp(0.0, 1.0).mul_add(0.5, 0.5);
        (base as f64 * scale) as u64
    }

    /// Delay before the next attempt, or `None` once the mutation should be
    /// left for the user instead of retried.
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        if failures >= self.max_attempts {
            return None;
        }
        let factor = if self.jitter_enabled {
            rand::thread_rng().gen_range(0.0..=1.0)
        } else {
            1.0
        };
        Some(Duration::from_millis(
            self.compute_backoff_with_jitter_ms(failures, factor),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = RetryPolicy::new().with_max_backoff_ms(5_000);
        assert_eq!(policy.compute_backoff_ms(1), 1_000);
        assert_eq!(policy.compute_backoff_ms(2), 2_000);
        assert_eq!(policy.compute_backoff_ms(3), 4_000);
        assert_eq!(policy.compute_backoff_ms(4), 5_000);
        assert_eq!(policy.compute_backoff_ms(64), 5_000);
    }

    #[test]
    fn jitter_stays_within_half_to_full() {
        let policy = RetryPolicy::new();
        assert_eq!(policy.compute_backoff_with_jitter_ms(2, 0.0), 1_000);
        assert_eq!(policy.compute_backoff_with_jitter_ms(2, 1.0), 2_000);
        for _ in 0..50 {
            let delay = policy.next_delay(2).unwrap();
            assert!(delay >= Duration::from_millis(1_000) && delay <= Duration::from_millis(2_000));
        }
    }

    #[test]
    fn no_delay_once_attempts_exhausted() {
        let policy = RetryPolicy::new().with_jitter_enabled(false);
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(1_000)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(2_000)));
        assert_eq!(policy.next_delay(3), None);
    }
}
