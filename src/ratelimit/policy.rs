//! Exponential backoff policy.

use std::time::Duration;

use crate::error::{KeygateError, Result};

/// Minimum spacing armed after an admitted request.
pub const BASE_WAIT_TIME_MS: u64 = 500;
/// Upper bound on any single penalty.
pub const MAX_WAIT_TIME_MS: u64 = 30_000;
/// Slack subtracted from the remaining wait before it is reported.
pub const GRACE_PERIOD_MS: u64 = 3_000;

/// Timing parameters of the adaptive limiter, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_wait: u64,
    pub max_wait: u64,
    pub grace_period: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_wait: BASE_WAIT_TIME_MS,
            max_wait: MAX_WAIT_TIME_MS,
            grace_period: GRACE_PERIOD_MS,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy, rejecting parameters the limiter cannot honour.
    pub fn new(base_wait: u64, max_wait: u64, grace_period: u64) -> Result<Self> {
        let policy = Self {
            base_wait,
            max_wait,
            grace_period,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_wait == 0 {
            return Err(KeygateError::Config("base wait must be positive".into()));
        }
        if self.max_wait < self.base_wait {
            return Err(KeygateError::Config(format!(
                "max wait ({}ms) is below base wait ({}ms)",
                self.max_wait, self.base_wait
            )));
        }
        Ok(())
    }

    /// Penalty for the given number of consecutive hits.
    ///
    /// `base * 2^(hits - 1)`, capped at `max_wait`. Zero hits yields `base`.
    pub fn penalty_for(&self, consecutive_hits: u32) -> u64 {
        let exponent = consecutive_hits.saturating_sub(1).min(63);
        self.base_wait
            .saturating_mul(1u64 << exponent)
            .min(self.max_wait)
    }

    /// The wait reported to a caller arriving at `now`.
    ///
    /// Zero when open. While penalized, the remaining time minus the grace
    /// period, so this can be zero even though `now < next_allowed_time`.
    pub fn reported_wait(&self, next_allowed_time: u64, now: u64) -> u64 {
        if now >= next_allowed_time {
            return 0;
        }
        (next_allowed_time - now).saturating_sub(self.grace_period)
    }

    pub fn base_wait_duration(&self) -> Duration {
        Duration::from_millis(self.base_wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_constants() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_wait, 500);
        assert_eq!(policy.max_wait, 30_000);
        assert_eq!(policy.grace_period, 3_000);
        assert_eq!(policy.base_wait_duration(), Duration::from_millis(500));
    }

    #[test]
    fn test_penalty_doubles() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.penalty_for(0), 500);
        assert_eq!(policy.penalty_for(1), 500);
        assert_eq!(policy.penalty_for(2), 1_000);
        assert_eq!(policy.penalty_for(3), 2_000);
        assert_eq!(policy.penalty_for(6), 16_000);
    }

    #[test]
    fn test_penalty_caps_at_max() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.penalty_for(7), 30_000);
        assert_eq!(policy.penalty_for(64), 30_000);
        assert_eq!(policy.penalty_for(u32::MAX), 30_000);
    }

    #[test]
    fn test_reported_wait_subtracts_grace() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.reported_wait(0, 0), 0);
        assert_eq!(policy.reported_wait(500, 100), 0);
        assert_eq!(policy.reported_wait(10_000, 1_000), 6_000);
        assert_eq!(policy.reported_wait(4_001, 1_000), 1);
        assert_eq!(policy.reported_wait(4_000, 1_000), 0);
    }

    #[test]
    fn test_validation() {
        assert!(BackoffPolicy::new(500, 30_000, 3_000).is_ok());
        assert!(BackoffPolicy::new(500, 500, 0).is_ok());
        assert!(matches!(
            BackoffPolicy::new(0, 30_000, 3_000),
            Err(KeygateError::Config(_))
        ));
        assert!(matches!(
            BackoffPolicy::new(1_000, 500, 3_000),
            Err(KeygateError::Config(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_penalty_never_exceeds_max(hits in any::<u32>()) {
            let policy = BackoffPolicy::default();
            prop_assert!(policy.penalty_for(hits) <= MAX_WAIT_TIME_MS);
            prop_assert!(policy.penalty_for(hits) >= BASE_WAIT_TIME_MS);
        }

        #[test]
        fn prop_penalty_is_monotonic(hits in 0u32..1_000) {
            let policy = BackoffPolicy::default();
            prop_assert!(policy.penalty_for(hits) <= policy.penalty_for(hits + 1));
        }

        #[test]
        fn prop_reported_wait_below_raw_remaining(next in any::<u64>(), now in any::<u64>()) {
            let policy = BackoffPolicy::default();
            let reported = policy.reported_wait(next, now);
            prop_assert!(reported <= next.saturating_sub(now));
        }
    }
}
