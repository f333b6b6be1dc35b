//! Retry backoff — attempts → delay in minutes.
//! Exponential with a capped exponent so the longest wait stays bounded
//! (64× base, 16 hours at the default base).

/// Default base delay.
pub const DEFAULT_BASE_MINUTES: u64 = 15;

/// Highest exponent applied to the base.
pub const MAX_EXPONENT: u32 = 6;

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_minutes: u64,
}

impl BackoffPolicy {
    pub fn new(base_minutes: u64) -> Self {
        Self { base_minutes }
    }

    /// `base * 2^min(attempts, 6)`, saturating.
    pub fn delay_minutes(&self, attempts: u32) -> u64 {
        self.base_minutes
            .saturating_mul(1u64 << attempts.min(MAX_EXPONENT))
    }

    /// Upper bound of [`delay_minutes`](Self::delay_minutes).
    pub fn max_delay_minutes(&self) -> u64 {
        self.delay_minutes(MAX_EXPONENT)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_MINUTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sequence() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (0..8).map(|a| policy.delay_minutes(a)).collect();
        assert_eq!(delays, vec![15, 30, 60, 120, 240, 480, 960, 960]);
    }

    #[test]
    fn test_monotonic_and_capped() {
        for base in [1, 5, 15, 60] {
            let policy = BackoffPolicy::new(base);
            let mut prev = 0;
            for attempts in 0..100 {
                let d = policy.delay_minutes(attempts);
                assert!(d >= prev, "non-decreasing at attempts={attempts}");
                assert!(d <= base * 64);
                prev = d;
            }
            assert_eq!(policy.max_delay_minutes(), base * 64);
        }
    }

    #[test]
    fn test_extreme_inputs_do_not_overflow() {
        let policy = BackoffPolicy::new(u64::MAX / 2);
        assert_eq!(policy.delay_minutes(u32::MAX), u64::MAX);
        assert_eq!(BackoffPolicy::new(0).delay_minutes(5), 0);
    }
}
