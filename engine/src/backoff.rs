//! Exponential backoff with jitter for mutation retries.

use crate::clock::millis;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry delay policy.
///
/// The delay before attempt `n + 1` is `base * factor^(n - 1)`, capped at
/// `cap`, then perturbed by up to `±jitter` of itself. The result never drops
/// below `base` and never exceeds `cap`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
    /// Fraction in `[0, 1)`
    pub jitter: f64,
    /// Delivery attempts before a mutation is given up on
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(60),
            jitter: 0.2,
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after `attempt` failed attempts (1-based).
    pub fn delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let nominal = self.nominal(attempt);
        let spread = self.jitter.clamp(0.0, 0.99);
        let scale = if spread > 0.0 {
            rng.gen_range(1.0 - spread..=1.0 + spread)
        } else {
            1.0
        };
        let jittered = Duration::from_secs_f64(nominal.as_secs_f64() * scale);
        jittered.clamp(self.base, self.cap.max(self.base))
    }

    /// Delay in milliseconds, for timestamp arithmetic.
    pub fn delay_millis(&self, attempt: u32, rng: &mut impl Rng) -> u64 {
        millis(self.delay(attempt, rng))
    }

    /// Delay before jitter.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let multiplier = self.factor.max(1).saturating_pow(exponent);
        self.base
            .checked_mul(multiplier)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// Whether a mutation with `attempts` failed attempts may be retried.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn nominal_doubles_until_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.nominal(1), Duration::from_secs(1));
        assert_eq!(policy.nominal(2), Duration::from_secs(2));
        assert_eq!(policy.nominal(3), Duration::from_secs(4));
        assert_eq!(policy.nominal(7), Duration::from_secs(60));
        assert_eq!(policy.nominal(1_000), Duration::from_secs(60));
    }

    #[test]
    fn no_jitter_is_exact() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(policy.delay(3, &mut rng), Duration::from_secs(4));
    }

    #[test]
    fn retries_stop_at_max_attempts() {
        let policy = BackoffPolicy::default();
        assert!(policy.allows_retry(4));
        assert!(!policy.allows_retry(5));
    }

    proptest! {
        #[test]
        fn delay_stays_within_bounds(attempt in 0u32..64, seed in any::<u64>()) {
            let policy = BackoffPolicy::default();
            let mut rng = StdRng::seed_from_u64(seed);
            let delay = policy.delay(attempt, &mut rng);
            prop_assert!(delay >= policy.base);
            prop_assert!(delay <= policy.cap);

            let nominal = policy.nominal(attempt).as_secs_f64();
            let got = delay.as_secs_f64();
            prop_assert!(got <= nominal * 1.2 + 1e-6);
            prop_assert!(got >= (nominal * 0.8).max(1.0) - 1e-6);
        }
    }
}
