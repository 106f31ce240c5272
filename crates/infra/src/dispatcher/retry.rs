//! Retry budget and backoff for one (event, handler) pair.
//!
//! Backoff is spread per pair: the offset is derived from the event id and the
//! handler name, so two pairs failing on the same store outage wake up at
//! different times while a single pair's schedule stays reproducible.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use jobsweep_core::EventId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay: Duration },
    /// `base * 2^(attempt - 1)`, capped.
    Exponential { base: Duration, cap: Duration },
}

/// `max_attempts` is the retry budget: the total number of times one handler
/// is offered one event, first attempt included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Fraction of the nominal delay a pair may deviate by, in `0.0..=1.0`.
    pub spread: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(200), Duration::from_secs(10))
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay },
            spread: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential { base, cap },
            spread: 0.1,
        }
    }

    /// Whether another attempt is allowed after `attempt` attempts were made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Nominal delay after failed attempt `attempt` (1-indexed), before spreading.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { base, cap } => {
                let shift = attempt.saturating_sub(1).min(31);
                base.checked_mul(1u32 << shift).unwrap_or(cap).min(cap)
            }
        }
    }

    /// Delay before the next attempt of the pair identified by `seed`.
    ///
    /// Never exceeds the nominal delay by more than `spread` and never exceeds
    /// the exponential cap.
    pub fn delay_for(&self, attempt: u32, seed: u64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let nominal = self.nominal_delay(attempt);
        let spread = self.spread.clamp(0.0, 1.0);
        if spread == 0.0 || nominal.is_zero() {
            return nominal;
        }

        // Offset in [-spread, +spread] of the nominal delay.
        let unit = (mix(seed ^ u64::from(attempt)) % 10_001) as f64 / 10_000.0;
        let factor = 1.0 + spread * (unit * 2.0 - 1.0);
        let spread_delay = nominal.mul_f64(factor);

        match self.backoff {
            Backoff::Exponential { cap, .. } => spread_delay.min(cap),
            Backoff::Fixed { .. } => spread_delay,
        }
    }
}

/// Stable per-pair seed for [`RetryPolicy::delay_for`].
pub fn pair_seed(event_id: EventId, handler: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    event_id.hash(&mut hasher);
    handler.hash(&mut hasher);
    hasher.finish()
}

// splitmix64 finalizer
fn mix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn exponential_backoff_doubles_up_to_the_cap() {
        let policy =
            RetryPolicy::exponential(6, Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(policy.nominal_delay(1), Duration::from_millis(100));
        assert_eq!(policy.nominal_delay(2), Duration::from_millis(200));
        assert_eq!(policy.nominal_delay(3), Duration::from_millis(400));
        assert_eq!(policy.nominal_delay(4), Duration::from_millis(500));
        assert_eq!(policy.nominal_delay(40), Duration::from_millis(500));
    }

    #[test]
    fn fixed_backoff_is_exact() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(50));
        assert_eq!(policy.delay_for(1, 7), Duration::from_millis(50));
        assert_eq!(policy.delay_for(3, 99), Duration::from_millis(50));
    }

    #[test]
    fn budget_counts_total_attempts() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn pairs_on_the_same_attempt_are_spread_apart() {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(1), Duration::from_secs(60));
        let event = EventId::new();

        let delays: HashSet<Duration> = (0..8)
            .map(|i| policy.delay_for(2, pair_seed(event, &format!("handler-{i}"))))
            .collect();
        assert!(delays.len() > 1, "every pair got the same delay: {delays:?}");

        let seed = pair_seed(event, "handler-0");
        assert_eq!(policy.delay_for(2, seed), policy.delay_for(2, seed));
    }

    #[test]
    fn spread_stays_within_bounds() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_secs(1));
        for seed in 0..64u64 {
            for attempt in 1..10 {
                let nominal = policy.nominal_delay(attempt);
                let delay = policy.delay_for(attempt, seed);
                assert!(delay <= Duration::from_secs(1));
                assert!(delay >= nominal.mul_f64(0.89));
                assert!(delay <= nominal.mul_f64(1.11));
            }
        }
    }
}
