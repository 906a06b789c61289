//! Backoff Property Tests

use std::time::Duration;

use proptest::prelude::*;

use gateway_enforcer::discovery::BackoffPolicy;

fn policy(initial_ms: u64, max_ms: u64, multiplier: f64, jitter: bool) -> BackoffPolicy {
    BackoffPolicy {
        initial_delay: Duration::from_millis(initial_ms),
        max_delay: Duration::from_millis(max_ms),
        multiplier,
        jitter,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: without jitter, delays never shrink and never pass the cap
    #[test]
    fn prop_delays_monotone_and_capped(
        initial_ms in 1u64..2_000,
        extra_ms in 0u64..60_000,
        multiplier in 1.0f64..4.0,
        attempt in 0u32..64,
    ) {
        let max_ms = initial_ms + extra_ms;
        let policy = policy(initial_ms, max_ms, multiplier, false);

        let current = policy.delay_for_attempt(attempt);
        let next = policy.delay_for_attempt(attempt + 1);
        prop_assert!(current <= next);
        prop_assert!(next <= Duration::from_millis(max_ms));
        prop_assert!(policy.delay_for_attempt(0) <= Duration::from_millis(initial_ms));
    }

    /// Property: jitter only stretches a delay, and never past the ceiling
    #[test]
    fn prop_jitter_bounded(
        initial_ms in 1u64..2_000,
        extra_ms in 0u64..60_000,
        attempt in 0u32..32,
    ) {
        let max_ms = initial_ms + extra_ms;
        let base = policy(initial_ms, max_ms, 2.0, false).delay_for_attempt(attempt);
        let jittered = policy(initial_ms, max_ms, 2.0, true).delay_for_attempt(attempt);

        prop_assert!(jittered >= base);
        prop_assert!(jittered <= Duration::from_millis(max_ms));
        prop_assert!(jittered.as_millis() <= base.as_millis() * 5 / 4 + 2);
    }
}
