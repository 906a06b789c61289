//! Counter Property Tests

use std::time::Duration;

use proptest::prelude::*;

use gateway_enforcer::decision::retry_after_secs;
use gateway_enforcer::throttle::{CounterDecision, CounterLimit, CounterTable};

const T0: i64 = 1_700_000_000_000;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: the counted total never exceeds the quota, however requests arrive
    #[test]
    fn prop_counter_never_exceeds_limit(
        limit in 1u64..200,
        window_secs in 1u64..120,
        stop in proptest::bool::ANY,
        requests in proptest::collection::vec((1u64..20, 0i64..3_000), 1..300),
    ) {
        let table = CounterTable::new();
        let limit = CounterLimit { limit, window: Duration::from_secs(window_secs), stop_on_quota_reach: stop };
        let mut now = T0;

        for (amount, step_ms) in requests {
            now += step_ms;
            match table.check_and_increment("key", limit, amount, now) {
                CounterDecision::Allowed { remaining } => {
                    prop_assert_eq!(remaining + table.count("key").unwrap_or(0), limit.limit);
                }
                CounterDecision::Denied { retry_after } => {
                    prop_assert!(retry_after >= Duration::from_secs(1));
                    prop_assert!(retry_after <= Duration::from_secs(window_secs));
                }
            }
            prop_assert!(table.count("key").unwrap_or(0) <= limit.limit);
        }
    }

    /// Property: retry-after seconds round up and are never zero
    #[test]
    fn prop_retry_after_rounds_up(millis in 0u64..600_000) {
        let duration = Duration::from_millis(millis);
        let secs = retry_after_secs(duration);

        prop_assert!(secs >= 1);
        prop_assert!(Duration::from_secs(secs) >= duration);
        prop_assert!(Duration::from_secs(secs) < duration + Duration::from_secs(1) || millis == 0);
    }
}
