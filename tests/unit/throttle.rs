//! Throttle Counter Unit Tests

use std::time::Duration;

use gateway_enforcer::throttle::{CounterDecision, CounterLimit, CounterTable, ThrottleKey, ThrottleLevel};

const T0: i64 = 1_700_000_000_000;

fn per_minute(limit: u64, stop: bool) -> CounterLimit {
    CounterLimit {
        limit,
        window: Duration::from_secs(60),
        stop_on_quota_reach: stop,
    }
}

#[test]
fn test_key_layouts() {
    assert_eq!(ThrottleKey::api("/pets", "1.0").key, "/pets:1.0");
    assert_eq!(
        ThrottleKey::resource("/pets", "1.0", "/cats/{id}", "get").key,
        "/pets/1.0/cats/{id}:GET"
    );
    assert_eq!(ThrottleKey::application(20, "alice").key, "20:alice");

    let subscription = ThrottleKey::subscription(20, "/pets", "1.0");
    assert_eq!(subscription.key, "20:/pets:1.0");
    assert_eq!(subscription.burst().key, "20:/pets:1.0:burst");
    assert_eq!(subscription.burst().level, ThrottleLevel::Subscription);
}

#[test]
fn test_window_resets() {
    let table = CounterTable::new();
    let limit = per_minute(2, false);

    assert!(matches!(table.check_and_increment("k", limit, 1, T0), CounterDecision::Allowed { remaining: 1 }));
    assert!(matches!(table.check_and_increment("k", limit, 1, T0 + 10), CounterDecision::Allowed { remaining: 0 }));
    match table.check_and_increment("k", limit, 1, T0 + 15_000) {
        CounterDecision::Denied { retry_after } => assert_eq!(retry_after, Duration::from_secs(45)),
        other => panic!("expected denial, got {other:?}"),
    }

    assert!(matches!(
        table.check_and_increment("k", limit, 1, T0 + 60_000),
        CounterDecision::Allowed { .. }
    ));
}

#[test]
fn test_retry_after_never_below_one_second() {
    let table = CounterTable::new();
    let limit = per_minute(1, false);
    table.check_and_increment("k", limit, 1, T0);

    match table.check_and_increment("k", limit, 1, T0 + 59_990) {
        CounterDecision::Denied { retry_after } => assert_eq!(retry_after, Duration::from_secs(1)),
        other => panic!("expected denial, got {other:?}"),
    }
}

#[test]
fn test_byte_quota_counts_amounts() {
    let table = CounterTable::new();
    let limit = per_minute(1_000, false);

    assert!(matches!(table.check_and_increment("bytes", limit, 600, T0), CounterDecision::Allowed { remaining: 400 }));
    assert!(matches!(table.check_and_increment("bytes", limit, 600, T0 + 1), CounterDecision::Denied { .. }));
    // The denied payload was not counted.
    assert_eq!(table.count("bytes"), Some(600));
}

#[test]
fn test_peer_deltas_share_the_window() {
    let table = CounterTable::new();
    let limit = per_minute(5, false);
    table.check_and_increment("shared", limit, 1, T0);

    table.add_peer_delta("shared", 4, T0 + 100);
    assert_eq!(table.count("shared"), Some(5));
    assert!(matches!(table.check_and_increment("shared", limit, 1, T0 + 200), CounterDecision::Denied { .. }));

    // Deltas from before the current window are stale.
    table.add_peer_delta("shared", 3, T0 - 120_000);
    assert_eq!(table.count("shared"), Some(5));

    // A delta counted after the window ended opens the next one.
    table.add_peer_delta("shared", 2, T0 + 61_000);
    assert_eq!(table.count("shared"), Some(2));
    assert!(matches!(
        table.check_and_increment("shared", limit, 1, T0 + 61_500),
        CounterDecision::Allowed { remaining: 2 }
    ));
}

#[test]
fn test_idle_counters_pruned() {
    let table = CounterTable::new();
    table.check_and_increment("old", per_minute(5, false), 1, T0);
    table.check_and_increment("fresh", per_minute(5, false), 1, T0 + 3_500_000);

    let pruned = table.prune_idle(Duration::from_secs(3600), T0 + 3_700_000);
    assert_eq!(pruned, 1);
    assert_eq!(table.len(), 1);
    assert!(table.count("old").is_none());
}
