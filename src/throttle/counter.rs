//! Fixed-window counters.
//!
//! Counters live in a concurrent map; each counter has its own lock, so
//! requests on different keys never contend. Time is passed in as epoch
//! milliseconds so peer events, which carry wall-clock timestamps, fold into
//! the same windows.

use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

/// Smallest retry-after handed to clients.
const MIN_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Quota a counter is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterLimit {
    /// Requests or bytes per window
    pub limit: u64,
    pub window: Duration,
    /// Deny everything until the window ends once the quota is exceeded
    pub stop_on_quota_reach: bool,
}

impl CounterLimit {
    fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX).max(1)
    }
}

/// Outcome of one counter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterDecision {
    Allowed { remaining: u64 },
    Denied { retry_after: Duration },
}

/// A counted request, kept so a later denial can hand the count back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub remaining: u64,
    pub amount: u64,
    window_start_ms: i64,
}

#[derive(Debug)]
struct CounterState {
    window_start_ms: i64,
    /// Window length, known once a local check has run
    window_ms: Option<i64>,
    count: u64,
    blocked_until_ms: Option<i64>,
    last_seen_ms: i64,
}

impl CounterState {
    fn new(now_ms: i64) -> Self {
        Self {
            window_start_ms: now_ms,
            window_ms: None,
            count: 0,
            blocked_until_ms: None,
            last_seen_ms: now_ms,
        }
    }

    /// Start a new window at `at_ms` if the current one has ended.
    fn roll(&mut self, at_ms: i64, window_ms: i64) {
        if at_ms >= self.window_start_ms.saturating_add(window_ms) {
            self.window_start_ms = at_ms;
            self.count = 0;
        }
    }
}

/// All counters of one engine.
///
/// Counters are updated while their map shard is read-locked, so pruning
/// (which write-locks the shard) never drops a counter mid-update.
#[derive(Debug, Default)]
pub struct CounterTable {
    counters: DashMap<String, Mutex<CounterState>>,
}

impl CounterTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_counter<R>(&self, key: &str, now_ms: i64, update: impl FnOnce(&mut CounterState) -> R) -> R {
        if let Some(counter) = self.counters.get(key) {
            let mut state = counter.lock();
            return update(&mut state);
        }
        let counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(CounterState::new(now_ms)))
            .downgrade();
        let mut state = counter.lock();
        update(&mut state)
    }

    /// Count `amount` against `key` unless that would exceed the quota.
    ///
    /// A denied request is not counted. With stop-on-quota-reach the key stays
    /// denied until its window ends.
    pub fn check_and_increment(&self, key: &str, limit: CounterLimit, amount: u64, now_ms: i64) -> CounterDecision {
        match self.acquire(key, limit, amount, now_ms) {
            Ok(admission) => CounterDecision::Allowed {
                remaining: admission.remaining,
            },
            Err(retry_after) => CounterDecision::Denied { retry_after },
        }
    }

    /// Like [`Self::check_and_increment`], returning the admission so it can be released.
    pub fn acquire(&self, key: &str, limit: CounterLimit, amount: u64, now_ms: i64) -> Result<Admission, Duration> {
        self.with_counter(key, now_ms, |state| {
            state.last_seen_ms = now_ms;

            if let Some(until) = state.blocked_until_ms {
                if until > now_ms {
                    return Err(retry_after(until, now_ms));
                }
                state.blocked_until_ms = None;
            }

            let window_ms = limit.window_ms();
            state.window_ms = Some(window_ms);
            state.roll(now_ms, window_ms);
            let window_end = state.window_start_ms.saturating_add(window_ms);

            let next = state.count.saturating_add(amount);
            if next > limit.limit {
                if limit.stop_on_quota_reach {
                    state.blocked_until_ms = Some(window_end);
                }
                return Err(retry_after(window_end, now_ms));
            }

            state.count = next;
            Ok(Admission {
                remaining: limit.limit - next,
                amount,
                window_start_ms: state.window_start_ms,
            })
        })
    }

    /// Hand back an admission. Ignored once the window it was counted in has ended.
    pub fn release(&self, key: &str, admission: Admission) {
        if let Some(counter) = self.counters.get(key) {
            let mut state = counter.lock();
            if state.window_start_ms == admission.window_start_ms {
                state.count = state.count.saturating_sub(admission.amount);
            }
        }
    }

    /// Fold a peer's count into `key`.
    ///
    /// A delta stamped after the current window ended opens the next window;
    /// deltas counted before the current window started are dropped.
    pub fn add_peer_delta(&self, key: &str, delta: u64, timestamp_ms: i64) {
        self.with_counter(key, timestamp_ms, |state| {
            if timestamp_ms < state.window_start_ms {
                return;
            }
            if let Some(window_ms) = state.window_ms {
                state.roll(timestamp_ms, window_ms);
            }
            state.count = state.count.saturating_add(delta);
            state.last_seen_ms = state.last_seen_ms.max(timestamp_ms);
        });
    }

    /// Current count of `key`, for diagnostics.
    pub fn count(&self, key: &str) -> Option<u64> {
        self.counters.get(key).map(|counter| counter.lock().count)
    }

    /// Drop counters untouched for `idle`. Returns how many were removed.
    pub fn prune_idle(&self, idle: Duration, now_ms: i64) -> usize {
        let idle_ms = i64::try_from(idle.as_millis()).unwrap_or(i64::MAX);
        let before = self.counters.len();
        self.counters.retain(|_, counter| {
            let state = counter.lock();
            let blocked = state.blocked_until_ms.is_some_and(|until| until > now_ms);
            blocked || now_ms.saturating_sub(state.last_seen_ms) < idle_ms
        });
        before.saturating_sub(self.counters.len())
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// Time until `until_ms`, rounded up to whole seconds and at least one.
pub(crate) fn retry_after(until_ms: i64, now_ms: i64) -> Duration {
    let remaining_ms = u64::try_from(until_ms.saturating_sub(now_ms)).unwrap_or(0);
    Duration::from_secs(remaining_ms.div_ceil(1000)).max(MIN_RETRY_AFTER)
}
