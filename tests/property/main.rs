//! Property-Based Tests
//!
//! Uses proptest for invariant verification.
//! Each test runs minimum 100 iterations.
//!
//! Test categories:
//! - backoff: reconnect delays grow and stay capped
//! - counters: quotas are never exceeded and retry hints stay sane
//! - snapshots: full-state replacement is idempotent

mod backoff;
mod counters;
mod snapshots;
