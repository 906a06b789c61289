//! Integration Tests
//!
//! Drive the enforcer through its public API with real key material from
//! `tests/fixtures`, an in-memory control plane and a mocked JWKS endpoint.

mod common;
mod concurrent_lookups;
mod decision_flow;
mod discovery_resume;
mod jwks_fetch;
