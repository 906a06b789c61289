//! Unit Tests
//!
//! Public API behavior per component, using the key material in
//! `tests/fixtures` where a component needs real certificates.
//!
//! Structure:
//! - claims: claim value conversion and remapping
//! - config: variable parsing, defaults and validation
//! - error: code table and client-facing messages
//! - keystore: trust store loading and certificate matching
//! - throttle: counter windows and key layouts
//! - validators: API key, Basic and mTLS validation

mod claims;
mod config;
mod error;
mod keystore;
mod throttle;
mod validators;

use std::path::PathBuf;

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}
