//! Claim Unit Tests

use std::collections::HashMap;

use serde_json::json;

use gateway_enforcer::auth::claims::{ClaimSet, ClaimValue};

fn claims(value: serde_json::Value) -> ClaimSet {
    match value {
        serde_json::Value::Object(map) => ClaimSet::from_json_object(map),
        _ => unreachable!("claims are objects"),
    }
}

#[test]
fn test_audience_accepts_string_or_list() {
    assert_eq!(claims(json!({"aud": "pets"})).audience(), vec!["pets".to_string()]);
    assert_eq!(
        claims(json!({"aud": ["pets", "cats"]})).audience(),
        vec!["pets".to_string(), "cats".to_string()]
    );
    assert!(claims(json!({})).audience().is_empty());
}

#[test]
fn test_nested_objects_survive_conversion() {
    let set = claims(json!({"application": {"uuid": "app-1", "tier": "Gold"}}));
    let app = set.get("application").and_then(ClaimValue::as_object).expect("object claim");
    assert_eq!(app.get("uuid").and_then(ClaimValue::as_str), Some("app-1"));
}

#[test]
fn test_integer_claims_read_as_i64() {
    let set = claims(json!({"exp": 1_900_000_000, "ratio": 0.25}));
    assert_eq!(set.get_i64("exp"), Some(1_900_000_000));
    assert_eq!(set.get("ratio"), Some(&ClaimValue::Float(0.25)));
}

#[test]
fn test_remap_overrides_local_name() {
    let set = claims(json!({"client_id": "remote-key", "azp": "stale"}));
    let mappings = HashMap::from([("client_id".to_string(), "azp".to_string())]);

    let remapped = set.remap(&mappings);
    assert_eq!(remapped.get_str("azp"), Some("remote-key"));
    assert!(!remapped.contains("client_id"));
}

#[test]
fn test_to_json_is_lossless_for_lists() {
    let value = ClaimValue::from(vec!["read".to_string(), "write".to_string()]);
    assert_eq!(value.to_json(), json!(["read", "write"]));
    assert_eq!(value.to_string_list(), vec!["read".to_string(), "write".to_string()]);
}
