//! Configuration Unit Tests

use std::collections::HashMap;
use std::time::Duration;

use gateway_enforcer::auth::validators::ValidatorKind;
use gateway_enforcer::config::{Config, ConfigError};

fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
    let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    Config::from_lookup(&|name: &str| vars.get(name).cloned())
}

#[test]
fn test_defaults() {
    let config = load(&[]).unwrap();

    assert_eq!(config.listen_addr(), "0.0.0.0:8081");
    assert_eq!(config.request_deadline, Duration::from_secs(2));
    assert_eq!(config.auth.validators, ValidatorKind::ALL.to_vec());
    assert_eq!(config.auth.api_key_header, "apikey");
    assert_eq!(config.auth.default_tenant, "carbon.super");
    assert!(config.throttle.peer_sync_enabled);
    assert_eq!(config.discovery.stale_after, Duration::from_secs(300));

    let backend = &config.backend_jwt;
    assert!(!backend.enabled);
    assert_eq!(backend.header_name, "X-JWT-Assertion");
    assert_eq!(backend.algorithm, "RS256");
    assert_eq!(backend.expiry, Duration::from_secs(3600));
    assert_eq!(backend.cache_expiry, Duration::from_secs(900));
    assert_eq!(backend.claim_dialect, "http://wso2.org/claims");
    assert!(!backend.fail_on_signing_error);
}

#[test]
fn test_validator_list_parsing() {
    let config = load(&[("ENFORCER_VALIDATORS", "mtls, oauth2 ,api-key")]).unwrap();
    assert_eq!(
        config.auth.validators,
        vec![ValidatorKind::Mtls, ValidatorKind::Jwt, ValidatorKind::ApiKey]
    );

    assert!(matches!(
        load(&[("ENFORCER_VALIDATORS", "jwt,kerberos")]),
        Err(ConfigError::ParseError { .. })
    ));
    assert!(matches!(
        load(&[("ENFORCER_VALIDATORS", " , ")]),
        Err(ConfigError::MissingRequired(_))
    ));
}

#[test]
fn test_issuer_list_defaults() {
    let config = load(&[(
        "ENFORCER_JWT_ISSUERS",
        r#"[{"name": "Resident Key Manager", "issuer": "https://idp/token", "certificate_alias": "idp"}]"#,
    )])
    .unwrap();

    let issuer = &config.auth.issuers[0];
    assert_eq!(issuer.consumer_key_claim, "azp");
    assert_eq!(issuer.scopes_claim, "scope");
    assert!(issuer.jwks_url.is_none());

    assert!(load(&[("ENFORCER_JWT_ISSUERS", "not json")]).is_err());
}

#[test]
fn test_signed_backend_tokens_need_a_key() {
    assert!(matches!(
        load(&[("ENFORCER_BACKEND_JWT_ENABLED", "true")]),
        Err(ConfigError::MissingRequired(name)) if name == "ENFORCER_SIGNING_KEY"
    ));
    assert!(load(&[
        ("ENFORCER_BACKEND_JWT_ENABLED", "true"),
        ("ENFORCER_BACKEND_JWT_ALGORITHM", "NONE"),
    ])
    .is_ok());
}

#[test]
fn test_rejects_invalid_values() {
    assert!(matches!(load(&[("ENFORCER_PORT", "0")]), Err(ConfigError::InvalidPort)));
    assert!(matches!(
        load(&[("ENFORCER_REQUEST_DEADLINE_MS", "0")]),
        Err(ConfigError::InvalidDuration(_))
    ));
    assert!(matches!(
        load(&[("ENFORCER_XDS_URL", "not a url")]),
        Err(ConfigError::InvalidUrl { .. })
    ));
    assert!(matches!(
        load(&[("ENFORCER_XDS_BACKOFF_MULTIPLIER", "0.5")]),
        Err(ConfigError::ParseError { .. })
    ));
}

#[test]
fn test_basic_users_map() {
    let config = load(&[("ENFORCER_BASIC_USERS", "admin:abc123, ops:def456")]).unwrap();
    assert_eq!(config.auth.basic_users.get("admin").map(String::as_str), Some("abc123"));
    assert_eq!(config.auth.basic_users.len(), 2);
}
