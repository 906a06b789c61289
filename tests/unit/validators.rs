//! Validator Unit Tests
//!
//! Validators are exercised directly against the fixture trust store.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use gateway_enforcer::auth::validators::{ApiKeyValidator, BasicValidator, MtlsValidator};
use gateway_enforcer::auth::{AuthRequest, Resolution, RevokedTokens, ValidatorKind};
use gateway_enforcer::keystore::{Keystore, TrustStore, TrustedCertificate};
use gateway_enforcer::subscription::model::ClientCertificate;
use gateway_enforcer::subscription::{Api, KeyType};
use gateway_enforcer::{EnforcerError, ErrorCode};

use crate::fixture;

fn keystore() -> Arc<Keystore> {
    Arc::new(Keystore::from_parts(
        TrustStore::load_dir(&fixture("truststore")).unwrap(),
        None,
    ))
}

fn api(client_certificates: Vec<ClientCertificate>) -> Arc<Api> {
    Arc::new(Api {
        id: 1,
        uuid: "pets-api".to_string(),
        provider: "admin".to_string(),
        name: "PetStore".to_string(),
        version: "1.0".to_string(),
        context: "/pets/1.0".to_string(),
        tenant_domain: "carbon.super".to_string(),
        policy: None,
        lifecycle_state: "PUBLISHED".to_string(),
        api_type: "HTTP".to_string(),
        url_mappings: vec![],
        client_certificates,
    })
}

fn request() -> AuthRequest {
    AuthRequest::new("carbon.super", api(vec![]), None)
}

fn signed(claims: Value) -> String {
    let key = EncodingKey::from_rsa_pem(include_bytes!("../fixtures/issuer.key")).unwrap();
    encode(&Header::new(Algorithm::RS256), &claims, &key).unwrap()
}

fn api_key(extra: Value) -> String {
    let now = Utc::now().timestamp();
    let mut claims = json!({
        "iss": "https://apim.gateway.test",
        "sub": "alice@carbon.super",
        "application": {"uuid": "pets-app", "tier": "Unlimited"},
        "keytype": "SANDBOX",
        "iat": now,
        "exp": now + 600,
        "jti": "key-1",
    });
    if let (Value::Object(base), Value::Object(extra)) = (&mut claims, extra) {
        base.extend(extra);
    }
    signed(claims)
}

fn api_key_validator(revoked: Arc<RevokedTokens>) -> ApiKeyValidator {
    ApiKeyValidator::new(
        keystore(),
        revoked,
        "apikey".to_string(),
        "apikey".to_string(),
        "apikey".to_string(),
    )
}

#[test]
fn test_api_key_resolves_application() {
    let validator = api_key_validator(Arc::new(RevokedTokens::new()));
    let request = request().with_header("apikey", api_key(json!({})));

    assert!(validator.can_handle(&request));
    let credential = validator.validate(&request).unwrap();
    assert_eq!(credential.kind, ValidatorKind::ApiKey);
    assert_eq!(credential.subject, "alice@carbon.super");
    assert_eq!(
        credential.resolution,
        Resolution::Application {
            uuid: "pets-app".to_string(),
            key_type: KeyType::Sandbox,
        }
    );
    assert_eq!(credential.token_id.as_deref(), Some("key-1"));
}

#[test]
fn test_api_key_from_query_parameter() {
    let validator = api_key_validator(Arc::new(RevokedTokens::new()));
    let request = request().with_query("apikey", api_key(json!({})));
    assert!(validator.validate(&request).is_ok());
}

#[test]
fn test_api_key_permitted_ip() {
    let validator = api_key_validator(Arc::new(RevokedTokens::new()));
    let key = api_key(json!({"permittedIP": "192.0.2.10"}));

    let allowed = request().with_header("apikey", key.clone()).with_client_ip("192.0.2.10".parse().unwrap());
    assert!(validator.validate(&allowed).is_ok());

    let other = request().with_header("apikey", key).with_client_ip("198.51.100.1".parse().unwrap());
    let err = validator.validate(&other).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ResourceForbidden);
}

#[test]
fn test_revoked_api_key() {
    let revoked = Arc::new(RevokedTokens::new());
    let now = Utc::now().timestamp();
    revoked.replace([("key-1".to_string(), now + 600)], now);

    let validator = api_key_validator(revoked);
    let err = validator
        .validate(&request().with_header("apikey", api_key(json!({}))))
        .unwrap_err();
    assert!(matches!(err, EnforcerError::InvalidCredentials { .. }));
}

#[test]
fn test_opaque_api_key_is_not_handled() {
    let validator = api_key_validator(Arc::new(RevokedTokens::new()));
    assert!(!validator.can_handle(&request().with_header("apikey", "3f2a9c")));
}

fn basic(user: &str, password: &str) -> AuthRequest {
    let encoded = STANDARD.encode(format!("{user}:{password}"));
    request().with_header("Authorization", format!("Basic {encoded}"))
}

#[test]
fn test_basic_credentials() {
    let digest: String = Sha256::digest(b"s3cret").iter().map(|b| format!("{b:02x}")).collect();
    let validator = BasicValidator::new(HashMap::from([("admin".to_string(), digest)]));

    let credential = validator.validate(&basic("admin", "s3cret")).unwrap();
    assert_eq!(credential.subject, "admin");
    assert!(matches!(credential.resolution, Resolution::Static { .. }));

    assert!(validator.validate(&basic("admin", "guess")).is_err());
    assert!(validator.validate(&basic("root", "s3cret")).is_err());
    assert!(!validator.can_handle(&request().with_header("Authorization", "Bearer abc")));
}

fn client_der(name: &str) -> Vec<u8> {
    let pem = std::fs::read(fixture(name)).unwrap();
    TrustedCertificate::from_pem("presented", &pem).unwrap().der
}

#[test]
fn test_mtls_requires_allowed_alias() {
    let validator = MtlsValidator::new(keystore(), "x-client-certificate".to_string());
    let allowed = vec![ClientCertificate {
        alias: "client".to_string(),
        tier: "Gold".to_string(),
    }];

    let allowed_request = AuthRequest::new("carbon.super", api(allowed), None).with_peer_certificate(client_der("client.pem"));
    let credential = validator.validate(&allowed_request).unwrap();
    assert_eq!(credential.kind, ValidatorKind::Mtls);
    assert_eq!(credential.resolution, Resolution::Static { tier: "Gold".to_string() });
    assert!(credential.subject.contains("client.gateway.test"));

    // Trusted, but not listed for this API.
    let unlisted = request().with_peer_certificate(client_der("client.pem"));
    assert!(validator.validate(&unlisted).is_err());
}

#[test]
fn test_mtls_rejects_untrusted_and_forwarded_forms() {
    let validator = MtlsValidator::new(keystore(), "x-client-certificate".to_string());
    let stranger = request().with_peer_certificate(client_der("stranger.pem"));
    assert!(matches!(
        validator.validate(&stranger),
        Err(EnforcerError::InvalidCredentials { .. })
    ));

    let allowed = vec![ClientCertificate {
        alias: "client".to_string(),
        tier: "Gold".to_string(),
    }];
    let pem = std::fs::read_to_string(fixture("client.pem")).unwrap();
    let forwarded = AuthRequest::new("carbon.super", api(allowed), None)
        .with_header("x-client-certificate", STANDARD.encode(pem));
    assert!(validator.can_handle(&forwarded));
    assert!(validator.validate(&forwarded).is_ok());
}
