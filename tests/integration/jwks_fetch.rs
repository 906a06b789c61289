//! JWKS Integration Tests
//!
//! Key fetching against a mocked key-manager endpoint, and the request
//! deadline when that endpoint is slow.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::json;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gateway_enforcer::auth::JwksCache;
use gateway_enforcer::ErrorCode;

use crate::common::{self, seed, subscription};

fn jwks_body() -> serde_json::Value {
    let raw = std::fs::read_to_string(common::fixture("jwks.json")).unwrap();
    serde_json::from_str(&raw).unwrap()
}

fn jwks_issuer(server: &MockServer) -> String {
    json!([{
        "name": common::KEY_MANAGER,
        "issuer": common::ISSUER,
        "jwks_url": format!("{}/oauth2/jwks", server.uri()),
    }])
    .to_string()
}

fn token_with_kid(kid: &str) -> String {
    let now = Utc::now().timestamp();
    let claims = json!({
        "iss": common::ISSUER,
        "sub": "alice@carbon.super",
        "azp": common::CONSUMER_KEY,
        "iat": now,
        "exp": now + 300,
    });
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_rsa_pem(include_bytes!("../fixtures/issuer.key")).unwrap();
    encode(&header, &claims, &key).unwrap()
}

#[tokio::test]
async fn test_concurrent_misses_fetch_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/oauth2/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_body()))
        .expect(1)
        .mount(&server)
        .await;

    let url = Url::parse(&format!("{}/oauth2/jwks", server.uri())).unwrap();
    let cache = Arc::new(JwksCache::new(url, Duration::from_secs(3600), reqwest::Client::new()));

    let lookups: Vec<_> = (0..16)
        .map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_key(Some("issuer-1")).await })
        })
        .collect();
    for lookup in lookups {
        assert!(lookup.await.unwrap().is_ok());
    }
    assert_eq!(cache.key_count(), 1);
}

#[tokio::test]
async fn test_unknown_kid_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/oauth2/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_body()))
        .mount(&server)
        .await;

    let url = Url::parse(&format!("{}/oauth2/jwks", server.uri())).unwrap();
    let cache = JwksCache::new(url, Duration::from_secs(3600), reqwest::Client::new());

    assert!(cache.get_key(Some("rotated-away")).await.is_err());
}

#[tokio::test]
async fn test_token_verified_through_jwks() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/oauth2/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_body()))
        .mount(&server)
        .await;

    let issuers = jwks_issuer(&server);
    let service = common::service(&[("ENFORCER_JWT_ISSUERS", issuers.as_str())]);
    seed(&service.context().registry, vec![subscription()], 100);

    let decision = service
        .decide(common::request(Some(&token_with_kid("issuer-1"))))
        .await;
    assert!(decision.allowed, "denied: {}", decision.message);
}

#[tokio::test]
async fn test_slow_key_manager_fails_closed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/oauth2/jwks"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(jwks_body())
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let issuers = jwks_issuer(&server);
    let service = common::service(&[
        ("ENFORCER_JWT_ISSUERS", issuers.as_str()),
        ("ENFORCER_REQUEST_DEADLINE_MS", "200"),
    ]);
    seed(&service.context().registry, vec![subscription()], 100);

    let started = std::time::Instant::now();
    let decision = service
        .decide(common::request(Some(&token_with_kid("issuer-1"))))
        .await;

    assert!(!decision.allowed);
    assert_eq!(decision.http_status, 503);
    assert_eq!(decision.code, Some(ErrorCode::BackendUnavailable));
    assert!(started.elapsed() < Duration::from_secs(2));
}
