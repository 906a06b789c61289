//! Decision Flow Integration Tests
//!
//! Full request decisions against a seeded store and the fixture issuer.

use std::time::Duration;

use gateway_enforcer::auth::token;
use gateway_enforcer::keystore::TrustedCertificate;
use gateway_enforcer::ErrorCode;

use crate::common::{self, seed, subscription, token as bearer};

#[tokio::test]
async fn test_subscribed_caller_is_allowed() {
    let service = common::service(&[]);
    seed(&service.context().registry, vec![subscription()], 100);

    let decision = service.decide(common::request(Some(&bearer(300)))).await;

    assert!(decision.allowed, "denied: {}", decision.message);
    assert_eq!(decision.http_status, 200);
    let context = decision.context.expect("allowed decisions carry a context");
    assert_eq!(context.application_id, Some(common::APP_ID));
    assert_eq!(context.subscriber.as_deref(), Some("alice"));
    assert_eq!(context.consumer_key.as_deref(), Some(common::CONSUMER_KEY));
    assert!(context.scopes.contains(&"read:pets".to_string()));
    assert!(decision.backend_token.is_none());
}

#[tokio::test]
async fn test_expired_token_is_rejected_with_challenge() {
    let service = common::service(&[]);
    seed(&service.context().registry, vec![subscription()], 100);

    let decision = service.decide(common::request(Some(&bearer(-600)))).await;

    assert!(!decision.allowed);
    assert_eq!(decision.http_status, 401);
    assert_eq!(decision.code, Some(ErrorCode::CredentialsExpired));
    let challenge = decision.response_headers.get("www-authenticate").expect("challenge header");
    assert!(challenge.contains("Bearer"));
}

#[tokio::test]
async fn test_missing_credentials() {
    let service = common::service(&[]);
    seed(&service.context().registry, vec![subscription()], 100);

    let decision = service.decide(common::request(None)).await;

    assert_eq!(decision.http_status, 401);
    assert_eq!(decision.code, Some(ErrorCode::MissingCredentials));
    assert_eq!(decision.code.map(|c| c.numeric()), Some(900902));
}

#[tokio::test]
async fn test_valid_token_without_subscription_is_forbidden() {
    let service = common::service(&[]);
    seed(&service.context().registry, vec![], 100);

    let decision = service.decide(common::request(Some(&bearer(300)))).await;

    assert_eq!(decision.http_status, 403);
    assert_eq!(decision.code, Some(ErrorCode::ResourceForbidden));
    assert!(!decision.response_headers.contains_key("www-authenticate"));
}

#[tokio::test]
async fn test_unknown_api_in_loaded_tenant_is_forbidden() {
    let service = common::service(&[]);
    seed(&service.context().registry, vec![subscription()], 100);

    let mut request = common::request(Some(&bearer(300)));
    request.api_context = "/birds/1.0".to_string();
    let decision = service.decide(request).await;

    assert_eq!(decision.http_status, 403);
}

#[tokio::test]
async fn test_application_quota_denies_sixth_request() {
    let service = common::service(&[]);
    seed(&service.context().registry, vec![subscription()], 5);
    let token = bearer(300);

    for n in 1..=5 {
        let decision = service.decide(common::request(Some(&token))).await;
        assert!(decision.allowed, "request {n} denied: {}", decision.message);
    }

    let sixth = service.decide(common::request(Some(&token))).await;
    assert!(!sixth.allowed);
    assert_eq!(sixth.http_status, 429);
    assert_eq!(sixth.code, Some(ErrorCode::ThrottledApplication));
    let retry_after = sixth.retry_after.expect("throttled decisions carry retry-after");
    assert!(retry_after <= Duration::from_secs(60));
    assert!(retry_after >= Duration::from_secs(1));
    assert!(sixth.response_headers.contains_key("retry-after"));

    // Stop-on-quota-reach keeps the key denied for the rest of the window.
    let seventh = service.decide(common::request(Some(&token))).await;
    assert_eq!(seventh.http_status, 429);
}

#[tokio::test]
async fn test_backend_token_issued_and_verifiable() {
    let key = common::fixture("issuer.key").display().to_string();
    let cert = common::fixture("issuer.pem").display().to_string();
    let service = common::service(&[
        ("ENFORCER_BACKEND_JWT_ENABLED", "true"),
        ("ENFORCER_SIGNING_KEY", key.as_str()),
        ("ENFORCER_SIGNING_CERT", cert.as_str()),
        ("ENFORCER_BACKEND_JWT_AUDIENCE", "pets-backend"),
    ]);
    seed(&service.context().registry, vec![subscription()], 100);

    let decision = service.decide(common::request(Some(&bearer(300)))).await;
    assert!(decision.allowed, "denied: {}", decision.message);
    let backend = decision.backend_token.expect("backend token issued");
    assert_eq!(backend.header_name, "X-JWT-Assertion");

    let pem = std::fs::read(common::fixture("issuer.pem")).unwrap();
    let certificate = TrustedCertificate::from_pem("issuer", &pem).unwrap();
    let verified = token::verify(
        &backend.token,
        certificate.decoding_key().unwrap(),
        &[jsonwebtoken::Algorithm::RS256],
        chrono::Utc::now().timestamp(),
    )
    .unwrap();

    assert_eq!(verified.claims.get_str("iss"), Some("gateway-enforcer"));
    assert_eq!(verified.claims.get_str("aud"), Some("pets-backend"));
    assert_eq!(verified.claims.get_str("sub"), Some("alice@carbon.super"));
    assert_eq!(
        verified.claims.get_str("http://wso2.org/claims/applicationid"),
        Some(common::APP_ID.to_string().as_str())
    );
    assert!(verified.claims.contains("jti"));
    assert!(verified.claims.get_i64("exp") > verified.claims.get_i64("iat"));
    assert_eq!(verified.claims.get_str("azp"), Some(common::CONSUMER_KEY));
}

#[tokio::test]
async fn test_allowed_decision_reports_counted_delta() {
    let service = common::service(&[]);
    seed(&service.context().registry, vec![subscription()], 100);
    let mut events = service.context().take_throttle_events().expect("peer sync is on by default");

    let decision = service.decide(common::request(Some(&bearer(300)))).await;
    assert!(decision.allowed, "denied: {}", decision.message);

    let mut reported = Vec::new();
    while let Ok(event) = events.try_recv() {
        reported.push(event);
    }
    let app_prefix = format!("{}:", common::APP_ID);
    assert!(reported.iter().any(|e| e.key.starts_with(&app_prefix)), "reported: {reported:?}");
    assert!(reported.iter().all(|e| e.delta == 1 && e.throttled_until_ms.is_none()));
}

#[tokio::test]
async fn test_denied_decision_reports_nothing() {
    let service = common::service(&[]);
    seed(&service.context().registry, vec![subscription()], 1);
    let token = bearer(300);
    assert!(service.decide(common::request(Some(&token))).await.allowed);

    let mut events = service.context().take_throttle_events().expect("peer sync is on by default");
    while events.try_recv().is_ok() {}

    let denied = service.decide(common::request(Some(&token))).await;
    assert_eq!(denied.http_status, 429);
    assert!(events.try_recv().is_err());
}
