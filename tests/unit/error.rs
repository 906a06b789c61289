//! Error Code Unit Tests

use std::time::Duration;

use uuid::Uuid;

use gateway_enforcer::error::contains_sensitive_info;
use gateway_enforcer::throttle::ThrottleLevel;
use gateway_enforcer::{EnforcerError, ErrorCode, ErrorResponse};

#[test]
fn test_code_table() {
    let table = [
        (ErrorCode::InvalidCredentials, 900901, 401),
        (ErrorCode::MissingCredentials, 900902, 401),
        (ErrorCode::CredentialsExpired, 900903, 401),
        (ErrorCode::ResourceForbidden, 900908, 403),
        (ErrorCode::InvalidScope, 900910, 403),
        (ErrorCode::ThrottledApi, 900800, 429),
        (ErrorCode::ThrottledApplication, 900803, 429),
        (ErrorCode::ThrottledSubscription, 900804, 429),
        (ErrorCode::RequestBlocked, 900805, 403),
        (ErrorCode::BackendUnavailable, 102503, 503),
        (ErrorCode::Internal, 102500, 500),
    ];
    for (code, numeric, status) in table {
        assert_eq!(code.numeric(), numeric, "{}", code.as_str());
        assert_eq!(code.http_status(), status, "{}", code.as_str());
        assert_eq!(code.is_credential_failure(), status == 401);
    }
}

#[test]
fn test_throttle_level_selects_code() {
    let throttled = |level| EnforcerError::Throttled {
        level,
        key: "20:alice".to_string(),
        retry_after: Duration::from_secs(12),
    };
    assert_eq!(throttled(ThrottleLevel::Custom).code(), ErrorCode::ThrottledCustom);
    assert_eq!(throttled(ThrottleLevel::Resource).code(), ErrorCode::ThrottledResource);
    assert_eq!(throttled(ThrottleLevel::Application).code(), ErrorCode::ThrottledApplication);
    assert_eq!(throttled(ThrottleLevel::Subscription).retry_after(), Some(Duration::from_secs(12)));
    assert!(throttled(ThrottleLevel::Api).is_retryable());
}

#[test]
fn test_deadline_reports_as_unavailable() {
    let err = EnforcerError::DeadlineExceeded {
        duration: Duration::from_millis(200),
    };
    assert_eq!(err.code(), ErrorCode::BackendUnavailable);
    assert_eq!(err.code().http_status(), 503);
}

#[test]
fn test_internal_details_never_reach_clients() {
    let err = EnforcerError::Internal(anyhow::anyhow!("signing key /etc/enforcer/key.pem unreadable"));
    let response = ErrorResponse::from_error(&err, Uuid::new_v4());
    assert_eq!(response.message, "Internal error");
}

#[test]
fn test_token_fragments_are_sanitized() {
    let err = EnforcerError::IncorrectTokenType {
        reason: "bearer token eyJhbGciOi is opaque".to_string(),
    };
    let response = ErrorResponse::from_error(&err, Uuid::new_v4());
    assert_eq!(response.message, "Invalid credential format");
    assert!(contains_sensitive_info("Authorization: Basic YWxpY2U="));
    assert!(!contains_sensitive_info("unsupported signing algorithm"));
}

#[test]
fn test_wire_message_carries_correlation_id() {
    let id = Uuid::new_v4();
    let response = ErrorResponse::from_error(&EnforcerError::MissingCredentials, id);
    assert!(response.to_wire_message().ends_with(&format!("[correlation_id: {id}]")));
    assert_eq!(response.code, ErrorCode::MissingCredentials);
}
