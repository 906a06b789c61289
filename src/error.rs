//! Error handling module with type-safe, non-exhaustive error types
//!
//! Every request-facing failure maps to:
//! - a stable machine code (`ErrorCode::as_str`) that clients can switch on
//! - the numeric code used by existing gateway clients (`ErrorCode::numeric`)
//! - the HTTP status the data plane must emit (`ErrorCode::http_status`)
//!
//! Messages that leave the process are sanitized so token material never leaks.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::throttle::ThrottleLevel;

/// Sensitive patterns that should be sanitized from error messages
const SENSITIVE_PATTERNS: &[&str] = &[
    "password",
    "secret",
    "token",
    "key",
    "credential",
    "bearer",
    "basic ",
    "authorization",
    "apikey",
    "private",
    "-----begin",
];

/// Non-exhaustive error enum for forward compatibility
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EnforcerError {
    /// No validator found credentials it could handle
    #[error("Credentials missing from request")]
    MissingCredentials,

    /// Credentials were present but could not be verified
    #[error("Invalid credentials: {reason}")]
    InvalidCredentials {
        /// Description of the failure
        reason: String,
    },

    /// Credentials have expired
    #[error("Credentials expired at {expired_at}")]
    CredentialsExpired {
        /// When the credential expired
        expired_at: DateTime<Utc>,
    },

    /// Token parsed but is of the wrong kind for the validator
    #[error("Incorrect token type: {reason}")]
    IncorrectTokenType {
        /// Description of the mismatch
        reason: String,
    },

    /// Credential resolved but carries no entitlement to the resource
    #[error("Resource forbidden: {reason}")]
    ResourceForbidden {
        /// Description of the failure
        reason: String,
    },

    /// API or subscription is blocked
    #[error("API blocked: {api}")]
    ApiBlocked {
        /// API identity (context:version)
        api: String,
    },

    /// Subscription exists but is not active
    #[error("Subscription inactive: {state}")]
    SubscriptionInactive {
        /// Current subscription state
        state: String,
    },

    /// Token scopes do not satisfy the resource
    #[error("Invalid scope, resource requires one of {required:?}")]
    InvalidScope {
        /// Scopes accepted by the resource
        required: Vec<String>,
    },

    /// Request matched a blocking condition
    #[error("Request blocked by condition {condition}")]
    RequestBlocked {
        /// Condition that matched
        condition: String,
    },

    /// Quota exceeded
    #[error("Throttled at {level:?} level on key {key}")]
    Throttled {
        /// Precedence level that denied
        level: ThrottleLevel,
        /// Offending throttle key
        key: String,
        /// When the client can retry
        retry_after: Duration,
    },

    /// Enforcer cannot reach a trustworthy decision
    #[error("Backend unavailable: {reason}")]
    BackendUnavailable {
        /// Description of the outage
        reason: String,
        /// Suggested retry duration
        retry_after: Option<Duration>,
    },

    /// Request deadline elapsed before a decision was made
    #[error("Decision deadline exceeded after {duration:?}")]
    DeadlineExceeded {
        /// Configured deadline
        duration: Duration,
    },

    /// Internal error (details sanitized in responses)
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Error codes for decision responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    GeneralError,
    InvalidCredentials,
    MissingCredentials,
    CredentialsExpired,
    IncorrectTokenType,
    ResourceForbidden,
    ApiBlocked,
    SubscriptionInactive,
    InvalidScope,
    ThrottledApi,
    ThrottledResource,
    ThrottledApplication,
    ThrottledSubscription,
    RequestBlocked,
    ThrottledCustom,
    BackendUnavailable,
    Internal,
}

impl ErrorCode {
    /// Get the string representation of the error code
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GeneralError => "AUTH_GENERAL_ERROR",
            Self::InvalidCredentials => "AUTH_INVALID_CREDENTIALS",
            Self::MissingCredentials => "AUTH_MISSING_CREDENTIALS",
            Self::CredentialsExpired => "AUTH_CREDENTIALS_EXPIRED",
            Self::IncorrectTokenType => "AUTH_INCORRECT_ACCESS_TOKEN",
            Self::ResourceForbidden => "AUTH_RESOURCE_FORBIDDEN",
            Self::ApiBlocked => "AUTH_API_BLOCKED",
            Self::SubscriptionInactive => "AUTH_SUBSCRIPTION_INACTIVE",
            Self::InvalidScope => "AUTH_INVALID_SCOPE",
            Self::ThrottledApi => "THROTTLED_API",
            Self::ThrottledResource => "THROTTLED_RESOURCE",
            Self::ThrottledApplication => "THROTTLED_APPLICATION",
            Self::ThrottledSubscription => "THROTTLED_SUBSCRIPTION",
            Self::RequestBlocked => "REQUEST_BLOCKED",
            Self::ThrottledCustom => "THROTTLED_CUSTOM",
            Self::BackendUnavailable => "BACKEND_UNAVAILABLE",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// Numeric code understood by existing gateway clients
    pub fn numeric(&self) -> u32 {
        match self {
            Self::GeneralError => 900900,
            Self::InvalidCredentials => 900901,
            Self::MissingCredentials => 900902,
            Self::CredentialsExpired => 900903,
            Self::IncorrectTokenType => 900905,
            Self::ResourceForbidden => 900908,
            Self::ApiBlocked => 900907,
            Self::SubscriptionInactive => 900909,
            Self::InvalidScope => 900910,
            Self::ThrottledApi => 900800,
            Self::ThrottledResource => 900802,
            Self::ThrottledApplication => 900803,
            Self::ThrottledSubscription => 900804,
            Self::RequestBlocked => 900805,
            Self::ThrottledCustom => 900806,
            Self::BackendUnavailable => 102503,
            Self::Internal => 102500,
        }
    }

    /// HTTP status the data plane emits for this code
    pub fn http_status(&self) -> u16 {
        match self {
            Self::GeneralError
            | Self::InvalidCredentials
            | Self::MissingCredentials
            | Self::CredentialsExpired
            | Self::IncorrectTokenType => 401,
            Self::ResourceForbidden
            | Self::ApiBlocked
            | Self::SubscriptionInactive
            | Self::InvalidScope
            | Self::RequestBlocked => 403,
            Self::ThrottledApi
            | Self::ThrottledResource
            | Self::ThrottledApplication
            | Self::ThrottledSubscription
            | Self::ThrottledCustom => 429,
            Self::BackendUnavailable => 503,
            Self::Internal => 500,
        }
    }

    /// Whether the code reports a credential failure (401 family)
    pub fn is_credential_failure(&self) -> bool {
        self.http_status() == 401
    }
}

/// Structured error response with correlation ID
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    /// Error code for programmatic handling
    pub code: ErrorCode,
    /// Human-readable message (sanitized)
    pub message: String,
    /// Correlation ID for tracing
    pub correlation_id: Uuid,
    /// Optional retry-after duration
    pub retry_after: Option<Duration>,
}

impl ErrorResponse {
    /// Create a new error response from an EnforcerError
    pub fn from_error(error: &EnforcerError, correlation_id: Uuid) -> Self {
        let message = match error {
            EnforcerError::MissingCredentials => {
                "Invalid Credentials. Make sure your API invocation call has a header: \
                 'Authorization : Bearer ACCESS_TOKEN' or 'Authorization : Basic ACCESS_TOKEN' \
                 or 'apikey: API_KEY'"
                    .to_string()
            }
            EnforcerError::InvalidCredentials { .. } => {
                "Invalid Credentials. Make sure you have provided the correct security credentials"
                    .to_string()
            }
            EnforcerError::CredentialsExpired { .. } => "The access token has expired".to_string(),
            EnforcerError::IncorrectTokenType { reason } => sanitize_message(reason),
            EnforcerError::ResourceForbidden { .. } => {
                "User is NOT authorized to access the Resource. API Subscription validation failed."
                    .to_string()
            }
            EnforcerError::ApiBlocked { .. } => {
                "The requested API is temporarily blocked".to_string()
            }
            EnforcerError::SubscriptionInactive { .. } => {
                "The subscription to the API is inactive".to_string()
            }
            EnforcerError::InvalidScope { .. } => {
                "The access token does not allow you to access the requested resource".to_string()
            }
            EnforcerError::RequestBlocked { .. } => {
                "You have been blocked from accessing the resource".to_string()
            }
            EnforcerError::Throttled { .. } => {
                "Message throttled out. You have exceeded your quota".to_string()
            }
            EnforcerError::BackendUnavailable { .. } | EnforcerError::DeadlineExceeded { .. } => {
                "The enforcer is temporarily unable to process the request".to_string()
            }
            EnforcerError::Internal(_) => {
                // Never expose internal error details
                "Internal error".to_string()
            }
        };

        ErrorResponse {
            code: error.code(),
            message,
            correlation_id,
            retry_after: error.retry_after(),
        }
    }

    /// Message suffixed with the correlation ID, as written to the wire
    pub fn to_wire_message(&self) -> String {
        format!("{} [correlation_id: {}]", self.message, self.correlation_id)
    }
}

impl EnforcerError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MissingCredentials => ErrorCode::MissingCredentials,
            Self::InvalidCredentials { .. } => ErrorCode::InvalidCredentials,
            Self::CredentialsExpired { .. } => ErrorCode::CredentialsExpired,
            Self::IncorrectTokenType { .. } => ErrorCode::IncorrectTokenType,
            Self::ResourceForbidden { .. } => ErrorCode::ResourceForbidden,
            Self::ApiBlocked { .. } => ErrorCode::ApiBlocked,
            Self::SubscriptionInactive { .. } => ErrorCode::SubscriptionInactive,
            Self::InvalidScope { .. } => ErrorCode::InvalidScope,
            Self::RequestBlocked { .. } => ErrorCode::RequestBlocked,
            Self::Throttled { level, .. } => match level {
                ThrottleLevel::Custom => ErrorCode::ThrottledCustom,
                ThrottleLevel::Api => ErrorCode::ThrottledApi,
                ThrottleLevel::Resource => ErrorCode::ThrottledResource,
                ThrottleLevel::Application => ErrorCode::ThrottledApplication,
                ThrottleLevel::Subscription => ErrorCode::ThrottledSubscription,
            },
            Self::BackendUnavailable { .. } | Self::DeadlineExceeded { .. } => {
                ErrorCode::BackendUnavailable
            }
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Throttled { .. } | Self::BackendUnavailable { .. } | Self::DeadlineExceeded { .. }
        )
    }

    /// Get retry-after duration if applicable
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after, .. } => Some(*retry_after),
            Self::BackendUnavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Sanitize a message by removing sensitive information
pub(crate) fn sanitize_message(message: &str) -> String {
    if contains_sensitive_info(message) {
        return "Invalid credential format".to_string();
    }
    message.to_string()
}

/// Check if a string contains sensitive information
pub fn contains_sensitive_info(text: &str) -> bool {
    let lower = text.to_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

impl From<jsonwebtoken::errors::Error> for EnforcerError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => EnforcerError::CredentialsExpired {
                expired_at: Utc::now(),
            },
            ErrorKind::InvalidSignature => EnforcerError::InvalidCredentials {
                reason: "signature verification failed".to_string(),
            },
            ErrorKind::InvalidIssuer | ErrorKind::InvalidAudience => {
                EnforcerError::InvalidCredentials {
                    reason: sanitize_message(&err.to_string()),
                }
            }
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName | ErrorKind::MissingAlgorithm => {
                EnforcerError::IncorrectTokenType {
                    reason: "unsupported signing algorithm".to_string(),
                }
            }
            _ => EnforcerError::InvalidCredentials {
                reason: "credential could not be parsed".to_string(),
            },
        }
    }
}
