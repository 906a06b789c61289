//! Credential validators.
//!
//! The set of validators is closed: [`Validator`] is an enum built from
//! configuration, and the pipeline tries its members in [`ValidatorKind::ALL`]
//! order.

mod api_key;
mod basic;
mod internal_key;
mod jwt;
mod mtls;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use api_key::ApiKeyValidator;
pub use basic::BasicValidator;
pub use internal_key::InternalKeyValidator;
pub use jwt::JwtValidator;
pub use mtls::MtlsValidator;

use super::claims::ClaimSet;
use super::issuers::IssuerRegistry;
use super::request::AuthRequest;
use super::revocation::RevokedTokens;
use crate::config::AuthConfig;
use crate::error::EnforcerError;
use crate::keystore::Keystore;
use crate::subscription::{AuthScheme, KeyType};

/// Realm advertised in challenges.
pub const REALM: &str = "gateway-enforcer";

/// Validator identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValidatorKind {
    Mtls,
    Jwt,
    ApiKey,
    InternalKey,
    Basic,
}

impl ValidatorKind {
    /// Every validator, in the order the pipeline tries them.
    pub const ALL: [ValidatorKind; 5] = [
        ValidatorKind::Mtls,
        ValidatorKind::Jwt,
        ValidatorKind::ApiKey,
        ValidatorKind::InternalKey,
        ValidatorKind::Basic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mtls => "mtls",
            Self::Jwt => "jwt",
            Self::ApiKey => "api_key",
            Self::InternalKey => "internal_key",
            Self::Basic => "basic",
        }
    }

    /// Whether this validator may authenticate a resource declaring `scheme`.
    ///
    /// Internal keys stand in for both token schemes; Basic is only tried
    /// when the resource accepts any credential.
    pub fn supports(&self, scheme: AuthScheme) -> bool {
        match scheme {
            AuthScheme::Any => true,
            AuthScheme::Jwt => matches!(self, Self::Jwt | Self::InternalKey),
            AuthScheme::ApiKey => matches!(self, Self::ApiKey | Self::InternalKey),
            AuthScheme::Mtls => matches!(self, Self::Mtls),
            AuthScheme::None => false,
        }
    }

    /// `WWW-Authenticate` challenge for failures of this validator.
    pub fn challenge(&self) -> String {
        let scheme = match self {
            Self::Mtls => "Mutual SSL",
            Self::Jwt => "Bearer",
            Self::ApiKey => "APIKey",
            Self::InternalKey => "InternalKey",
            Self::Basic => "Basic",
        };
        format!("{scheme} realm=\"{REALM}\"")
    }
}

impl fmt::Display for ValidatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidatorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "mtls" => Ok(Self::Mtls),
            "jwt" | "oauth2" => Ok(Self::Jwt),
            "api_key" | "apikey" => Ok(Self::ApiKey),
            "internal_key" => Ok(Self::InternalKey),
            "basic" => Ok(Self::Basic),
            other => Err(format!("unknown validator: {other}")),
        }
    }
}

/// How a credential leads to an application.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Through an application key mapping (OAuth2 tokens)
    KeyMapping { consumer_key: String, key_manager: String },
    /// Directly by application UUID (API keys)
    Application { uuid: String, key_type: KeyType },
    /// No application; the credential itself carries the tier
    Static { tier: String },
}

/// A verified credential, before subscription resolution.
#[derive(Debug, Clone)]
pub struct Credential {
    pub kind: ValidatorKind,
    /// End user or certificate subject
    pub subject: String,
    pub resolution: Resolution,
    /// `None` when the credential carries no scopes at all
    pub scopes: Option<Vec<String>>,
    pub claims: ClaimSet,
    pub token_id: Option<String>,
    pub signature: Option<String>,
    pub issuer: Option<String>,
    pub expires_at: Option<i64>,
}

/// Shared state validators verify against.
#[derive(Clone)]
pub struct ValidatorDeps {
    pub keystore: Arc<Keystore>,
    pub issuers: Arc<IssuerRegistry>,
    pub revoked: Arc<RevokedTokens>,
}

/// One enabled validator.
pub enum Validator {
    Mtls(MtlsValidator),
    Jwt(JwtValidator),
    ApiKey(ApiKeyValidator),
    InternalKey(InternalKeyValidator),
    Basic(BasicValidator),
}

impl Validator {
    pub fn build(kind: ValidatorKind, config: &AuthConfig, deps: &ValidatorDeps) -> Self {
        match kind {
            ValidatorKind::Mtls => Self::Mtls(MtlsValidator::new(
                Arc::clone(&deps.keystore),
                config.client_certificate_header.clone(),
            )),
            ValidatorKind::Jwt => Self::Jwt(JwtValidator::new(
                Arc::clone(&deps.keystore),
                Arc::clone(&deps.issuers),
                Arc::clone(&deps.revoked),
            )),
            ValidatorKind::ApiKey => Self::ApiKey(ApiKeyValidator::new(
                Arc::clone(&deps.keystore),
                Arc::clone(&deps.revoked),
                config.api_key_header.clone(),
                config.api_key_query_param.clone(),
                config.api_key_certificate_alias.clone(),
            )),
            ValidatorKind::InternalKey => Self::InternalKey(InternalKeyValidator::new(
                Arc::clone(&deps.keystore),
                Arc::clone(&deps.revoked),
                config.internal_key_header.clone(),
                config.internal_key_certificate_alias.clone(),
                config.internal_key_audience.clone(),
            )),
            ValidatorKind::Basic => Self::Basic(BasicValidator::new(config.basic_users.clone())),
        }
    }

    pub fn kind(&self) -> ValidatorKind {
        match self {
            Self::Mtls(_) => ValidatorKind::Mtls,
            Self::Jwt(_) => ValidatorKind::Jwt,
            Self::ApiKey(_) => ValidatorKind::ApiKey,
            Self::InternalKey(_) => ValidatorKind::InternalKey,
            Self::Basic(_) => ValidatorKind::Basic,
        }
    }

    /// Whether the request carries credential material this validator reads.
    pub fn can_handle(&self, request: &AuthRequest) -> bool {
        match self {
            Self::Mtls(v) => v.can_handle(request),
            Self::Jwt(v) => v.can_handle(request),
            Self::ApiKey(v) => v.can_handle(request),
            Self::InternalKey(v) => v.can_handle(request),
            Self::Basic(v) => v.can_handle(request),
        }
    }

    pub async fn validate(&self, request: &AuthRequest) -> Result<Credential, EnforcerError> {
        match self {
            Self::Mtls(v) => v.validate(request),
            Self::Jwt(v) => v.validate(request).await,
            Self::ApiKey(v) => v.validate(request),
            Self::InternalKey(v) => v.validate(request),
            Self::Basic(v) => v.validate(request),
        }
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Validator").field(&self.kind()).finish()
    }
}

/// Reject tokens whose `jti` is revoked.
pub(crate) fn ensure_not_revoked(revoked: &RevokedTokens, jti: Option<&str>, now: i64) -> Result<(), EnforcerError> {
    match jti {
        Some(jti) if revoked.is_revoked(jti, now) => Err(EnforcerError::InvalidCredentials {
            reason: "token has been revoked".to_string(),
        }),
        _ => Ok(()),
    }
}
