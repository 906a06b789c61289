use std::sync::Arc;

use chrono::Utc;

use super::{Credential, Resolution, ValidatorKind, ensure_not_revoked};
use crate::auth::claims::{ClaimSet, ClaimValue};
use crate::auth::request::AuthRequest;
use crate::auth::revocation::RevokedTokens;
use crate::auth::token;
use crate::error::EnforcerError;
use crate::keystore::Keystore;
use crate::subscription::Api;
use crate::subscription::model::UNLIMITED_TIER;

/// `token_type` value of an internal test key.
const INTERNAL_KEY_TOKEN_TYPE: &str = "InternalKey";

/// Publisher test keys, authorized for the APIs they list without a subscription.
pub struct InternalKeyValidator {
    keystore: Arc<Keystore>,
    revoked: Arc<RevokedTokens>,
    header: String,
    certificate_alias: String,
    audience: Option<String>,
}

impl InternalKeyValidator {
    pub fn new(
        keystore: Arc<Keystore>,
        revoked: Arc<RevokedTokens>,
        header: String,
        certificate_alias: String,
        audience: Option<String>,
    ) -> Self {
        Self {
            keystore,
            revoked,
            header,
            certificate_alias,
            audience,
        }
    }

    pub fn can_handle(&self, request: &AuthRequest) -> bool {
        request
            .header(&self.header)
            .is_some_and(|key| !key.trim().is_empty())
    }

    pub fn validate(&self, request: &AuthRequest) -> Result<Credential, EnforcerError> {
        let raw = request
            .header(&self.header)
            .map(str::trim)
            .ok_or(EnforcerError::MissingCredentials)?;
        if !token::looks_like_jws(raw) {
            return Err(EnforcerError::InvalidCredentials {
                reason: "internal key is malformed".to_string(),
            });
        }

        let certificate = self
            .keystore
            .trust_store()
            .get(&self.certificate_alias)
            .ok_or_else(|| EnforcerError::InvalidCredentials {
                reason: "internal key signing certificate is not configured".to_string(),
            })?;
        let (Some(key), Some(family)) = (certificate.decoding_key(), certificate.family) else {
            return Err(EnforcerError::InvalidCredentials {
                reason: "internal key signing certificate has an unsupported key".to_string(),
            });
        };

        let now = Utc::now().timestamp();
        let verified = token::verify(raw, key, &family.algorithms(), now)?;
        let claims = verified.claims;

        if claims.get_str("token_type") != Some(INTERNAL_KEY_TOKEN_TYPE) {
            return Err(EnforcerError::IncorrectTokenType {
                reason: "presented key is not an internal key".to_string(),
            });
        }
        ensure_not_revoked(&self.revoked, claims.get_str("jti"), now)?;

        if let Some(audience) = &self.audience {
            if !claims.audience().iter().any(|aud| aud == audience) {
                return Err(EnforcerError::InvalidCredentials {
                    reason: "internal key audience mismatch".to_string(),
                });
            }
        }
        if !lists_api(&claims, &request.api) {
            return Err(EnforcerError::ResourceForbidden {
                reason: format!("internal key is not valid for {}", request.api.display_key()),
            });
        }

        Ok(Credential {
            kind: ValidatorKind::InternalKey,
            subject: claims.get_str("sub").unwrap_or_default().to_string(),
            resolution: Resolution::Static {
                tier: UNLIMITED_TIER.to_string(),
            },
            scopes: None,
            token_id: claims.get_str("jti").map(str::to_string),
            expires_at: claims.get_i64("exp"),
            signature: Some(verified.signature),
            issuer: claims.get_str("iss").map(str::to_string),
            claims,
        })
    }
}

/// Whether the `subscribedAPIs` claim names `api` by context, or by name and version.
fn lists_api(claims: &ClaimSet, api: &Api) -> bool {
    let Some(ClaimValue::List(entries)) = claims.get("subscribedAPIs") else {
        return false;
    };
    entries.iter().filter_map(ClaimValue::as_object).any(|entry| {
        let field = |name: &str| entry.get(name).and_then(ClaimValue::as_str);
        let same_version = field("version") == Some(api.version.as_str());
        let by_context = field("context").is_some_and(|context| {
            context == api.context || context == format!("{}/{}", api.context, api.version)
        });
        let by_name = field("name") == Some(api.name.as_str());
        same_version && (by_context || by_name)
    })
}
