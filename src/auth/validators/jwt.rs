use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use super::{Credential, Resolution, ValidatorKind, ensure_not_revoked};
use crate::auth::issuers::{IssuerRegistry, KeyResolutionError};
use crate::auth::jwks::JwksError;
use crate::auth::request::AuthRequest;
use crate::auth::revocation::RevokedTokens;
use crate::auth::token;
use crate::error::EnforcerError;
use crate::keystore::Keystore;

/// OAuth2 bearer tokens issued by a trusted key manager.
pub struct JwtValidator {
    keystore: Arc<Keystore>,
    issuers: Arc<IssuerRegistry>,
    revoked: Arc<RevokedTokens>,
}

impl JwtValidator {
    pub fn new(keystore: Arc<Keystore>, issuers: Arc<IssuerRegistry>, revoked: Arc<RevokedTokens>) -> Self {
        Self {
            keystore,
            issuers,
            revoked,
        }
    }

    pub fn can_handle(&self, request: &AuthRequest) -> bool {
        request.authorization("Bearer").is_some_and(token::looks_like_jws)
    }

    pub async fn validate(&self, request: &AuthRequest) -> Result<Credential, EnforcerError> {
        let raw = request
            .authorization("Bearer")
            .ok_or(EnforcerError::MissingCredentials)?;

        let (header, unverified) = token::peek(raw)?;
        let iss = unverified
            .get_str("iss")
            .ok_or_else(|| EnforcerError::InvalidCredentials {
                reason: "token has no issuer".to_string(),
            })?;
        let issuer = self
            .issuers
            .find(iss)
            .ok_or_else(|| EnforcerError::InvalidCredentials {
                reason: format!("issuer {iss} is not trusted"),
            })?;

        let resolved = issuer
            .resolve_key(header.kid.as_deref(), &self.keystore)
            .await
            .map_err(|e| match e {
                KeyResolutionError::Jwks(JwksError::Fetch { reason }) => EnforcerError::BackendUnavailable {
                    reason: format!("issuer keys unavailable: {reason}"),
                    retry_after: None,
                },
                other => EnforcerError::InvalidCredentials {
                    reason: other.to_string(),
                },
            })?;

        let now = Utc::now().timestamp();
        let verified = token::verify(raw, &resolved.key, &resolved.algorithms, now)?;
        ensure_not_revoked(&self.revoked, verified.jti(), now)?;

        let claims = verified.claims.clone().remap(&issuer.claim_mappings);
        let consumer_key = claims
            .get_str(&issuer.consumer_key_claim)
            .or_else(|| claims.get_str("client_id"))
            .ok_or_else(|| EnforcerError::InvalidCredentials {
                reason: format!("token has no {} claim", issuer.consumer_key_claim),
            })?
            .to_string();
        let scopes = claims
            .get(&issuer.scopes_claim)
            .map(|value| value.to_string_list())
            .unwrap_or_default();
        let subject = claims.get_str("sub").unwrap_or_default().to_string();

        debug!(issuer = %issuer.name, subject = %subject, "Bearer token verified");

        Ok(Credential {
            kind: ValidatorKind::Jwt,
            subject,
            resolution: Resolution::KeyMapping {
                consumer_key,
                key_manager: issuer.name.clone(),
            },
            scopes: Some(scopes),
            token_id: verified.jti().map(str::to_string),
            expires_at: verified.expires_at(),
            signature: Some(verified.signature.clone()),
            issuer: Some(issuer.issuer.clone()),
            claims,
        })
    }
}
