use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{Credential, Resolution, ValidatorKind};
use crate::auth::claims::ClaimSet;
use crate::auth::request::AuthRequest;
use crate::error::EnforcerError;
use crate::keystore::Keystore;

/// Client certificates matched against the trust store and the API's allowed aliases.
pub struct MtlsValidator {
    keystore: Arc<Keystore>,
    header: String,
}

impl MtlsValidator {
    pub fn new(keystore: Arc<Keystore>, header: String) -> Self {
        Self { keystore, header }
    }

    pub fn can_handle(&self, request: &AuthRequest) -> bool {
        request.peer_certificate.is_some()
            || request
                .header(&self.header)
                .is_some_and(|value| !value.trim().is_empty())
    }

    pub fn validate(&self, request: &AuthRequest) -> Result<Credential, EnforcerError> {
        let der = match &request.peer_certificate {
            Some(der) => der.clone(),
            None => {
                let value = request
                    .header(&self.header)
                    .ok_or(EnforcerError::MissingCredentials)?;
                forwarded_certificate_der(value)?
            }
        };

        let certificate = self
            .keystore
            .trust_store()
            .find_by_der(&der)
            .ok_or_else(|| EnforcerError::InvalidCredentials {
                reason: "client certificate is not trusted".to_string(),
            })?;

        let now = Utc::now().timestamp();
        if now > certificate.not_after {
            return Err(EnforcerError::CredentialsExpired {
                expired_at: DateTime::from_timestamp(certificate.not_after, 0).unwrap_or_else(Utc::now),
            });
        }
        if !certificate.is_valid_at(now) {
            return Err(EnforcerError::InvalidCredentials {
                reason: "client certificate is not yet valid".to_string(),
            });
        }

        let allowed = request
            .api
            .client_certificates
            .iter()
            .find(|allowed| allowed.alias == certificate.alias)
            .ok_or_else(|| EnforcerError::InvalidCredentials {
                reason: format!(
                    "client certificate {} is not allowed for {}",
                    certificate.alias,
                    request.api.display_key()
                ),
            })?;

        debug!(alias = %certificate.alias, "Client certificate accepted");

        Ok(Credential {
            kind: ValidatorKind::Mtls,
            subject: certificate.subject.clone(),
            resolution: Resolution::Static {
                tier: allowed.tier.clone(),
            },
            scopes: None,
            claims: ClaimSet::new(),
            token_id: None,
            signature: Some(certificate.thumbprint_sha256.clone()),
            issuer: None,
            expires_at: Some(certificate.not_after),
        })
    }
}

/// DER of a certificate forwarded by a load balancer.
///
/// Accepts a raw PEM document, base64 of a PEM document, or base64 of DER.
fn forwarded_certificate_der(value: &str) -> Result<Vec<u8>, EnforcerError> {
    let invalid = |reason: &str| EnforcerError::InvalidCredentials {
        reason: format!("forwarded client certificate {reason}"),
    };
    let value = value.trim();

    let bytes = if value.starts_with("-----BEGIN") {
        value.as_bytes().to_vec()
    } else {
        let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
        STANDARD.decode(compact).map_err(|_| invalid("is not base64"))?
    };

    if bytes.starts_with(b"-----BEGIN") {
        let document = pem::parse(&bytes).map_err(|_| invalid("is not valid PEM"))?;
        if document.tag() != "CERTIFICATE" {
            return Err(invalid("is not a certificate"));
        }
        Ok(document.into_contents())
    } else {
        Ok(bytes)
    }
}
