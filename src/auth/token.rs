//! Signed token parsing shared by the JWT, API key and internal key validators.
//!
//! Signature verification is delegated to `jsonwebtoken`; time claims are
//! checked here so an expired token reports its exact expiry.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation, decode, decode_header};
use serde_json::Value;

use super::claims::ClaimSet;
use crate::error::EnforcerError;

/// Tolerated clock difference for `exp` and `nbf`, in seconds.
const CLOCK_SKEW_SECS: i64 = 5;

/// A token whose signature and time claims have been verified.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub header: Header,
    pub claims: ClaimSet,
    /// Signature segment, used to key caches without storing the token
    pub signature: String,
}

impl VerifiedToken {
    pub fn jti(&self) -> Option<&str> {
        self.claims.get_str("jti")
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.claims.get_i64("exp")
    }
}

/// Whether `raw` has the three dot-separated segments of a JWS.
pub fn looks_like_jws(raw: &str) -> bool {
    raw.split('.').count() == 3 && !raw.contains(char::is_whitespace)
}

/// Header and payload of a token, without verifying anything.
///
/// Used only to pick the issuer whose key verifies the token.
pub fn peek(raw: &str) -> Result<(Header, ClaimSet), EnforcerError> {
    let header = decode_header(raw).map_err(|_| EnforcerError::InvalidCredentials {
        reason: "malformed token header".to_string(),
    })?;
    let payload = raw.split('.').nth(1).ok_or_else(|| EnforcerError::InvalidCredentials {
        reason: "malformed token".to_string(),
    })?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| EnforcerError::InvalidCredentials {
            reason: "malformed token payload".to_string(),
        })?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok((header, ClaimSet::from_json_object(map))),
        _ => Err(EnforcerError::InvalidCredentials {
            reason: "token payload is not a JSON object".to_string(),
        }),
    }
}

/// Verify signature, algorithm and time claims of `raw`.
pub fn verify(
    raw: &str,
    key: &DecodingKey,
    algorithms: &[Algorithm],
    now: i64,
) -> Result<VerifiedToken, EnforcerError> {
    let header = decode_header(raw).map_err(|_| EnforcerError::InvalidCredentials {
        reason: "malformed token header".to_string(),
    })?;
    if !algorithms.contains(&header.alg) {
        return Err(EnforcerError::IncorrectTokenType {
            reason: format!("algorithm {:?} not accepted for this issuer", header.alg),
        });
    }

    let mut validation = Validation::new(header.alg);
    validation.algorithms = algorithms.to_vec();
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<serde_json::Map<String, Value>>(raw, key, &validation)?;
    let claims = ClaimSet::from_json_object(data.claims);

    if let Some(exp) = claims.get_i64("exp") {
        if exp + CLOCK_SKEW_SECS <= now {
            return Err(EnforcerError::CredentialsExpired {
                expired_at: DateTime::from_timestamp(exp, 0).unwrap_or_else(Utc::now),
            });
        }
    }
    if let Some(nbf) = claims.get_i64("nbf") {
        if nbf - CLOCK_SKEW_SECS > now {
            return Err(EnforcerError::InvalidCredentials {
                reason: "token not yet valid".to_string(),
            });
        }
    }

    let signature = raw.rsplit('.').next().unwrap_or_default().to_string();
    Ok(VerifiedToken {
        header: data.header,
        claims,
        signature,
    })
}
