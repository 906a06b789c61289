use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::{Credential, Resolution, ValidatorKind};
use crate::auth::claims::ClaimSet;
use crate::auth::request::AuthRequest;
use crate::error::EnforcerError;
use crate::subscription::model::UNLIMITED_TIER;

/// Statically configured users.
pub struct BasicValidator {
    /// Username to lowercase hex SHA-256 of the password
    users: HashMap<String, String>,
}

impl BasicValidator {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    pub fn can_handle(&self, request: &AuthRequest) -> bool {
        request.authorization("Basic").is_some()
    }

    pub fn validate(&self, request: &AuthRequest) -> Result<Credential, EnforcerError> {
        let encoded = request
            .authorization("Basic")
            .ok_or(EnforcerError::MissingCredentials)?;
        let invalid = || EnforcerError::InvalidCredentials {
            reason: "invalid username or password".to_string(),
        };

        let decoded = STANDARD.decode(encoded).map_err(|_| invalid())?;
        let decoded = String::from_utf8(decoded).map_err(|_| invalid())?;
        let (username, password) = decoded.split_once(':').ok_or_else(invalid)?;

        let expected = self.users.get(username).ok_or_else(invalid)?;
        let presented = password_digest(password);
        if !bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
            return Err(invalid());
        }

        Ok(Credential {
            kind: ValidatorKind::Basic,
            subject: username.to_string(),
            resolution: Resolution::Static {
                tier: UNLIMITED_TIER.to_string(),
            },
            scopes: None,
            claims: ClaimSet::new(),
            token_id: None,
            signature: None,
            issuer: None,
            expires_at: None,
        })
    }
}

/// Lowercase hex SHA-256, the form passwords are configured in.
pub fn password_digest(password: &str) -> String {
    Sha256::digest(password.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
