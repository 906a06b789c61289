use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;

use super::{Credential, Resolution, ValidatorKind, ensure_not_revoked};
use crate::auth::claims::ClaimSet;
use crate::auth::request::AuthRequest;
use crate::auth::revocation::RevokedTokens;
use crate::auth::token;
use crate::error::EnforcerError;
use crate::keystore::Keystore;
use crate::subscription::KeyType;

/// Control-plane issued API keys: signed tokens naming an application.
pub struct ApiKeyValidator {
    keystore: Arc<Keystore>,
    revoked: Arc<RevokedTokens>,
    header: String,
    query_param: String,
    certificate_alias: String,
}

impl ApiKeyValidator {
    pub fn new(
        keystore: Arc<Keystore>,
        revoked: Arc<RevokedTokens>,
        header: String,
        query_param: String,
        certificate_alias: String,
    ) -> Self {
        Self {
            keystore,
            revoked,
            header,
            query_param,
            certificate_alias,
        }
    }

    fn key<'a>(&self, request: &'a AuthRequest) -> Option<&'a str> {
        request
            .header(&self.header)
            .or_else(|| request.query.get(&self.query_param).map(String::as_str))
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    pub fn can_handle(&self, request: &AuthRequest) -> bool {
        self.key(request).is_some_and(token::looks_like_jws)
    }

    pub fn validate(&self, request: &AuthRequest) -> Result<Credential, EnforcerError> {
        let raw = self.key(request).ok_or(EnforcerError::MissingCredentials)?;

        let certificate = self
            .keystore
            .trust_store()
            .get(&self.certificate_alias)
            .ok_or_else(|| EnforcerError::InvalidCredentials {
                reason: "API key signing certificate is not configured".to_string(),
            })?;
        let (Some(key), Some(family)) = (certificate.decoding_key(), certificate.family) else {
            return Err(EnforcerError::InvalidCredentials {
                reason: "API key signing certificate has an unsupported key".to_string(),
            });
        };

        let now = Utc::now().timestamp();
        let verified = token::verify(raw, key, &family.algorithms(), now)?;
        ensure_not_revoked(&self.revoked, verified.jti(), now)?;

        let claims = verified.claims;
        check_permitted_ip(&claims, request.client_ip)?;
        check_permitted_referer(&claims, request.header("referer"))?;

        let uuid = claims
            .get("application")
            .and_then(|app| app.as_object())
            .and_then(|app| app.get("uuid"))
            .and_then(|uuid| uuid.as_str())
            .ok_or_else(|| EnforcerError::InvalidCredentials {
                reason: "API key does not name an application".to_string(),
            })?
            .to_string();
        let key_type = claims
            .get_str("keytype")
            .and_then(|kt| kt.parse().ok())
            .unwrap_or(KeyType::Production);

        Ok(Credential {
            kind: ValidatorKind::ApiKey,
            subject: claims.get_str("sub").unwrap_or_default().to_string(),
            resolution: Resolution::Application { uuid, key_type },
            scopes: None,
            token_id: claims.get_str("jti").map(str::to_string),
            expires_at: claims.get_i64("exp"),
            signature: Some(verified.signature),
            issuer: claims.get_str("iss").map(str::to_string),
            claims,
        })
    }
}

fn check_permitted_ip(claims: &ClaimSet, client_ip: Option<IpAddr>) -> Result<(), EnforcerError> {
    let Some(permitted) = claims.get_str("permittedIP").filter(|p| !p.trim().is_empty()) else {
        return Ok(());
    };
    let allowed = client_ip.is_some_and(|ip| {
        permitted
            .split(',')
            .filter_map(|entry| entry.trim().parse::<IpAddr>().ok())
            .any(|entry| entry == ip)
    });
    if allowed {
        Ok(())
    } else {
        Err(EnforcerError::ResourceForbidden {
            reason: "client IP is not permitted for this API key".to_string(),
        })
    }
}

fn check_permitted_referer(claims: &ClaimSet, referer: Option<&str>) -> Result<(), EnforcerError> {
    let Some(permitted) = claims.get_str("permittedReferer").filter(|p| !p.trim().is_empty()) else {
        return Ok(());
    };
    let allowed = referer.is_some_and(|referer| {
        permitted.split(',').map(str::trim).any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => referer.starts_with(prefix),
            None => referer == pattern,
        })
    });
    if allowed {
        Ok(())
    } else {
        Err(EnforcerError::ResourceForbidden {
            reason: "referer is not permitted for this API key".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permitted_ip_list() {
        let mut claims = ClaimSet::new();
        claims.insert("permittedIP", "10.0.0.1, 10.0.0.2");
        assert!(check_permitted_ip(&claims, Some("10.0.0.2".parse().unwrap())).is_ok());
        assert!(check_permitted_ip(&claims, Some("10.0.0.3".parse().unwrap())).is_err());
        assert!(check_permitted_ip(&claims, None).is_err());
        assert!(check_permitted_ip(&ClaimSet::new(), None).is_ok());
    }

    #[test]
    fn test_permitted_referer_wildcard() {
        let mut claims = ClaimSet::new();
        claims.insert("permittedReferer", "https://shop.example/*");
        assert!(check_permitted_referer(&claims, Some("https://shop.example/cart")).is_ok());
        assert!(check_permitted_referer(&claims, Some("https://evil.example/")).is_err());
    }
}
