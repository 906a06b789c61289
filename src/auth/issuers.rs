//! Trusted token issuers.
//!
//! Issuers come from configuration at startup and from the key-manager
//! discovery stream afterwards. A discovered issuer replaces a configured one
//! with the same `iss` value.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use jsonwebtoken::{Algorithm, DecodingKey};

use super::jwks::{JwksCache, JwksError};
use crate::config::IssuerConfig;
use crate::keystore::{Keystore, TrustedCertificate};

/// Where an issuer's verification key comes from.
pub enum KeySource {
    /// Certificate shipped inline by the control plane
    Certificate(Arc<TrustedCertificate>),
    /// Trust store alias, resolved on every use so reloads take effect
    TrustStoreAlias(String),
    Jwks(Arc<JwksCache>),
}

impl std::fmt::Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Certificate(cert) => f.debug_tuple("Certificate").field(&cert.alias).finish(),
            Self::TrustStoreAlias(alias) => f.debug_tuple("TrustStoreAlias").field(alias).finish(),
            Self::Jwks(cache) => f.debug_tuple("Jwks").field(&cache.url().as_str()).finish(),
        }
    }
}

/// Verification key and the algorithms it may verify.
pub struct ResolvedKey {
    pub key: Arc<DecodingKey>,
    pub algorithms: Vec<Algorithm>,
}

/// A key manager whose tokens the JWT validator accepts.
#[derive(Debug)]
pub struct TrustedIssuer {
    /// Key manager name, half of the key mapping lookup key
    pub name: String,
    /// Expected `iss`
    pub issuer: String,
    pub key_source: KeySource,
    pub consumer_key_claim: String,
    pub scopes_claim: String,
    pub claim_mappings: HashMap<String, String>,
}

/// Why no key could be resolved for an issuer.
#[derive(Debug, thiserror::Error)]
pub enum KeyResolutionError {
    #[error("Trust store has no usable certificate for alias {0}")]
    UnknownAlias(String),

    #[error(transparent)]
    Jwks(#[from] JwksError),
}

impl TrustedIssuer {
    pub fn from_config(config: &IssuerConfig, jwks_ttl: Duration, http_client: &reqwest::Client) -> Self {
        let key_source = match (&config.certificate_alias, &config.jwks_url) {
            (Some(alias), _) => KeySource::TrustStoreAlias(alias.clone()),
            (None, Some(url)) => KeySource::Jwks(Arc::new(JwksCache::new(
                url.clone(),
                jwks_ttl,
                http_client.clone(),
            ))),
            (None, None) => KeySource::TrustStoreAlias(config.name.clone()),
        };
        Self {
            name: config.name.clone(),
            issuer: config.issuer.clone(),
            key_source,
            consumer_key_claim: config.consumer_key_claim.clone(),
            scopes_claim: config.scopes_claim.clone(),
            claim_mappings: config.claim_mappings.clone(),
        }
    }

    /// Verification key for a token signed with `kid`.
    pub async fn resolve_key(&self, kid: Option<&str>, keystore: &Keystore) -> Result<ResolvedKey, KeyResolutionError> {
        match &self.key_source {
            KeySource::Certificate(cert) => certificate_key(cert),
            KeySource::TrustStoreAlias(alias) => keystore
                .trust_store()
                .get(alias)
                .ok_or_else(|| KeyResolutionError::UnknownAlias(alias.clone()))
                .and_then(|cert| certificate_key(&cert)),
            KeySource::Jwks(cache) => {
                let key = cache.get_key(kid).await?;
                Ok(ResolvedKey {
                    key,
                    algorithms: vec![
                        Algorithm::RS256,
                        Algorithm::RS384,
                        Algorithm::RS512,
                        Algorithm::PS256,
                        Algorithm::ES256,
                        Algorithm::ES384,
                    ],
                })
            }
        }
    }
}

fn certificate_key(cert: &TrustedCertificate) -> Result<ResolvedKey, KeyResolutionError> {
    match (cert.decoding_key(), cert.family) {
        (Some(key), Some(family)) => Ok(ResolvedKey {
            key: Arc::new(key.clone()),
            algorithms: family.algorithms(),
        }),
        _ => Err(KeyResolutionError::UnknownAlias(cert.alias.clone())),
    }
}

/// Issuers by `iss` value.
pub struct IssuerRegistry {
    configured: HashMap<String, Arc<TrustedIssuer>>,
    discovered: ArcSwap<HashMap<String, Arc<TrustedIssuer>>>,
}

impl IssuerRegistry {
    pub fn new(configured: Vec<TrustedIssuer>) -> Self {
        Self {
            configured: configured
                .into_iter()
                .map(|issuer| (issuer.issuer.clone(), Arc::new(issuer)))
                .collect(),
            discovered: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn find(&self, iss: &str) -> Option<Arc<TrustedIssuer>> {
        self.discovered
            .load()
            .get(iss)
            .cloned()
            .or_else(|| self.configured.get(iss).cloned())
    }

    /// Replace every issuer learned from the control plane.
    pub fn replace_discovered(&self, issuers: Vec<TrustedIssuer>) {
        let map = issuers
            .into_iter()
            .map(|issuer| (issuer.issuer.clone(), Arc::new(issuer)))
            .collect();
        self.discovered.store(Arc::new(map));
    }

    pub fn len(&self) -> usize {
        let discovered = self.discovered.load();
        discovered.len()
            + self
                .configured
                .keys()
                .filter(|iss| !discovered.contains_key(*iss))
                .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for IssuerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuerRegistry").field("issuers", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer(iss: &str, name: &str) -> TrustedIssuer {
        TrustedIssuer {
            name: name.to_string(),
            issuer: iss.to_string(),
            key_source: KeySource::TrustStoreAlias(name.to_string()),
            consumer_key_claim: "azp".to_string(),
            scopes_claim: "scope".to_string(),
            claim_mappings: HashMap::new(),
        }
    }

    #[test]
    fn test_discovered_overrides_configured() {
        let registry = IssuerRegistry::new(vec![issuer("https://idp", "static")]);
        assert_eq!(registry.find("https://idp").map(|i| i.name.clone()), Some("static".to_string()));

        registry.replace_discovered(vec![issuer("https://idp", "dynamic")]);
        assert_eq!(registry.find("https://idp").map(|i| i.name.clone()), Some("dynamic".to_string()));
        assert_eq!(registry.len(), 1);

        registry.replace_discovered(vec![]);
        assert_eq!(registry.find("https://idp").map(|i| i.name.clone()), Some("static".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_alias_fails() {
        let keystore = Keystore::from_parts(Default::default(), None);
        let result = issuer("https://idp", "missing").resolve_key(None, &keystore).await;
        assert!(matches!(result, Err(KeyResolutionError::UnknownAlias(_))));
    }
}
