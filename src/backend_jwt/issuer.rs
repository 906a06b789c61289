//! Backend token construction.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::cache::TokenCache;
use super::signer::{SigningAlgorithm, SigningError, TokenSigner};
use crate::auth::AuthenticationContext;
use crate::config::BackendJwtConfig;
use crate::keystore::SigningMaterial;

/// Claims the issuer always sets itself.
const STANDARD_CLAIMS: [&str; 7] = ["iss", "sub", "aud", "iat", "exp", "nbf", "jti"];

/// A token ready to attach to the upstream request.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendToken {
    pub header_name: String,
    pub token: String,
}

/// Mints signed tokens describing the authenticated caller for upstream services.
pub struct BackendTokenIssuer {
    config: BackendJwtConfig,
    algorithm: SigningAlgorithm,
    signer: ArcSwap<TokenSigner>,
    ttl: OnceLock<Duration>,
    cache: Option<TokenCache>,
    restricted: HashSet<String>,
}

impl BackendTokenIssuer {
    pub fn new(config: BackendJwtConfig, material: Option<&SigningMaterial>) -> Result<Self, SigningError> {
        let algorithm = SigningAlgorithm::parse(&config.algorithm)?;
        let signer = TokenSigner::new(algorithm, material)?;
        let cache = config
            .cache_enabled
            .then(|| TokenCache::with_capacity(config.cache_capacity));
        let restricted = config.restricted_claims.iter().cloned().collect();
        Ok(Self {
            config,
            algorithm,
            signer: ArcSwap::from_pointee(signer),
            ttl: OnceLock::new(),
            cache,
            restricted,
        })
    }

    /// Swap in reloaded key material. Cached tokens signed with the old key are dropped.
    pub fn reload(&self, material: Option<&SigningMaterial>) -> Result<(), SigningError> {
        let signer = TokenSigner::new(self.algorithm, material)?;
        info!(thumbprint = ?signer.thumbprint(), "Backend token signer reloaded");
        self.signer.store(Arc::new(signer));
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        Ok(())
    }

    /// Drop expired cached tokens. Returns how many were removed.
    pub fn purge_cache(&self, now: i64) -> usize {
        self.cache.as_ref().map_or(0, |cache| cache.purge_expired(now))
    }

    pub fn header_name(&self) -> &str {
        &self.config.header_name
    }

    /// Token lifetime, fixed on first use.
    pub fn ttl(&self) -> Duration {
        *self.ttl.get_or_init(|| {
            if self.config.cache_enabled {
                self.config.cache_expiry
            } else {
                self.config.expiry
            }
        })
    }

    /// Sign a throwaway token so a broken key fails startup rather than the first request.
    pub fn self_test(&self) -> Result<(), SigningError> {
        let mut claims = BTreeMap::new();
        claims.insert("sub".to_string(), Value::from("self-test"));
        self.encode(&claims).map(|_| ())
    }

    pub fn issue(&self, context: &AuthenticationContext) -> Result<BackendToken, SigningError> {
        self.issue_at(context, Utc::now().timestamp())
    }

    #[instrument(skip_all, fields(api = %context.api.display_key()))]
    pub fn issue_at(&self, context: &AuthenticationContext, now: i64) -> Result<BackendToken, SigningError> {
        let cache_key = match (&self.cache, &context.token_signature) {
            (Some(_), Some(signature)) => Some(TokenCache::key(
                &context.api.context,
                &context.api.version,
                signature,
            )),
            _ => None,
        };

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(token) = cache.get(key, now) {
                debug!("Backend token served from cache");
                return Ok(self.wrap(token));
            }
        }

        let claims = self.claims(context, now);
        let token = self.encode(&claims)?;

        if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
            let expires_at = claims.get("exp").and_then(Value::as_i64).unwrap_or(now);
            if !cache.insert(key, token.clone(), expires_at) {
                debug!(cached = cache.len(), "Backend token cache full, token not cached");
            }
        }
        Ok(self.wrap(token))
    }

    fn wrap(&self, token: String) -> BackendToken {
        BackendToken {
            header_name: self.config.header_name.clone(),
            token,
        }
    }

    /// Claim set of a backend token, ordered by name.
    ///
    /// Caller claims come first, enforcer claims override them, and the
    /// standard claims override both.
    pub fn claims(&self, context: &AuthenticationContext, now: i64) -> BTreeMap<String, Value> {
        let mut claims = BTreeMap::new();

        for (name, value) in context.claims.iter() {
            if self.restricted.contains(name) || STANDARD_CLAIMS.contains(&name.as_str()) {
                continue;
            }
            claims.insert(name.clone(), value.to_json());
        }

        let dialect = self.config.claim_dialect.trim_end_matches('/');
        let mut enforcer = |name: &str, value: Value| {
            claims.insert(format!("{dialect}/{name}"), value);
        };
        let api = &context.api;
        enforcer("apiname", Value::from(api.name.as_str()));
        enforcer("apicontext", Value::from(api.context.as_str()));
        enforcer("version", Value::from(api.version.as_str()));
        enforcer("keytype", Value::from(context.key_type.as_str()));
        enforcer("enduser", Value::from(context.username.as_str()));
        enforcer("tier", Value::from(context.subscription_tier.as_str()));
        if let Some(subscriber) = &context.subscriber {
            enforcer("subscriber", Value::from(subscriber.as_str()));
            enforcer("usertype", Value::from("APPLICATION"));
        }
        if let Some(id) = context.application_id {
            enforcer("applicationid", Value::from(id.to_string()));
            enforcer("applicationtier", Value::from(context.application_tier.as_str()));
        }
        if let Some(name) = &context.application_name {
            enforcer("applicationname", Value::from(name.as_str()));
        }
        if let Some(uuid) = &context.application_uuid {
            enforcer("applicationUUId", Value::from(uuid.as_str()));
        }

        let ttl = i64::try_from(self.ttl().as_secs()).unwrap_or(i64::MAX);
        claims.insert("iss".to_string(), Value::from(self.config.issuer.as_str()));
        claims.insert("sub".to_string(), Value::from(context.username.as_str()));
        match self.config.audience.as_slice() {
            [] => {}
            [single] => {
                claims.insert("aud".to_string(), Value::from(single.as_str()));
            }
            many => {
                claims.insert("aud".to_string(), Value::from(many.to_vec()));
            }
        }
        claims.insert("iat".to_string(), Value::from(now));
        claims.insert("exp".to_string(), Value::from(now.saturating_add(ttl)));
        claims.insert("jti".to_string(), Value::from(Uuid::new_v4().to_string()));
        claims
    }

    /// `header.body.signature`, base64url without padding.
    pub fn encode(&self, claims: &BTreeMap<String, Value>) -> Result<String, SigningError> {
        let signer = self.signer.load();

        let mut header = BTreeMap::new();
        header.insert("alg", Value::from(signer.algorithm().header_value()));
        header.insert("typ", Value::from("JWT"));
        if let Some(thumbprint) = signer.thumbprint() {
            header.insert("x5t#S256", Value::from(thumbprint));
        }

        let assertion = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?)
        );
        let signature = signer.sign(assertion.as_bytes())?;
        Ok(format!("{assertion}.{}", URL_SAFE_NO_PAD.encode(signature)))
    }
}

impl std::fmt::Debug for BackendTokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendTokenIssuer")
            .field("algorithm", &self.algorithm)
            .field("header_name", &self.config.header_name)
            .field("cache_enabled", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}
