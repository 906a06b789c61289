//! JWKS Cache with Single-Flight Refresh
//!
//! Keys of a remote JWKS endpoint are cached locally for a TTL. When a key is
//! missing or the cache is stale, one fetch runs no matter how many requests
//! are waiting for it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use jsonwebtoken::DecodingKey;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use url::Url;

/// JSON Web Key structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type (RSA, EC)
    pub kty: String,
    /// Key ID
    #[serde(default)]
    pub kid: Option<String>,
    /// Key use (sig, enc)
    #[serde(rename = "use", default)]
    pub key_use: Option<String>,
    #[serde(default)]
    pub alg: Option<String>,
    /// RSA modulus
    #[serde(default)]
    pub n: Option<String>,
    /// RSA exponent
    #[serde(default)]
    pub e: Option<String>,
    /// EC x coordinate
    #[serde(default)]
    pub x: Option<String>,
    /// EC y coordinate
    #[serde(default)]
    pub y: Option<String>,
    /// EC curve
    #[serde(default)]
    pub crv: Option<String>,
}

/// JSON Web Key Set structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Why a key could not be produced.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JwksError {
    #[error("Failed to fetch JWKS: {reason}")]
    Fetch { reason: String },

    #[error("Key {kid} not found in JWKS")]
    UnknownKey { kid: String },
}

struct CacheEntry {
    keys: HashMap<String, Arc<DecodingKey>>,
    fetched_at: Instant,
}

type InflightFuture = Shared<BoxFuture<'static, Result<(), JwksError>>>;

/// Cache of one issuer's JWKS endpoint.
pub struct JwksCache {
    url: Url,
    ttl: Duration,
    entry: Arc<ArcSwap<Option<CacheEntry>>>,
    inflight: Mutex<Option<InflightFuture>>,
    http_client: reqwest::Client,
}

/// Key id used for a JWKS entry without `kid`.
const ANONYMOUS_KID: &str = "";

impl JwksCache {
    pub fn new(url: Url, ttl: Duration, http_client: reqwest::Client) -> Self {
        Self {
            url,
            ttl,
            entry: Arc::new(ArcSwap::from_pointee(None)),
            inflight: Mutex::new(None),
            http_client,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Decoding key for `kid`, refreshing once if it is not cached.
    ///
    /// Tokens without `kid` match a JWKS that holds exactly one key.
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn get_key(&self, kid: Option<&str>) -> Result<Arc<DecodingKey>, JwksError> {
        if let Some(key) = self.try_get_local(kid) {
            return Ok(key);
        }

        self.refresh_single_flight().await?;

        self.lookup(kid).ok_or_else(|| JwksError::UnknownKey {
            kid: kid.unwrap_or(ANONYMOUS_KID).to_string(),
        })
    }

    fn try_get_local(&self, kid: Option<&str>) -> Option<Arc<DecodingKey>> {
        if self.is_stale() {
            return None;
        }
        self.lookup(kid)
    }

    fn lookup(&self, kid: Option<&str>) -> Option<Arc<DecodingKey>> {
        let cache = self.entry.load();
        let entry = (**cache).as_ref()?;
        match kid {
            Some(kid) => entry.keys.get(kid).cloned(),
            None if entry.keys.len() == 1 => entry.keys.values().next().cloned(),
            None => None,
        }
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        let cache = self.entry.load();
        match **cache {
            Some(ref entry) => entry.fetched_at.elapsed() >= self.ttl,
            None => true,
        }
    }

    /// Number of keys currently cached.
    #[must_use]
    pub fn key_count(&self) -> usize {
        let cache = self.entry.load();
        (**cache).as_ref().map_or(0, |e| e.keys.len())
    }

    async fn refresh_single_flight(&self) -> Result<(), JwksError> {
        let mut inflight_guard = self.inflight.lock().await;

        if let Some(fut) = inflight_guard.as_ref() {
            let fut = fut.clone();
            drop(inflight_guard);
            return fut.await;
        }

        let url = self.url.clone();
        let client = self.http_client.clone();
        let entry = Arc::clone(&self.entry);

        let fut: BoxFuture<'static, Result<(), JwksError>> = Box::pin(async move {
            info!(url = %url, "Fetching JWKS");

            let response = client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| JwksError::Fetch {
                    reason: e.to_string(),
                })?;

            if !response.status().is_success() {
                return Err(JwksError::Fetch {
                    reason: format!("status {}", response.status()),
                });
            }

            let jwks: Jwks = response.json().await.map_err(|e| JwksError::Fetch {
                reason: format!("invalid JWKS document: {e}"),
            })?;

            let keys: HashMap<_, _> = jwks
                .keys
                .iter()
                .filter(|jwk| jwk.key_use.as_deref().is_none_or(|u| u == "sig"))
                .filter_map(|jwk| {
                    jwk_to_decoding_key(jwk).map(|key| {
                        (
                            jwk.kid.clone().unwrap_or_else(|| ANONYMOUS_KID.to_string()),
                            Arc::new(key),
                        )
                    })
                })
                .collect();

            info!(url = %url, keys = keys.len(), "JWKS cache updated");
            entry.store(Arc::new(Some(CacheEntry {
                keys,
                fetched_at: Instant::now(),
            })));
            Ok(())
        });

        let shared_fut = fut.shared();
        *inflight_guard = Some(shared_fut.clone());
        drop(inflight_guard);

        let result = shared_fut.await;
        self.inflight.lock().await.take();
        result
    }
}

fn jwk_to_decoding_key(jwk: &Jwk) -> Option<DecodingKey> {
    match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk.n.as_ref()?;
            let e = jwk.e.as_ref()?;

            // 2048-bit modulus is 342 base64url characters
            if n.len() < 340 {
                warn!(kid = ?jwk.kid, "RSA key too small, rejecting");
                return None;
            }
            DecodingKey::from_rsa_components(n, e).ok()
        }
        "EC" => {
            let x = jwk.x.as_ref()?;
            let y = jwk.y.as_ref()?;
            let crv = jwk.crv.as_deref().unwrap_or("P-256");
            if !matches!(crv, "P-256" | "P-384") {
                warn!(kid = ?jwk.kid, crv = %crv, "Unsupported EC curve, rejecting");
                return None;
            }
            DecodingKey::from_ec_components(x, y).ok()
        }
        other => {
            warn!(kty = %other, "Unsupported key type");
            None
        }
    }
}
