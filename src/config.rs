//! Type-Safe Configuration with Validation
//!
//! All settings come from `ENFORCER_*` environment variables (a `.env` file is honoured).
//! `Config::from_lookup` accepts any variable source so tests never touch the process environment.

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::auth::validators::ValidatorKind;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid URL format
    #[error("Invalid URL for {field}: {reason}")]
    InvalidUrl { field: String, reason: String },

    /// Invalid port number
    #[error("Invalid port: must be between 1 and 65535")]
    InvalidPort,

    /// Invalid duration value
    #[error("Invalid duration for {0}: must be greater than 0")]
    InvalidDuration(String),

    /// Missing required field
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    /// Environment variable parse error
    #[error("Failed to parse environment variable {name}: {reason}")]
    ParseError { name: String, reason: String },
}

/// Trusted token issuer (key manager).
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct IssuerConfig {
    /// Key manager name, joined with the consumer key to find a key mapping
    pub name: String,
    /// Expected `iss` claim
    pub issuer: String,
    /// Trust store alias holding the signing certificate
    #[serde(default)]
    pub certificate_alias: Option<String>,
    /// JWKS endpoint, used when no certificate alias is set
    #[serde(default)]
    pub jwks_url: Option<Url>,
    /// Claim carrying the consumer key
    #[serde(default = "default_consumer_key_claim")]
    pub consumer_key_claim: String,
    /// Claim carrying space separated scopes
    #[serde(default = "default_scopes_claim")]
    pub scopes_claim: String,
    /// Remote claim name to local claim name
    #[serde(default)]
    pub claim_mappings: HashMap<String, String>,
}

fn default_consumer_key_claim() -> String {
    "azp".to_string()
}

fn default_scopes_claim() -> String {
    "scope".to_string()
}

/// Discovery channel settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Control plane xDS endpoint
    pub control_plane_url: Url,
    /// Node identifier sent with every request
    pub node_id: String,
    /// Optional CA bundle for TLS to the control plane
    pub ca_cert_path: Option<PathBuf>,
    /// First reconnect delay
    pub initial_backoff: Duration,
    /// Reconnect delay ceiling
    pub max_backoff: Duration,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
    /// Age of the last ack after which sync is reported stale
    pub stale_after: Duration,
}

/// Authentication settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Validators enabled, in no particular order
    pub validators: Vec<ValidatorKind>,
    /// Trusted JWT issuers known at startup
    pub issuers: Vec<IssuerConfig>,
    /// Header carrying API keys
    pub api_key_header: String,
    /// Query parameter carrying API keys
    pub api_key_query_param: String,
    /// Trust store alias of the API key signing certificate
    pub api_key_certificate_alias: String,
    /// Header carrying internal test keys
    pub internal_key_header: String,
    /// Trust store alias of the internal key signing certificate
    pub internal_key_certificate_alias: String,
    /// Expected `aud` of internal keys, unchecked when unset
    pub internal_key_audience: Option<String>,
    /// How long fetched JWKS keys are trusted before a refresh
    pub jwks_cache_ttl: Duration,
    /// Header carrying a load-balancer forwarded client certificate
    pub client_certificate_header: String,
    /// Basic auth users: username to hex SHA-256 of the password
    pub basic_users: HashMap<String, String>,
    /// Tenant used when the API context carries none
    pub default_tenant: String,
}

/// Throttling settings.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Master switch
    pub enabled: bool,
    /// Fold peer throttle events into local counters
    pub peer_sync_enabled: bool,
    /// Counters idle longer than this are pruned
    pub counter_idle_timeout: Duration,
    /// How often idle counters are pruned
    pub prune_interval: Duration,
    /// Outbound throttle events buffered before new ones are dropped
    pub event_queue_capacity: usize,
    /// Most events sent to peers in one batch
    pub event_batch_size: usize,
    /// Longest an event waits before its batch is sent
    pub event_flush_interval: Duration,
}

/// Backend token settings.
#[derive(Debug, Clone)]
pub struct BackendJwtConfig {
    /// Issue backend tokens at all
    pub enabled: bool,
    /// Header the data plane attaches the token to
    pub header_name: String,
    /// `iss` claim
    pub issuer: String,
    /// `aud` claim
    pub audience: Vec<String>,
    /// Signing algorithm (`RS256` or `NONE`)
    pub algorithm: String,
    /// Token lifetime when caching is disabled
    pub expiry: Duration,
    /// Cache issued tokens
    pub cache_enabled: bool,
    /// Token lifetime when caching is enabled
    pub cache_expiry: Duration,
    /// Most tokens cached at once
    pub cache_capacity: usize,
    /// Prefix for enforcer claims
    pub claim_dialect: String,
    /// Claims never copied from the caller's token
    pub restricted_claims: Vec<String>,
    /// Deny the request instead of forwarding without a token on signing failure
    pub fail_on_signing_error: bool,
}

/// Key material locations.
#[derive(Debug, Clone, Default)]
pub struct KeystoreConfig {
    /// Directory of PEM certificates, alias = file stem
    pub trust_store_dir: Option<PathBuf>,
    /// PKCS#8 PEM private key used for backend tokens
    pub signing_key_path: Option<PathBuf>,
    /// PEM certificate matching the signing key
    pub signing_cert_path: Option<PathBuf>,
}

/// Service configuration with validation.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port (1-65535)
    pub port: u16,
    /// Per-request decision deadline
    pub request_deadline: Duration,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_seconds: u64,
    /// OTLP endpoint URL
    pub otlp_endpoint: Url,
    /// Bound of the per-tenant pending subscription queue
    pub pending_subscription_capacity: usize,
    /// Discovery settings
    pub discovery: DiscoveryConfig,
    /// Authentication settings
    pub auth: AuthConfig,
    /// Throttling settings
    pub throttle: ThrottleConfig,
    /// Backend token settings
    pub backend_jwt: BackendJwtConfig,
    /// Key material locations
    pub keystore: KeystoreConfig,
}

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

impl Config {
    /// Loads configuration from environment variables with validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(&|name: &str| env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let issuers = match lookup("ENFORCER_JWT_ISSUERS") {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError {
                name: "ENFORCER_JWT_ISSUERS".to_string(),
                reason: e.to_string(),
            })?,
            None => Vec::new(),
        };

        let validators = match lookup("ENFORCER_VALIDATORS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<ValidatorKind>().map_err(|e| ConfigError::ParseError {
                        name: "ENFORCER_VALIDATORS".to_string(),
                        reason: e,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => ValidatorKind::ALL.to_vec(),
        };

        let config = Self {
            host: lookup("ENFORCER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_env(lookup, "ENFORCER_PORT", 8081)?,
            request_deadline: Duration::from_millis(parse_env(
                lookup,
                "ENFORCER_REQUEST_DEADLINE_MS",
                2000,
            )?),
            shutdown_timeout_seconds: parse_env(lookup, "ENFORCER_SHUTDOWN_TIMEOUT", 30)?,
            otlp_endpoint: parse_url_env(lookup, "ENFORCER_OTLP_ENDPOINT", "http://localhost:4317")?,
            pending_subscription_capacity: parse_env(lookup, "ENFORCER_PENDING_CAPACITY", 10_000)?,
            discovery: DiscoveryConfig {
                control_plane_url: parse_url_env(
                    lookup,
                    "ENFORCER_XDS_URL",
                    "http://localhost:18000",
                )?,
                node_id: lookup("ENFORCER_NODE_ID").unwrap_or_else(|| "enforcer".to_string()),
                ca_cert_path: lookup("ENFORCER_XDS_CA_CERT").map(PathBuf::from),
                initial_backoff: Duration::from_millis(parse_env(
                    lookup,
                    "ENFORCER_XDS_INITIAL_BACKOFF_MS",
                    500,
                )?),
                max_backoff: Duration::from_secs(parse_env(lookup, "ENFORCER_XDS_MAX_BACKOFF", 60)?),
                backoff_multiplier: parse_env(lookup, "ENFORCER_XDS_BACKOFF_MULTIPLIER", 2.0)?,
                stale_after: Duration::from_secs(parse_env(lookup, "ENFORCER_XDS_STALE_AFTER", 300)?),
            },
            auth: AuthConfig {
                validators,
                issuers,
                api_key_header: lookup("ENFORCER_API_KEY_HEADER")
                    .unwrap_or_else(|| "apikey".to_string())
                    .to_lowercase(),
                api_key_query_param: lookup("ENFORCER_API_KEY_QUERY_PARAM")
                    .unwrap_or_else(|| "apikey".to_string()),
                api_key_certificate_alias: lookup("ENFORCER_API_KEY_CERT_ALIAS")
                    .unwrap_or_else(|| "apikey".to_string()),
                internal_key_header: lookup("ENFORCER_INTERNAL_KEY_HEADER")
                    .unwrap_or_else(|| "internal-key".to_string())
                    .to_lowercase(),
                internal_key_certificate_alias: lookup("ENFORCER_INTERNAL_KEY_CERT_ALIAS")
                    .unwrap_or_else(|| "internal".to_string()),
                internal_key_audience: lookup("ENFORCER_INTERNAL_KEY_AUDIENCE"),
                jwks_cache_ttl: Duration::from_secs(parse_env(lookup, "ENFORCER_JWKS_CACHE_TTL", 3600)?),
                client_certificate_header: lookup("ENFORCER_CLIENT_CERT_HEADER")
                    .unwrap_or_else(|| "x-client-certificate".to_string())
                    .to_lowercase(),
                basic_users: parse_map_env(lookup, "ENFORCER_BASIC_USERS"),
                default_tenant: lookup("ENFORCER_DEFAULT_TENANT")
                    .unwrap_or_else(|| "carbon.super".to_string()),
            },
            throttle: ThrottleConfig {
                enabled: parse_env(lookup, "ENFORCER_THROTTLE_ENABLED", true)?,
                peer_sync_enabled: parse_env(lookup, "ENFORCER_THROTTLE_PEER_SYNC", true)?,
                counter_idle_timeout: Duration::from_secs(parse_env(
                    lookup,
                    "ENFORCER_THROTTLE_IDLE_TIMEOUT",
                    3600,
                )?),
                prune_interval: Duration::from_secs(parse_env(
                    lookup,
                    "ENFORCER_THROTTLE_PRUNE_INTERVAL",
                    300,
                )?),
                event_queue_capacity: parse_env(lookup, "ENFORCER_THROTTLE_EVENT_QUEUE", 10_000)?,
                event_batch_size: parse_env(lookup, "ENFORCER_THROTTLE_EVENT_BATCH", 500)?,
                event_flush_interval: Duration::from_millis(parse_env(
                    lookup,
                    "ENFORCER_THROTTLE_EVENT_FLUSH_MS",
                    500,
                )?),
            },
            backend_jwt: BackendJwtConfig {
                enabled: parse_env(lookup, "ENFORCER_BACKEND_JWT_ENABLED", false)?,
                header_name: lookup("ENFORCER_BACKEND_JWT_HEADER")
                    .unwrap_or_else(|| "X-JWT-Assertion".to_string()),
                issuer: lookup("ENFORCER_BACKEND_JWT_ISSUER")
                    .unwrap_or_else(|| "gateway-enforcer".to_string()),
                audience: parse_list_env(lookup, "ENFORCER_BACKEND_JWT_AUDIENCE"),
                algorithm: lookup("ENFORCER_BACKEND_JWT_ALGORITHM")
                    .unwrap_or_else(|| "RS256".to_string()),
                expiry: Duration::from_secs(parse_env(lookup, "ENFORCER_BACKEND_JWT_EXPIRY", 3600)?),
                cache_enabled: parse_env(lookup, "ENFORCER_BACKEND_JWT_CACHE", true)?,
                cache_expiry: Duration::from_secs(parse_env(
                    lookup,
                    "ENFORCER_BACKEND_JWT_CACHE_EXPIRY",
                    900,
                )?),
                cache_capacity: parse_env(lookup, "ENFORCER_BACKEND_JWT_CACHE_CAPACITY", 10_000)?,
                claim_dialect: lookup("ENFORCER_BACKEND_JWT_DIALECT")
                    .unwrap_or_else(|| "http://wso2.org/claims".to_string()),
                restricted_claims: parse_list_env(lookup, "ENFORCER_BACKEND_JWT_RESTRICTED_CLAIMS"),
                fail_on_signing_error: parse_env(
                    lookup,
                    "ENFORCER_BACKEND_JWT_FAIL_ON_SIGNING_ERROR",
                    false,
                )?,
            },
            keystore: KeystoreConfig {
                trust_store_dir: lookup("ENFORCER_TRUST_STORE_DIR").map(PathBuf::from),
                signing_key_path: lookup("ENFORCER_SIGNING_KEY").map(PathBuf::from),
                signing_cert_path: lookup("ENFORCER_SIGNING_CERT").map(PathBuf::from),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.request_deadline.is_zero() {
            return Err(ConfigError::InvalidDuration(
                "ENFORCER_REQUEST_DEADLINE_MS".to_string(),
            ));
        }
        if self.discovery.initial_backoff.is_zero() || self.discovery.max_backoff.is_zero() {
            return Err(ConfigError::InvalidDuration("ENFORCER_XDS_*_BACKOFF".to_string()));
        }
        if self.discovery.backoff_multiplier < 1.0 {
            return Err(ConfigError::ParseError {
                name: "ENFORCER_XDS_BACKOFF_MULTIPLIER".to_string(),
                reason: "multiplier must be at least 1.0".to_string(),
            });
        }
        if self.throttle.event_queue_capacity == 0 || self.throttle.event_batch_size == 0 {
            return Err(ConfigError::ParseError {
                name: "ENFORCER_THROTTLE_EVENT_*".to_string(),
                reason: "queue capacity and batch size must be greater than 0".to_string(),
            });
        }
        if self.throttle.event_flush_interval.is_zero() {
            return Err(ConfigError::InvalidDuration(
                "ENFORCER_THROTTLE_EVENT_FLUSH_MS".to_string(),
            ));
        }
        if self.auth.validators.is_empty() {
            return Err(ConfigError::MissingRequired("ENFORCER_VALIDATORS".to_string()));
        }
        if self.backend_jwt.enabled
            && !self.backend_jwt.algorithm.eq_ignore_ascii_case("NONE")
            && self.keystore.signing_key_path.is_none()
        {
            return Err(ConfigError::MissingRequired("ENFORCER_SIGNING_KEY".to_string()));
        }
        if self.backend_jwt.enabled && self.backend_jwt.expiry.is_zero() {
            return Err(ConfigError::InvalidDuration(
                "ENFORCER_BACKEND_JWT_EXPIRY".to_string(),
            ));
        }
        Ok(())
    }

    /// Socket address string for the decision server.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Gets the OTLP endpoint URL as a string.
    #[must_use]
    pub fn otlp_endpoint_str(&self) -> &str {
        self.otlp_endpoint.as_str()
    }
}

/// Parse an environment variable with a default value.
fn parse_env<T: std::str::FromStr>(lookup: Lookup<'_>, name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(val) => val.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            name: name.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Parse a URL environment variable with a default value.
fn parse_url_env(lookup: Lookup<'_>, name: &str, default: &str) -> Result<Url, ConfigError> {
    let url_str = lookup(name).unwrap_or_else(|| default.to_string());
    Url::parse(&url_str).map_err(|e| ConfigError::InvalidUrl {
        field: name.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a comma-separated list environment variable.
fn parse_list_env(lookup: Lookup<'_>, name: &str) -> Vec<String> {
    lookup(name)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Parse a comma-separated `key:value` list environment variable.
fn parse_map_env(lookup: Lookup<'_>, name: &str) -> HashMap<String, String> {
    parse_list_env(lookup, name)
        .into_iter()
        .filter_map(|pair| {
            pair.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_lowercase()))
        })
        .collect()
}
