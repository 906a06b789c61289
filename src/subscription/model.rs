//! Control-plane entities cached by the subscription store.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Numeric API identifier.
pub type ApiId = u64;
/// Numeric application identifier.
pub type AppId = u64;

/// Policy name that never throttles.
pub const UNLIMITED_TIER: &str = "Unlimited";

/// Lifecycle state of an API that bypasses authentication.
pub const LIFECYCLE_PROTOTYPED: &str = "PROTOTYPED";
/// Lifecycle state of an API that rejects all calls.
pub const LIFECYCLE_BLOCKED: &str = "BLOCKED";

/// Authentication scheme declared by a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// Any enabled validator may authenticate
    #[default]
    Any,
    /// JWT / OAuth2 bearer tokens only
    Jwt,
    /// API keys only
    ApiKey,
    /// Mutual TLS only
    Mtls,
    /// Security disabled for the resource
    None,
}

impl FromStr for AuthScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "any" => Ok(Self::Any),
            "jwt" | "oauth2" => Ok(Self::Jwt),
            "api_key" | "apikey" => Ok(Self::ApiKey),
            "mtls" => Ok(Self::Mtls),
            "none" => Ok(Self::None),
            other => Err(format!("unknown auth scheme: {other}")),
        }
    }
}

/// One resource of an API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlMapping {
    /// HTTP method, `*` matches any
    pub http_method: String,
    /// Path pattern relative to the API context
    pub url_pattern: String,
    /// Scopes of which the caller needs at least one
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Resource level throttling policy
    #[serde(default)]
    pub throttling_policy: Option<String>,
    /// Accepted credential scheme
    #[serde(default)]
    pub auth_scheme: AuthScheme,
}

impl UrlMapping {
    /// Whether the mapping accepts the request method and relative path.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        (self.http_method == "*" || self.http_method.eq_ignore_ascii_case(method))
            && path_matches(&self.url_pattern, path)
    }
}

/// Client certificate alias allowed to call an API over mutual TLS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCertificate {
    /// Trust store alias
    pub alias: String,
    /// Throttling tier applied to callers presenting this certificate
    pub tier: String,
}

/// A published API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Api {
    pub id: ApiId,
    pub uuid: String,
    pub provider: String,
    pub name: String,
    pub version: String,
    pub context: String,
    pub tenant_domain: String,
    /// API level throttling tier
    #[serde(default)]
    pub policy: Option<String>,
    pub lifecycle_state: String,
    #[serde(default)]
    pub api_type: String,
    #[serde(default)]
    pub url_mappings: Vec<UrlMapping>,
    #[serde(default)]
    pub client_certificates: Vec<ClientCertificate>,
}

impl Api {
    /// First URL mapping accepting the request, with the path made relative to the context.
    pub fn match_resource(&self, method: &str, path: &str) -> Option<&UrlMapping> {
        let relative = self.relative_path(path);
        self.url_mappings.iter().find(|m| m.matches(method, relative))
    }

    /// `path` without query and context. The context only strips on a segment boundary.
    pub fn relative_path<'a>(&self, path: &'a str) -> &'a str {
        let path = path.split('?').next().unwrap_or(path);
        let context = self.context.trim_end_matches('/');
        let relative = path
            .strip_prefix(context)
            .filter(|rest| rest.is_empty() || rest.starts_with('/'))
            .unwrap_or(path);
        if relative.is_empty() { "/" } else { relative }
    }

    /// `context:version`, used in logs and throttle keys.
    pub fn display_key(&self) -> String {
        format!("{}:{}", self.context, self.version)
    }

    /// API level tier when one is set and is not unlimited.
    pub fn api_tier(&self) -> Option<&str> {
        self.policy
            .as_deref()
            .filter(|tier| !tier.is_empty() && *tier != UNLIMITED_TIER)
    }
}

/// A consumer application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: AppId,
    pub uuid: String,
    pub name: String,
    /// Subscriber that owns the application
    pub owner: String,
    pub policy: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub group_ids: Vec<String>,
    pub tenant_domain: String,
}

/// Key environment of a consumer key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyType {
    #[default]
    Production,
    Sandbox,
}

impl KeyType {
    /// Wire name used in tokens and headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "PRODUCTION",
            Self::Sandbox => "SANDBOX",
        }
    }
}

impl FromStr for KeyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PRODUCTION" => Ok(Self::Production),
            "SANDBOX" => Ok(Self::Sandbox),
            other => Err(format!("unknown key type: {other}")),
        }
    }
}

/// Join between a presented consumer key and an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationKeyMapping {
    pub consumer_key: String,
    pub key_manager: String,
    pub application_id: AppId,
    pub key_type: KeyType,
    #[serde(default)]
    pub state: String,
}

/// Lookup key of an application key mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyMappingKey {
    pub consumer_key: String,
    pub key_manager: String,
}

impl ApplicationKeyMapping {
    /// Lookup key of this mapping.
    pub fn key(&self) -> KeyMappingKey {
        KeyMappingKey {
            consumer_key: self.consumer_key.clone(),
            key_manager: self.key_manager.clone(),
        }
    }
}

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionState {
    /// Active
    Unblocked,
    Blocked,
    /// Blocked for production keys, sandbox keys still pass
    ProdOnlyBlocked,
    OnHold,
    Rejected,
    TierUpdatePending,
}

impl SubscriptionState {
    /// Wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unblocked => "UNBLOCKED",
            Self::Blocked => "BLOCKED",
            Self::ProdOnlyBlocked => "PROD_ONLY_BLOCKED",
            Self::OnHold => "ON_HOLD",
            Self::Rejected => "REJECTED",
            Self::TierUpdatePending => "TIER_UPDATE_PENDING",
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UNBLOCKED" | "ACTIVE" => Ok(Self::Unblocked),
            "BLOCKED" => Ok(Self::Blocked),
            "PROD_ONLY_BLOCKED" => Ok(Self::ProdOnlyBlocked),
            "ON_HOLD" => Ok(Self::OnHold),
            "REJECTED" => Ok(Self::Rejected),
            "TIER_UPDATE_PENDING" => Ok(Self::TierUpdatePending),
            other => Err(format!("unknown subscription state: {other}")),
        }
    }
}

/// Entitlement of an application to an API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: u64,
    pub application_id: AppId,
    pub api_id: ApiId,
    pub policy: String,
    pub state: SubscriptionState,
    /// Control-plane update time in epoch milliseconds
    pub timestamp: i64,
}

/// Which entity a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Subscription,
    Application,
    Api,
}

/// Unit of a quota window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Length of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            Self::Second => Duration::from_secs(1),
            Self::Minute => Duration::from_secs(60),
            Self::Hour => Duration::from_secs(3600),
            Self::Day => Duration::from_secs(86_400),
        }
    }
}

impl FromStr for TimeUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().trim_end_matches('s') {
            "sec" | "second" => Ok(Self::Second),
            "min" | "minute" => Ok(Self::Minute),
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            other => Err(format!("unknown time unit: {other}")),
        }
    }
}

/// What a quota counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaType {
    RequestCount,
    Bandwidth,
}

/// Amount allowed per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub quota_type: QuotaType,
    /// Requests, or bytes for bandwidth quotas
    pub limit: u64,
    pub unit_time: u32,
    pub time_unit: TimeUnit,
}

impl Quota {
    /// Length of the counting window.
    pub fn window(&self) -> Duration {
        self.time_unit.duration() * self.unit_time.max(1)
    }
}

/// Spike arrest limit of a subscription policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Burst {
    pub limit: u32,
    pub time_unit: TimeUnit,
}

/// Throttling policy, shared shape for all three kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: u64,
    pub name: String,
    pub tenant_domain: String,
    pub kind: PolicyKind,
    pub quota: Quota,
    /// Subscription policies only
    #[serde(default)]
    pub burst: Option<Burst>,
    /// Once exceeded, deny every request until the window ends
    #[serde(default = "default_stop_on_quota_reach")]
    pub stop_on_quota_reach: bool,
    #[serde(default)]
    pub graphql_max_depth: u32,
    #[serde(default)]
    pub graphql_max_complexity: u32,
}

fn default_stop_on_quota_reach() -> bool {
    true
}

impl Policy {
    /// Whether the quota is measured in bytes.
    pub fn is_content_aware(&self) -> bool {
        self.quota.quota_type == QuotaType::Bandwidth
    }

    /// Whether the policy is the reserved unlimited tier.
    pub fn is_unlimited(&self) -> bool {
        self.name == UNLIMITED_TIER
    }
}

/// Match a relative request path against a resource pattern.
///
/// `{param}` matches one segment, a trailing `/*` matches the rest of the path, and a single
/// trailing slash on either side is ignored.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    let pattern = pattern.trim();
    if pattern == "/*" || pattern == "*" {
        return true;
    }
    let pattern = pattern.strip_suffix('/').filter(|p| !p.is_empty()).unwrap_or(pattern);
    let path = path.strip_suffix('/').filter(|p| !p.is_empty()).unwrap_or(path);

    let mut pattern_segments = pattern.split('/');
    let mut path_segments = path.split('/');
    loop {
        match (pattern_segments.next(), path_segments.next()) {
            (Some("*"), _) => return true,
            (Some(p), Some(s)) => {
                let is_param = p.starts_with('{') && p.ends_with('}');
                if !is_param && !p.eq_ignore_ascii_case(s) {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}
