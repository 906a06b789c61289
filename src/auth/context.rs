//! Per-request authentication outcome.

use std::sync::Arc;

use super::claims::ClaimSet;
use super::validators::ValidatorKind;
use crate::subscription::model::UNLIMITED_TIER;
use crate::subscription::{Api, AppId, KeyType, UrlMapping};

/// User name of requests that skipped authentication.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Who is calling, through which application and subscription, and at what tiers.
#[derive(Debug, Clone)]
pub struct AuthenticationContext {
    /// False for anonymous access to prototyped APIs and open resources
    pub authenticated: bool,
    pub validator: Option<ValidatorKind>,
    pub username: String,
    /// Owner of the resolved application
    pub subscriber: Option<String>,
    pub application_id: Option<AppId>,
    pub application_uuid: Option<String>,
    pub application_name: Option<String>,
    pub application_tenant: Option<String>,
    pub application_tier: String,
    pub subscription_tier: String,
    pub api_tier: Option<String>,
    pub resource_tier: Option<String>,
    pub scopes: Vec<String>,
    pub key_type: KeyType,
    pub consumer_key: Option<String>,
    /// Some applicable quota counts bytes
    pub content_aware: bool,
    pub stop_on_quota_reach: bool,
    pub claims: ClaimSet,
    pub token_id: Option<String>,
    pub token_signature: Option<String>,
    pub token_issuer: Option<String>,
    pub token_expires_at: Option<i64>,
    pub api: Arc<Api>,
    pub resource: Option<UrlMapping>,
}

impl AuthenticationContext {
    /// Context of a request that needs no credentials.
    pub fn anonymous(api: Arc<Api>, resource: Option<UrlMapping>) -> Self {
        Self {
            authenticated: false,
            validator: None,
            username: ANONYMOUS_USER.to_string(),
            subscriber: None,
            application_id: None,
            application_uuid: None,
            application_name: None,
            application_tenant: None,
            application_tier: UNLIMITED_TIER.to_string(),
            subscription_tier: UNLIMITED_TIER.to_string(),
            api_tier: api.api_tier().map(str::to_string),
            resource_tier: resource.as_ref().and_then(|r| r.throttling_policy.clone()),
            scopes: Vec::new(),
            key_type: KeyType::Production,
            consumer_key: None,
            content_aware: false,
            stop_on_quota_reach: true,
            claims: ClaimSet::new(),
            token_id: None,
            token_signature: None,
            token_issuer: None,
            token_expires_at: None,
            api,
            resource,
        }
    }

    /// Tenant of the resolved application, falling back to the API's tenant.
    pub fn application_tenant_or_api(&self) -> &str {
        self.application_tenant
            .as_deref()
            .unwrap_or(self.api.tenant_domain.as_str())
    }
}
