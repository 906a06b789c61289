//! Where discovery responses land.
//!
//! A sink validates a whole response before applying any of it, so a nacked
//! response leaves local state untouched.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::proto::{
    decode_resources, type_url, ApiResource, ApplicationResource, BlockingConditionResource,
    CustomPolicyResource, DiscoveryResponse, KeyManagerResource, KeyMappingResource, PolicyResource,
    ResourceError, RevokedTokenResource, SubscriptionEventResource, SubscriptionResource, ThrottleDataResource,
    ThrottleEventResource,
};
use crate::auth::issuers::{IssuerRegistry, KeySource, TrustedIssuer};
use crate::auth::jwks::JwksCache;
use crate::auth::revocation::RevokedTokens;
use crate::keystore::TrustedCertificate;
use crate::subscription::{
    Api, Application, ApplicationKeyMapping, PolicyKind, SnapshotKind, StoreRegistry, StoreSnapshot, Subscription,
    SubscriptionEvent, TimeUnit,
};
use crate::throttle::{
    BlockingConditionType, BlockingConditions, CustomPolicy, IpCondition, PeerThrottleEvent, ThrottleData,
    ThrottleEngine,
};

/// Why a response was rejected.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("Response rejected: {0}")]
    Rejected(String),
}

/// Consumer of one resource type.
#[cfg_attr(test, mockall::automock)]
pub trait ResourceSink: Send + Sync {
    fn type_url(&self) -> &str;

    /// Apply a response. Returns the number of resources applied.
    fn apply(&self, response: &DiscoveryResponse) -> Result<usize, SinkError>;
}

/// Full-state snapshots of one subscription store collection.
pub struct StoreSink {
    kind: SnapshotKind,
    registry: Arc<StoreRegistry>,
    default_tenant: String,
}

impl StoreSink {
    pub fn new(kind: SnapshotKind, registry: Arc<StoreRegistry>, default_tenant: impl Into<String>) -> Self {
        Self {
            kind,
            registry,
            default_tenant: default_tenant.into(),
        }
    }

    /// One sink per snapshot collection.
    pub fn all(registry: &Arc<StoreRegistry>, default_tenant: &str) -> Vec<Self> {
        [
            SnapshotKind::Apis,
            SnapshotKind::Applications,
            SnapshotKind::Subscriptions,
            SnapshotKind::KeyMappings,
            SnapshotKind::Policies(PolicyKind::Subscription),
            SnapshotKind::Policies(PolicyKind::Application),
            SnapshotKind::Policies(PolicyKind::Api),
        ]
        .into_iter()
        .map(|kind| Self::new(kind, Arc::clone(registry), default_tenant))
        .collect()
    }

    fn snapshots(&self, response: &DiscoveryResponse) -> Result<(usize, HashMap<String, StoreSnapshot>), SinkError> {
        let expected = self.type_url();
        let tenant = |domain: &str| {
            if domain.is_empty() {
                self.default_tenant.clone()
            } else {
                domain.to_string()
            }
        };

        let total = response.resources.len();
        let per_tenant: HashMap<String, StoreSnapshot> = match self.kind {
            SnapshotKind::Apis => group(
                decode_resources::<ApiResource>(response, expected)?,
                |r| tenant(&r.tenant_domain),
                Api::try_from,
            )?
            .into_iter()
            .map(|(t, items)| (t, StoreSnapshot::Apis(items)))
            .collect(),
            SnapshotKind::Applications => group(
                decode_resources::<ApplicationResource>(response, expected)?,
                |r| tenant(&r.tenant_domain),
                |r| Ok(Application::from(r)),
            )?
            .into_iter()
            .map(|(t, items)| (t, StoreSnapshot::Applications(items)))
            .collect(),
            SnapshotKind::Subscriptions => group(
                decode_resources::<SubscriptionResource>(response, expected)?,
                |r| tenant(&r.tenant_domain),
                Subscription::try_from,
            )?
            .into_iter()
            .map(|(t, items)| (t, StoreSnapshot::Subscriptions(items)))
            .collect(),
            SnapshotKind::KeyMappings => group(
                decode_resources::<KeyMappingResource>(response, expected)?,
                |r| tenant(&r.tenant_domain),
                ApplicationKeyMapping::try_from,
            )?
            .into_iter()
            .map(|(t, items)| (t, StoreSnapshot::KeyMappings(items)))
            .collect(),
            SnapshotKind::Policies(kind) => group(
                decode_resources::<PolicyResource>(response, expected)?,
                |r| tenant(&r.tenant_domain),
                |r| r.into_policy(kind),
            )?
            .into_iter()
            .map(|(t, items)| (t, StoreSnapshot::Policies(kind, items)))
            .collect(),
        };
        Ok((total, per_tenant))
    }
}

fn group<R, T>(
    resources: Vec<R>,
    tenant_of: impl Fn(&R) -> String,
    convert: impl Fn(R) -> Result<T, ResourceError>,
) -> Result<HashMap<String, Vec<T>>, ResourceError> {
    let mut grouped: HashMap<String, Vec<T>> = HashMap::new();
    for resource in resources {
        let tenant = tenant_of(&resource);
        grouped.entry(tenant).or_default().push(convert(resource)?);
    }
    Ok(grouped)
}

impl ResourceSink for StoreSink {
    fn type_url(&self) -> &str {
        match self.kind {
            SnapshotKind::Apis => type_url::API,
            SnapshotKind::Applications => type_url::APPLICATION,
            SnapshotKind::Subscriptions => type_url::SUBSCRIPTION,
            SnapshotKind::KeyMappings => type_url::KEY_MAPPING,
            SnapshotKind::Policies(PolicyKind::Subscription) => type_url::SUBSCRIPTION_POLICY,
            SnapshotKind::Policies(PolicyKind::Application) => type_url::APPLICATION_POLICY,
            SnapshotKind::Policies(PolicyKind::Api) => type_url::API_POLICY,
        }
    }

    fn apply(&self, response: &DiscoveryResponse) -> Result<usize, SinkError> {
        let (total, per_tenant) = self.snapshots(response)?;
        let outcomes = self.registry.apply_snapshot(self.kind, per_tenant);
        for (tenant, outcome) in outcomes {
            if outcome.evicted > 0 {
                warn!(tenant = %tenant, evicted = outcome.evicted, "Pending subscriptions evicted");
            }
            debug!(tenant = %tenant, resolved = outcome.resolved, pending = outcome.pending, "Snapshot applied");
        }
        Ok(total)
    }
}

/// Fine-grained subscription store changes.
pub struct SubscriptionEventSink {
    registry: Arc<StoreRegistry>,
    default_tenant: String,
}

impl SubscriptionEventSink {
    pub fn new(registry: Arc<StoreRegistry>, default_tenant: impl Into<String>) -> Self {
        Self {
            registry,
            default_tenant: default_tenant.into(),
        }
    }
}

impl ResourceSink for SubscriptionEventSink {
    fn type_url(&self) -> &str {
        type_url::SUBSCRIPTION_EVENT
    }

    fn apply(&self, response: &DiscoveryResponse) -> Result<usize, SinkError> {
        let events = decode_resources::<SubscriptionEventResource>(response, type_url::SUBSCRIPTION_EVENT)?
            .into_iter()
            .map(|resource| {
                let event = resource
                    .event
                    .ok_or_else(|| SinkError::Rejected("subscription event without payload".to_string()))?;
                let tenant = if resource.tenant_domain.is_empty() {
                    self.default_tenant.clone()
                } else {
                    resource.tenant_domain
                };
                Ok((tenant, SubscriptionEvent::try_from(event)?))
            })
            .collect::<Result<Vec<_>, SinkError>>()?;

        let applied = events.len();
        for (tenant, event) in events {
            let kind = event.kind();
            let outcome = self.registry.apply_event(&tenant, event);
            if outcome.stale {
                debug!(tenant = %tenant, event = kind, "Ignored stale subscription event");
            }
            if outcome.evicted > 0 {
                warn!(tenant = %tenant, evicted = outcome.evicted, "Pending subscriptions evicted");
            }
        }
        Ok(applied)
    }
}

/// Issuers discovered from the control plane's key managers.
pub struct KeyManagerSink {
    issuers: Arc<IssuerRegistry>,
    jwks_ttl: Duration,
    http_client: reqwest::Client,
}

impl KeyManagerSink {
    pub fn new(issuers: Arc<IssuerRegistry>, jwks_ttl: Duration, http_client: reqwest::Client) -> Self {
        Self {
            issuers,
            jwks_ttl,
            http_client,
        }
    }

    fn issuer(&self, resource: KeyManagerResource) -> Result<TrustedIssuer, ResourceError> {
        let key_source = if !resource.jwks_url.is_empty() {
            let url = Url::parse(&resource.jwks_url).map_err(|e| ResourceError::InvalidField {
                field: "key_manager.jwks_url",
                reason: e.to_string(),
            })?;
            KeySource::Jwks(Arc::new(JwksCache::new(url, self.jwks_ttl, self.http_client.clone())))
        } else if !resource.certificate.is_empty() {
            let cert = TrustedCertificate::from_pem(resource.name.clone(), resource.certificate.as_bytes())
                .map_err(|e| ResourceError::InvalidField {
                    field: "key_manager.certificate",
                    reason: e.to_string(),
                })?;
            KeySource::Certificate(Arc::new(cert))
        } else {
            return Err(ResourceError::InvalidField {
                field: "key_manager",
                reason: format!("{} has neither a JWKS URL nor a certificate", resource.name),
            });
        };

        Ok(TrustedIssuer {
            name: resource.name,
            issuer: resource.issuer,
            key_source,
            consumer_key_claim: or_default(resource.consumer_key_claim, "azp"),
            scopes_claim: or_default(resource.scopes_claim, "scope"),
            claim_mappings: resource.claim_mappings,
        })
    }
}

fn or_default(value: String, default: &str) -> String {
    if value.is_empty() { default.to_string() } else { value }
}

impl ResourceSink for KeyManagerSink {
    fn type_url(&self) -> &str {
        type_url::KEY_MANAGER
    }

    fn apply(&self, response: &DiscoveryResponse) -> Result<usize, SinkError> {
        let issuers = decode_resources::<KeyManagerResource>(response, type_url::KEY_MANAGER)?
            .into_iter()
            .filter(|resource| resource.enabled)
            .map(|resource| self.issuer(resource))
            .collect::<Result<Vec<_>, _>>()?;
        let applied = issuers.len();
        self.issuers.replace_discovered(issuers);
        Ok(applied)
    }
}

/// Revoked token identifiers.
pub struct RevokedTokenSink {
    revoked: Arc<RevokedTokens>,
}

impl RevokedTokenSink {
    pub fn new(revoked: Arc<RevokedTokens>) -> Self {
        Self { revoked }
    }
}

impl ResourceSink for RevokedTokenSink {
    fn type_url(&self) -> &str {
        type_url::REVOKED_TOKEN
    }

    fn apply(&self, response: &DiscoveryResponse) -> Result<usize, SinkError> {
        let entries = decode_resources::<RevokedTokenResource>(response, type_url::REVOKED_TOKEN)?;
        let applied = entries.len();
        self.revoked
            .replace(entries.into_iter().map(|e| (e.jti, e.expiry_time)), Utc::now().timestamp());
        Ok(applied)
    }
}

/// Blocking conditions and custom policies.
///
/// Malformed entries are skipped with a warning; one bad condition should
/// not keep the rest from being enforced.
pub struct ThrottleDataSink {
    engine: Arc<ThrottleEngine>,
}

impl ThrottleDataSink {
    pub fn new(engine: Arc<ThrottleEngine>) -> Self {
        Self { engine }
    }
}

fn insert_blocking(conditions: &mut BlockingConditions, resource: BlockingConditionResource) -> Result<(), String> {
    let kind = resource.condition_type.parse::<BlockingConditionType>()?;
    let parse_ip = |raw: &str| raw.trim().parse::<IpAddr>().map_err(|e| format!("{raw}: {e}"));
    match kind {
        BlockingConditionType::Ip => {
            let ip = parse_ip(&resource.fixed_ip)?;
            conditions.insert_ip(resource.tenant_domain, IpCondition::fixed(ip, resource.invert));
        }
        BlockingConditionType::IpRange => {
            let condition = IpCondition {
                start: parse_ip(&resource.starting_ip)?,
                end: parse_ip(&resource.ending_ip)?,
                invert: resource.invert,
            };
            conditions.insert_ip(resource.tenant_domain, condition);
        }
        kind => {
            if resource.value.is_empty() {
                return Err(format!("{kind:?} condition without a value"));
            }
            conditions.insert_value(kind, resource.value);
        }
    }
    Ok(())
}

fn custom_policy(resource: CustomPolicyResource) -> Result<CustomPolicy, String> {
    let unit = resource
        .time_unit
        .parse::<TimeUnit>()?
        .duration();
    if resource.key_template.is_empty() {
        return Err(format!("custom policy {} has an empty key template", resource.name));
    }
    Ok(CustomPolicy {
        name: resource.name,
        key_template: resource.key_template,
        limit: resource.limit,
        window: unit * resource.unit_time.max(1),
        tenant_domain: resource.tenant_domain,
    })
}

impl ResourceSink for ThrottleDataSink {
    fn type_url(&self) -> &str {
        type_url::THROTTLE_DATA
    }

    fn apply(&self, response: &DiscoveryResponse) -> Result<usize, SinkError> {
        let resources = decode_resources::<ThrottleDataResource>(response, type_url::THROTTLE_DATA)?;
        let mut data = ThrottleData::default();
        for resource in resources {
            for condition in resource.blocking_conditions {
                if let Err(reason) = insert_blocking(&mut data.blocking, condition) {
                    warn!(reason = %reason, "Skipping malformed blocking condition");
                }
            }
            for policy in resource.custom_policies {
                match custom_policy(policy) {
                    Ok(policy) => data.custom_policies.push(policy),
                    Err(reason) => warn!(reason = %reason, "Skipping malformed custom policy"),
                }
            }
        }
        let applied = data.blocking.len() + data.custom_policies.len();
        self.engine.replace_throttle_data(data);
        Ok(applied)
    }
}

/// Counter deltas and decisions from peer replicas.
pub struct ThrottleEventSink {
    engine: Arc<ThrottleEngine>,
    node_id: String,
}

impl ThrottleEventSink {
    /// `node_id` identifies this replica; its own counts echoed back are skipped.
    pub fn new(engine: Arc<ThrottleEngine>, node_id: impl Into<String>) -> Self {
        Self {
            engine,
            node_id: node_id.into(),
        }
    }
}

impl ResourceSink for ThrottleEventSink {
    fn type_url(&self) -> &str {
        type_url::THROTTLE_EVENT
    }

    fn apply(&self, response: &DiscoveryResponse) -> Result<usize, SinkError> {
        let events = decode_resources::<ThrottleEventResource>(response, type_url::THROTTLE_EVENT)?;
        let applied = events.len();
        for event in events {
            if event.throttle_key.is_empty() {
                continue;
            }
            let own = !event.origin.is_empty() && event.origin == self.node_id;
            if own && !event.is_throttled {
                continue;
            }
            self.engine.apply_peer_event(PeerThrottleEvent {
                key: event.throttle_key,
                delta: if own { 0 } else { event.delta },
                timestamp_ms: event.timestamp,
                throttled_until_ms: event.is_throttled.then_some(event.expiry_timestamp),
            });
        }
        Ok(applied)
    }
}
