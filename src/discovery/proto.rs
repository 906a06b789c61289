//! Discovery wire messages.
//!
//! The envelope (`DiscoveryRequest` / `DiscoveryResponse`) follows the xDS
//! field layout. Resources travel as `google.protobuf.Any`, one entity per
//! `Any`, with the type URL naming the resource type.

use std::collections::HashMap;

use thiserror::Error;

use crate::subscription::model::{
    Api, Application, ApplicationKeyMapping, AuthScheme, Burst, ClientCertificate, KeyType, Policy,
    PolicyKind, Quota, QuotaType, Subscription, SubscriptionState, TimeUnit, UrlMapping,
};
use crate::subscription::SubscriptionEvent;

/// Full gRPC path of the aggregated discovery stream.
pub const STREAM_RESOURCES_PATH: &str = "/enforcer.discovery.v1.AggregatedDiscoveryService/StreamResources";

/// Full gRPC path where replicas report their throttle counts.
pub const PUBLISH_THROTTLE_EVENTS_PATH: &str = "/enforcer.discovery.v1.ThrottleEventService/Publish";

const TYPE_PREFIX: &str = "type.googleapis.com/enforcer.discovery.v1.";

/// Resource type URLs.
pub mod type_url {
    pub const KEY_MANAGER: &str = "type.googleapis.com/enforcer.discovery.v1.KeyManager";
    pub const API: &str = "type.googleapis.com/enforcer.discovery.v1.Api";
    pub const APPLICATION: &str = "type.googleapis.com/enforcer.discovery.v1.Application";
    pub const SUBSCRIPTION: &str = "type.googleapis.com/enforcer.discovery.v1.Subscription";
    pub const KEY_MAPPING: &str = "type.googleapis.com/enforcer.discovery.v1.ApplicationKeyMapping";
    pub const APPLICATION_POLICY: &str = "type.googleapis.com/enforcer.discovery.v1.ApplicationPolicy";
    pub const SUBSCRIPTION_POLICY: &str = "type.googleapis.com/enforcer.discovery.v1.SubscriptionPolicy";
    pub const API_POLICY: &str = "type.googleapis.com/enforcer.discovery.v1.ApiPolicy";
    pub const SUBSCRIPTION_EVENT: &str = "type.googleapis.com/enforcer.discovery.v1.SubscriptionEvent";
    pub const REVOKED_TOKEN: &str = "type.googleapis.com/enforcer.discovery.v1.RevokedToken";
    pub const THROTTLE_DATA: &str = "type.googleapis.com/enforcer.discovery.v1.ThrottleData";
    pub const THROTTLE_EVENT: &str = "type.googleapis.com/enforcer.discovery.v1.ThrottleEvent";
}

/// Short resource name of a type URL, for logs and metric labels.
pub fn short_type_name(type_url: &str) -> &str {
    type_url.strip_prefix(TYPE_PREFIX).unwrap_or(type_url)
}

/// Identity of this enforcer towards the control plane.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Node {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub cluster: String,
}

/// `google.rpc.Status` subset carried by a nack.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Status {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DiscoveryRequest {
    #[prost(string, tag = "1")]
    pub version_info: String,
    #[prost(message, optional, tag = "2")]
    pub node: Option<Node>,
    #[prost(string, repeated, tag = "3")]
    pub resource_names: Vec<String>,
    #[prost(string, tag = "4")]
    pub type_url: String,
    #[prost(string, tag = "5")]
    pub response_nonce: String,
    #[prost(message, optional, tag = "6")]
    pub error_detail: Option<Status>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DiscoveryResponse {
    #[prost(string, tag = "1")]
    pub version_info: String,
    #[prost(message, repeated, tag = "2")]
    pub resources: Vec<prost_types::Any>,
    #[prost(bool, tag = "3")]
    pub canary: bool,
    #[prost(string, tag = "4")]
    pub type_url: String,
    #[prost(string, tag = "5")]
    pub nonce: String,
}

/// A resource that does not map onto the local model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceError {
    #[error("Resource type mismatch: expected {expected}, got {actual}")]
    UnexpectedType { expected: String, actual: String },

    #[error("Failed to decode {type_url}: {reason}")]
    Decode { type_url: String, reason: String },

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

fn invalid(field: &'static str) -> impl FnOnce(String) -> ResourceError {
    move |reason| ResourceError::InvalidField { field, reason }
}

/// Decode every `Any` of a response as `T`.
pub fn decode_resources<T>(response: &DiscoveryResponse, expected: &str) -> Result<Vec<T>, ResourceError>
where
    T: prost::Message + Default,
{
    response
        .resources
        .iter()
        .map(|any| {
            if any.type_url != expected {
                return Err(ResourceError::UnexpectedType {
                    expected: expected.to_string(),
                    actual: any.type_url.clone(),
                });
            }
            T::decode(any.value.as_slice()).map_err(|e| ResourceError::Decode {
                type_url: expected.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Wrap a message as an `Any` of the given type.
pub fn to_any<T: prost::Message>(type_url: &str, message: &T) -> prost_types::Any {
    prost_types::Any {
        type_url: type_url.to_string(),
        value: message.encode_to_vec(),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UrlMappingResource {
    #[prost(string, tag = "1")]
    pub http_method: String,
    #[prost(string, tag = "2")]
    pub url_pattern: String,
    #[prost(string, repeated, tag = "3")]
    pub scopes: Vec<String>,
    #[prost(string, tag = "4")]
    pub throttling_policy: String,
    #[prost(string, tag = "5")]
    pub auth_scheme: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientCertificateResource {
    #[prost(string, tag = "1")]
    pub alias: String,
    #[prost(string, tag = "2")]
    pub tier: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ApiResource {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub uuid: String,
    #[prost(string, tag = "3")]
    pub provider: String,
    #[prost(string, tag = "4")]
    pub name: String,
    #[prost(string, tag = "5")]
    pub version: String,
    #[prost(string, tag = "6")]
    pub context: String,
    #[prost(string, tag = "7")]
    pub tenant_domain: String,
    #[prost(string, tag = "8")]
    pub policy: String,
    #[prost(string, tag = "9")]
    pub lifecycle_state: String,
    #[prost(string, tag = "10")]
    pub api_type: String,
    #[prost(message, repeated, tag = "11")]
    pub url_mappings: Vec<UrlMappingResource>,
    #[prost(message, repeated, tag = "12")]
    pub client_certificates: Vec<ClientCertificateResource>,
}

impl TryFrom<ApiResource> for Api {
    type Error = ResourceError;

    fn try_from(r: ApiResource) -> Result<Self, Self::Error> {
        if r.context.is_empty() {
            return Err(ResourceError::InvalidField {
                field: "api.context",
                reason: format!("empty context for API {}", r.uuid),
            });
        }
        let url_mappings = r
            .url_mappings
            .into_iter()
            .map(|m| {
                Ok(UrlMapping {
                    http_method: m.http_method,
                    url_pattern: m.url_pattern,
                    scopes: m.scopes,
                    throttling_policy: non_empty(m.throttling_policy),
                    auth_scheme: m.auth_scheme.parse::<AuthScheme>().map_err(invalid("url_mapping.auth_scheme"))?,
                })
            })
            .collect::<Result<Vec<_>, ResourceError>>()?;

        Ok(Api {
            id: r.id,
            uuid: r.uuid,
            provider: r.provider,
            name: r.name,
            version: r.version,
            context: r.context,
            tenant_domain: r.tenant_domain,
            policy: non_empty(r.policy),
            lifecycle_state: r.lifecycle_state,
            api_type: r.api_type,
            url_mappings,
            client_certificates: r
                .client_certificates
                .into_iter()
                .map(|c| ClientCertificate {
                    alias: c.alias,
                    tier: c.tier,
                })
                .collect(),
        })
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ApplicationResource {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub uuid: String,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub owner: String,
    #[prost(string, tag = "5")]
    pub policy: String,
    #[prost(string, tag = "6")]
    pub token_type: String,
    #[prost(map = "string, string", tag = "7")]
    pub attributes: HashMap<String, String>,
    #[prost(string, repeated, tag = "8")]
    pub group_ids: Vec<String>,
    #[prost(string, tag = "9")]
    pub tenant_domain: String,
}

impl From<ApplicationResource> for Application {
    fn from(r: ApplicationResource) -> Self {
        Application {
            id: r.id,
            uuid: r.uuid,
            name: r.name,
            owner: r.owner,
            policy: r.policy,
            token_type: r.token_type,
            attributes: r.attributes,
            group_ids: r.group_ids,
            tenant_domain: r.tenant_domain,
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct KeyMappingResource {
    #[prost(string, tag = "1")]
    pub consumer_key: String,
    #[prost(string, tag = "2")]
    pub key_manager: String,
    #[prost(uint64, tag = "3")]
    pub application_id: u64,
    #[prost(string, tag = "4")]
    pub key_type: String,
    #[prost(string, tag = "5")]
    pub state: String,
    #[prost(string, tag = "6")]
    pub tenant_domain: String,
}

impl TryFrom<KeyMappingResource> for ApplicationKeyMapping {
    type Error = ResourceError;

    fn try_from(r: KeyMappingResource) -> Result<Self, Self::Error> {
        let key_type = if r.key_type.is_empty() {
            KeyType::Production
        } else {
            r.key_type.parse().map_err(invalid("key_mapping.key_type"))?
        };
        Ok(ApplicationKeyMapping {
            consumer_key: r.consumer_key,
            key_manager: r.key_manager,
            application_id: r.application_id,
            key_type,
            state: r.state,
        })
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SubscriptionResource {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "2")]
    pub application_id: u64,
    #[prost(uint64, tag = "3")]
    pub api_id: u64,
    #[prost(string, tag = "4")]
    pub policy: String,
    #[prost(string, tag = "5")]
    pub state: String,
    #[prost(int64, tag = "6")]
    pub timestamp: i64,
    #[prost(string, tag = "7")]
    pub tenant_domain: String,
}

impl TryFrom<SubscriptionResource> for Subscription {
    type Error = ResourceError;

    fn try_from(r: SubscriptionResource) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: r.id,
            application_id: r.application_id,
            api_id: r.api_id,
            policy: r.policy,
            state: r.state.parse::<SubscriptionState>().map_err(invalid("subscription.state"))?,
            timestamp: r.timestamp,
        })
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PolicyResource {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub tenant_domain: String,
    /// `requestCount` or `bandwidth`
    #[prost(string, tag = "4")]
    pub quota_type: String,
    #[prost(uint64, tag = "5")]
    pub quota: u64,
    #[prost(uint32, tag = "6")]
    pub unit_time: u32,
    #[prost(string, tag = "7")]
    pub time_unit: String,
    #[prost(uint32, tag = "8")]
    pub rate_limit_count: u32,
    #[prost(string, tag = "9")]
    pub rate_limit_time_unit: String,
    #[prost(bool, tag = "10")]
    pub stop_on_quota_reach: bool,
    #[prost(uint32, tag = "11")]
    pub graphql_max_depth: u32,
    #[prost(uint32, tag = "12")]
    pub graphql_max_complexity: u32,
    /// `subscription`, `application` or `api`; only read from delta events
    #[prost(string, tag = "13")]
    pub kind: String,
}

/// Policy kind named by a delta event.
pub fn parse_policy_kind(raw: &str) -> Result<PolicyKind, ResourceError> {
    match raw.to_ascii_lowercase().as_str() {
        "subscription" => Ok(PolicyKind::Subscription),
        "application" => Ok(PolicyKind::Application),
        "api" => Ok(PolicyKind::Api),
        other => Err(ResourceError::InvalidField {
            field: "policy.kind",
            reason: format!("unknown policy kind: {other}"),
        }),
    }
}

impl PolicyResource {
    /// Convert into a policy of the given kind.
    ///
    /// Only subscription policies may continue past their quota; application
    /// and API policies always stop.
    pub fn into_policy(self, kind: PolicyKind) -> Result<Policy, ResourceError> {
        let quota_type = match self.quota_type.to_ascii_lowercase().as_str() {
            "" | "requestcount" | "request_count" => QuotaType::RequestCount,
            "bandwidth" => QuotaType::Bandwidth,
            other => {
                return Err(ResourceError::InvalidField {
                    field: "policy.quota_type",
                    reason: format!("unknown quota type: {other}"),
                });
            }
        };
        let time_unit = self.time_unit.parse::<TimeUnit>().map_err(invalid("policy.time_unit"))?;
        let burst = if kind == PolicyKind::Subscription && self.rate_limit_count > 0 {
            Some(Burst {
                limit: self.rate_limit_count,
                time_unit: self
                    .rate_limit_time_unit
                    .parse::<TimeUnit>()
                    .map_err(invalid("policy.rate_limit_time_unit"))?,
            })
        } else {
            None
        };

        Ok(Policy {
            id: self.id,
            name: self.name,
            tenant_domain: self.tenant_domain,
            kind,
            quota: Quota {
                quota_type,
                limit: self.quota,
                unit_time: self.unit_time,
                time_unit,
            },
            burst,
            stop_on_quota_reach: kind != PolicyKind::Subscription || self.stop_on_quota_reach,
            graphql_max_depth: self.graphql_max_depth,
            graphql_max_complexity: self.graphql_max_complexity,
        })
    }
}

/// Fine-grained change to one tenant's store.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SubscriptionEventResource {
    #[prost(string, tag = "1")]
    pub tenant_domain: String,
    #[prost(
        oneof = "subscription_event_resource::Event",
        tags = "2, 3, 4, 5, 6, 7, 8, 9, 10, 11"
    )]
    pub event: Option<subscription_event_resource::Event>,
}

pub mod subscription_event_resource {
    use super::{
        ApiResource, ApplicationResource, KeyMappingResource, PolicyResource, SubscriptionResource,
    };

    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Event {
        #[prost(message, tag = "2")]
        ApiUpserted(ApiResource),
        #[prost(uint64, tag = "3")]
        ApiRemoved(u64),
        #[prost(message, tag = "4")]
        ApplicationUpserted(ApplicationResource),
        #[prost(uint64, tag = "5")]
        ApplicationRemoved(u64),
        #[prost(message, tag = "6")]
        SubscriptionUpserted(SubscriptionResource),
        #[prost(message, tag = "7")]
        SubscriptionRemoved(SubscriptionResource),
        #[prost(message, tag = "8")]
        KeyMappingUpserted(KeyMappingResource),
        #[prost(message, tag = "9")]
        KeyMappingRemoved(KeyMappingResource),
        #[prost(message, tag = "10")]
        PolicyUpserted(PolicyResource),
        #[prost(message, tag = "11")]
        PolicyRemoved(PolicyResource),
    }
}

impl TryFrom<subscription_event_resource::Event> for SubscriptionEvent {
    type Error = ResourceError;

    fn try_from(event: subscription_event_resource::Event) -> Result<Self, Self::Error> {
        use subscription_event_resource::Event;

        Ok(match event {
            Event::ApiUpserted(api) => SubscriptionEvent::ApiUpserted(api.try_into()?),
            Event::ApiRemoved(id) => SubscriptionEvent::ApiRemoved { id },
            Event::ApplicationUpserted(app) => SubscriptionEvent::ApplicationUpserted(app.into()),
            Event::ApplicationRemoved(id) => SubscriptionEvent::ApplicationRemoved { id },
            Event::SubscriptionUpserted(sub) => SubscriptionEvent::SubscriptionUpserted(sub.try_into()?),
            Event::SubscriptionRemoved(sub) => SubscriptionEvent::SubscriptionRemoved {
                application_id: sub.application_id,
                api_id: sub.api_id,
            },
            Event::KeyMappingUpserted(mapping) => SubscriptionEvent::KeyMappingUpserted(mapping.try_into()?),
            Event::KeyMappingRemoved(mapping) => SubscriptionEvent::KeyMappingRemoved {
                consumer_key: mapping.consumer_key,
                key_manager: mapping.key_manager,
            },
            Event::PolicyUpserted(policy) => {
                let kind = parse_policy_kind(&policy.kind)?;
                SubscriptionEvent::PolicyUpserted(policy.into_policy(kind)?)
            }
            Event::PolicyRemoved(policy) => SubscriptionEvent::PolicyRemoved {
                kind: parse_policy_kind(&policy.kind)?,
                name: policy.name,
            },
        })
    }
}

/// Trusted token issuer pushed by the control plane.
#[derive(Clone, PartialEq, prost::Message)]
pub struct KeyManagerResource {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub issuer: String,
    /// PEM certificate, used when no JWKS endpoint is set
    #[prost(string, tag = "3")]
    pub certificate: String,
    #[prost(string, tag = "4")]
    pub jwks_url: String,
    #[prost(string, tag = "5")]
    pub consumer_key_claim: String,
    #[prost(string, tag = "6")]
    pub scopes_claim: String,
    #[prost(bool, tag = "7")]
    pub enabled: bool,
    #[prost(map = "string, string", tag = "8")]
    pub claim_mappings: HashMap<String, String>,
    #[prost(string, tag = "9")]
    pub tenant_domain: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RevokedTokenResource {
    #[prost(string, tag = "1")]
    pub jti: String,
    /// Epoch seconds after which the entry can be forgotten
    #[prost(int64, tag = "2")]
    pub expiry_time: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BlockingConditionResource {
    /// `API`, `APPLICATION`, `USER`, `SUBSCRIPTION`, `IP` or `IPRANGE`
    #[prost(string, tag = "1")]
    pub condition_type: String,
    /// Condition value for non-IP conditions
    #[prost(string, tag = "2")]
    pub value: String,
    #[prost(string, tag = "3")]
    pub tenant_domain: String,
    #[prost(bool, tag = "4")]
    pub invert: bool,
    #[prost(string, tag = "5")]
    pub fixed_ip: String,
    #[prost(string, tag = "6")]
    pub starting_ip: String,
    #[prost(string, tag = "7")]
    pub ending_ip: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CustomPolicyResource {
    #[prost(string, tag = "1")]
    pub name: String,
    /// Key template such as `$userId:$apiContext`
    #[prost(string, tag = "2")]
    pub key_template: String,
    #[prost(uint64, tag = "3")]
    pub limit: u64,
    #[prost(uint32, tag = "4")]
    pub unit_time: u32,
    #[prost(string, tag = "5")]
    pub time_unit: String,
    #[prost(string, tag = "6")]
    pub tenant_domain: String,
}

/// Blocking conditions and custom policies, delivered as one resource.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ThrottleDataResource {
    #[prost(message, repeated, tag = "1")]
    pub blocking_conditions: Vec<BlockingConditionResource>,
    #[prost(message, repeated, tag = "2")]
    pub custom_policies: Vec<CustomPolicyResource>,
}

/// Counter delta or decision from a peer replica.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ThrottleEventResource {
    #[prost(string, tag = "1")]
    pub throttle_key: String,
    /// Requests or bytes counted by the peer since its last event
    #[prost(uint64, tag = "2")]
    pub delta: u64,
    /// Epoch milliseconds at which the peer counted the delta
    #[prost(int64, tag = "3")]
    pub timestamp: i64,
    /// Whether the key is throttled cluster-wide
    #[prost(bool, tag = "4")]
    pub is_throttled: bool,
    /// Epoch milliseconds until which the key stays throttled
    #[prost(int64, tag = "5")]
    pub expiry_timestamp: i64,
    /// Node id of the replica that counted the delta
    #[prost(string, tag = "6")]
    pub origin: String,
}

/// Counts one replica reports in a single call.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ThrottleEventBatch {
    #[prost(message, repeated, tag = "1")]
    pub events: Vec<ThrottleEventResource>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PublishThrottleEventsResponse {}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}
