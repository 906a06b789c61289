//! Inputs that mutate a tenant store.

use super::model::{
    Api, ApiId, AppId, Application, ApplicationKeyMapping, Policy, PolicyKind, Subscription,
};

/// Fine-grained steady-state change.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    ApiUpserted(Api),
    ApiRemoved { id: ApiId },
    ApplicationUpserted(Application),
    ApplicationRemoved { id: AppId },
    SubscriptionUpserted(Subscription),
    SubscriptionRemoved { application_id: AppId, api_id: ApiId },
    KeyMappingUpserted(ApplicationKeyMapping),
    KeyMappingRemoved { consumer_key: String, key_manager: String },
    PolicyUpserted(Policy),
    PolicyRemoved { kind: PolicyKind, name: String },
}

impl SubscriptionEvent {
    /// Short name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ApiUpserted(_) => "api_upserted",
            Self::ApiRemoved { .. } => "api_removed",
            Self::ApplicationUpserted(_) => "application_upserted",
            Self::ApplicationRemoved { .. } => "application_removed",
            Self::SubscriptionUpserted(_) => "subscription_upserted",
            Self::SubscriptionRemoved { .. } => "subscription_removed",
            Self::KeyMappingUpserted(_) => "key_mapping_upserted",
            Self::KeyMappingRemoved { .. } => "key_mapping_removed",
            Self::PolicyUpserted(_) => "policy_upserted",
            Self::PolicyRemoved { .. } => "policy_removed",
        }
    }
}

/// Full replacement of one entity collection of a tenant.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreSnapshot {
    Apis(Vec<Api>),
    Applications(Vec<Application>),
    Subscriptions(Vec<Subscription>),
    KeyMappings(Vec<ApplicationKeyMapping>),
    Policies(PolicyKind, Vec<Policy>),
}

/// Collection a snapshot replaces, used to track readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotKind {
    Apis,
    Applications,
    Subscriptions,
    KeyMappings,
    Policies(PolicyKind),
}

impl SnapshotKind {
    /// Bit recorded once the collection has been loaded.
    pub(crate) fn bit(&self) -> u8 {
        match self {
            Self::Apis => 1,
            Self::Applications => 1 << 1,
            Self::Subscriptions => 1 << 2,
            Self::KeyMappings => 1 << 3,
            Self::Policies(PolicyKind::Subscription) => 1 << 4,
            Self::Policies(PolicyKind::Application) => 1 << 5,
            Self::Policies(PolicyKind::Api) => 1 << 6,
        }
    }

    /// Snapshot clearing the collection.
    pub fn empty_snapshot(&self) -> StoreSnapshot {
        match self {
            Self::Apis => StoreSnapshot::Apis(Vec::new()),
            Self::Applications => StoreSnapshot::Applications(Vec::new()),
            Self::Subscriptions => StoreSnapshot::Subscriptions(Vec::new()),
            Self::KeyMappings => StoreSnapshot::KeyMappings(Vec::new()),
            Self::Policies(kind) => StoreSnapshot::Policies(*kind, Vec::new()),
        }
    }
}

impl StoreSnapshot {
    /// Collection this snapshot replaces.
    pub fn kind(&self) -> SnapshotKind {
        match self {
            Self::Apis(_) => SnapshotKind::Apis,
            Self::Applications(_) => SnapshotKind::Applications,
            Self::Subscriptions(_) => SnapshotKind::Subscriptions,
            Self::KeyMappings(_) => SnapshotKind::KeyMappings,
            Self::Policies(kind, _) => SnapshotKind::Policies(*kind),
        }
    }

}
