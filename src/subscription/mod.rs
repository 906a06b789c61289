//! Subscription data store.
//!
//! Holds each tenant's APIs, applications, subscriptions, key mappings and
//! throttling policies as an immutable index that is swapped whole on every
//! update, so request-time lookups never take a lock.

pub mod events;
pub mod index;
pub mod model;
pub mod registry;
pub mod store;

pub use events::{SnapshotKind, StoreSnapshot, SubscriptionEvent};
pub use index::{IndexCounts, TenantIndex};
pub use model::{
    Api, ApiId, AppId, Application, ApplicationKeyMapping, AuthScheme, KeyType, Policy, PolicyKind,
    Quota, QuotaType, Subscription, SubscriptionState, TimeUnit, UrlMapping,
};
pub use registry::{Lookup, StoreRegistry};
pub use store::{ApplyOutcome, TenantStore};
