//! Per-tenant store with lock-free readers.

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::events::{StoreSnapshot, SubscriptionEvent};
use super::index::TenantIndex;
use super::model::{
    Api, ApiId, AppId, Application, ApplicationKeyMapping, Policy, PolicyKind, Subscription,
    SubscriptionState,
};

/// Result of one write, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyOutcome {
    /// Pending subscriptions that resolved during this write
    pub resolved: usize,
    /// Pending subscriptions left after this write
    pub pending: usize,
    /// Pending subscriptions dropped because the queue was full
    pub evicted: usize,
    /// Whether the write was ignored as stale
    pub stale: bool,
}

/// Subscriptions waiting for their application or API to arrive.
#[derive(Debug)]
struct PendingQueue {
    entries: VecDeque<Subscription>,
    capacity: usize,
}

impl PendingQueue {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn remove(&mut self, application_id: AppId, api_id: ApiId) {
        self.entries
            .retain(|s| !(s.application_id == application_id && s.api_id == api_id));
    }

    /// Queue a subscription, replacing an older entry for the same pair.
    fn push(&mut self, tenant: &str, subscription: Subscription) -> usize {
        if let Some(existing) = self.entries.iter_mut().find(|s| {
            s.application_id == subscription.application_id && s.api_id == subscription.api_id
        }) {
            if existing.timestamp <= subscription.timestamp {
                *existing = subscription;
            }
            return 0;
        }

        let mut evicted = 0;
        while self.entries.len() >= self.capacity {
            if let Some(dropped) = self.entries.pop_front() {
                warn!(
                    tenant = %tenant,
                    application_id = dropped.application_id,
                    api_id = dropped.api_id,
                    capacity = self.capacity,
                    "Pending subscription queue full, evicting oldest entry"
                );
                evicted += 1;
            }
        }
        self.entries.push_back(subscription);
        evicted
    }
}

/// Materialized view of one tenant's control-plane state.
///
/// Reads load the current [`TenantIndex`] without locking. Writes serialize on
/// a mutex that also guards the pending subscription queue, build a new index
/// and publish it with a single pointer swap.
pub struct TenantStore {
    tenant: String,
    index: ArcSwap<TenantIndex>,
    pending: Mutex<PendingQueue>,
}

impl TenantStore {
    pub fn new(tenant: impl Into<String>, pending_capacity: usize) -> Self {
        Self {
            tenant: tenant.into(),
            index: ArcSwap::from_pointee(TenantIndex::default()),
            pending: Mutex::new(PendingQueue::new(pending_capacity)),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Current index. Holding it keeps one consistent version alive.
    pub fn snapshot(&self) -> Arc<TenantIndex> {
        self.index.load_full()
    }

    pub fn api_by_context(&self, context: &str, version: &str) -> Option<Arc<Api>> {
        self.index.load().api_by_context(context, version)
    }

    pub fn api_by_id(&self, id: ApiId) -> Option<Arc<Api>> {
        self.index.load().api(id)
    }

    pub fn application(&self, id: AppId) -> Option<Arc<Application>> {
        self.index.load().application(id)
    }

    pub fn application_by_uuid(&self, uuid: &str) -> Option<Arc<Application>> {
        self.index.load().application_by_uuid(uuid)
    }

    pub fn key_mapping(&self, consumer_key: &str, key_manager: &str) -> Option<Arc<ApplicationKeyMapping>> {
        self.index.load().key_mapping(consumer_key, key_manager)
    }

    pub fn subscription(&self, application_id: AppId, api_id: ApiId) -> Option<Arc<Subscription>> {
        self.index.load().subscription(application_id, api_id)
    }

    pub fn subscription_policy(&self, name: &str) -> Option<Arc<Policy>> {
        self.index.load().policy(PolicyKind::Subscription, name)
    }

    pub fn application_policy(&self, name: &str) -> Option<Arc<Policy>> {
        self.index.load().policy(PolicyKind::Application, name)
    }

    pub fn api_policy(&self, name: &str) -> Option<Arc<Policy>> {
        self.index.load().policy(PolicyKind::Api, name)
    }

    /// Subscriptions waiting for a missing application or API.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().entries.len()
    }

    /// Applications whose name contains `name_fragment` and whose UUID equals `uuid`.
    ///
    /// A `None` filter matches everything.
    pub fn matching_applications(&self, name_fragment: Option<&str>, uuid: Option<&str>) -> Vec<Arc<Application>> {
        let index = self.index.load();
        let needle = name_fragment.map(str::to_lowercase);
        let mut matches: Vec<_> = index
            .applications
            .values()
            .filter(|app| {
                needle
                    .as_deref()
                    .is_none_or(|n| app.name.to_lowercase().contains(n))
            })
            .filter(|app| uuid.is_none_or(|u| app.uuid == u))
            .cloned()
            .collect();
        matches.sort_by_key(|app| app.id);
        matches
    }

    /// Key mappings of the application with `application_uuid`, optionally narrowed by consumer key.
    pub fn matching_key_mappings(
        &self,
        application_uuid: Option<&str>,
        consumer_key: Option<&str>,
    ) -> Vec<Arc<ApplicationKeyMapping>> {
        let index = self.index.load();
        let app_id = match application_uuid {
            Some(uuid) => match index.app_by_uuid.get(uuid) {
                Some(id) => Some(*id),
                None => return Vec::new(),
            },
            None => None,
        };
        let mut matches: Vec<_> = index
            .key_mappings
            .values()
            .filter(|m| app_id.is_none_or(|id| m.application_id == id))
            .filter(|m| consumer_key.is_none_or(|k| m.consumer_key == k))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.consumer_key.cmp(&b.consumer_key));
        matches
    }

    /// Subscriptions filtered by application, API and state.
    pub fn matching_subscriptions(
        &self,
        application_id: Option<AppId>,
        api_id: Option<ApiId>,
        state: Option<SubscriptionState>,
    ) -> Vec<Arc<Subscription>> {
        let index = self.index.load();
        let mut matches: Vec<_> = index
            .subscriptions
            .values()
            .filter(|s| application_id.is_none_or(|id| s.application_id == id))
            .filter(|s| api_id.is_none_or(|id| s.api_id == id))
            .filter(|s| state.is_none_or(|st| s.state == st))
            .cloned()
            .collect();
        matches.sort_by_key(|s| (s.application_id, s.api_id));
        matches
    }

    /// Replace one entity collection.
    pub fn apply_snapshot(&self, snapshot: StoreSnapshot) -> ApplyOutcome {
        let mut pending = self.pending.lock();
        let mut next = TenantIndex::clone(&self.index.load());
        let mut outcome = ApplyOutcome::default();

        match snapshot {
            StoreSnapshot::Apis(apis) => {
                next.clear_apis();
                for api in apis {
                    next.insert_api(api);
                }
                outcome.evicted += self.park_orphans(&mut next, &mut pending);
            }
            StoreSnapshot::Applications(apps) => {
                next.clear_applications();
                for app in apps {
                    next.insert_application(app);
                }
                outcome.evicted += self.park_orphans(&mut next, &mut pending);
            }
            StoreSnapshot::Subscriptions(subscriptions) => {
                next.subscriptions.clear();
                pending.entries.clear();
                for subscription in subscriptions {
                    outcome.evicted += self.place_subscription(&mut next, &mut pending, subscription);
                }
            }
            StoreSnapshot::KeyMappings(mappings) => {
                next.key_mappings = mappings
                    .into_iter()
                    .map(|m| (m.key(), Arc::new(m)))
                    .collect();
            }
            StoreSnapshot::Policies(kind, policies) => {
                next.policies.retain(|(k, _), _| *k != kind);
                for policy in policies {
                    next.policies
                        .insert((kind, policy.name.clone()), Arc::new(policy));
                }
            }
        }

        outcome.resolved = Self::retry_pending(&mut next, &mut pending);
        outcome.pending = pending.entries.len();
        self.publish(next);
        debug!(
            tenant = %self.tenant,
            counts = ?self.index.load().counts(),
            pending = outcome.pending,
            "Applied snapshot"
        );
        outcome
    }

    /// Apply one fine-grained change.
    pub fn apply_event(&self, event: SubscriptionEvent) -> ApplyOutcome {
        let mut pending = self.pending.lock();
        let mut next = TenantIndex::clone(&self.index.load());
        let mut outcome = ApplyOutcome::default();

        match event {
            SubscriptionEvent::ApiUpserted(api) => next.insert_api(api),
            SubscriptionEvent::ApiRemoved { id } => {
                next.remove_api(id);
                pending.entries.retain(|s| s.api_id != id);
            }
            SubscriptionEvent::ApplicationUpserted(app) => next.insert_application(app),
            SubscriptionEvent::ApplicationRemoved { id } => {
                next.remove_application(id);
                pending.entries.retain(|s| s.application_id != id);
            }
            SubscriptionEvent::SubscriptionUpserted(subscription) => {
                let newer_stored = next
                    .subscription(subscription.application_id, subscription.api_id)
                    .is_some_and(|current| current.timestamp > subscription.timestamp);
                if newer_stored {
                    debug!(
                        tenant = %self.tenant,
                        application_id = subscription.application_id,
                        api_id = subscription.api_id,
                        "Ignoring stale subscription update"
                    );
                    outcome.stale = true;
                    outcome.pending = pending.entries.len();
                    return outcome;
                }
                outcome.evicted += self.place_subscription(&mut next, &mut pending, subscription);
            }
            SubscriptionEvent::SubscriptionRemoved {
                application_id,
                api_id,
            } => {
                next.subscriptions.remove(&(application_id, api_id));
                pending.remove(application_id, api_id);
            }
            SubscriptionEvent::KeyMappingUpserted(mapping) => {
                next.key_mappings.insert(mapping.key(), Arc::new(mapping));
            }
            SubscriptionEvent::KeyMappingRemoved {
                consumer_key,
                key_manager,
            } => {
                next.key_mappings.remove(&super::model::KeyMappingKey {
                    consumer_key,
                    key_manager,
                });
            }
            SubscriptionEvent::PolicyUpserted(policy) => {
                next.policies
                    .insert((policy.kind, policy.name.clone()), Arc::new(policy));
            }
            SubscriptionEvent::PolicyRemoved { kind, name } => {
                next.policies.remove(&(kind, name));
            }
        }

        outcome.resolved = Self::retry_pending(&mut next, &mut pending);
        outcome.pending = pending.entries.len();
        self.publish(next);
        outcome
    }

    fn publish(&self, next: TenantIndex) {
        self.index.store(Arc::new(next));
    }

    /// Insert a subscription if both ends exist, otherwise queue it.
    fn place_subscription(
        &self,
        next: &mut TenantIndex,
        pending: &mut PendingQueue,
        subscription: Subscription,
    ) -> usize {
        if next.resolves(&subscription) {
            pending.remove(subscription.application_id, subscription.api_id);
            next.subscriptions.insert(
                (subscription.application_id, subscription.api_id),
                Arc::new(subscription),
            );
            0
        } else {
            debug!(
                tenant = %self.tenant,
                application_id = subscription.application_id,
                api_id = subscription.api_id,
                "Subscription references unknown application or API, queued"
            );
            next.subscriptions
                .remove(&(subscription.application_id, subscription.api_id));
            pending.push(&self.tenant, subscription)
        }
    }

    /// Move subscriptions that lost their application or API back to pending.
    fn park_orphans(&self, next: &mut TenantIndex, pending: &mut PendingQueue) -> usize {
        next.retain_resolved_subscriptions()
            .into_iter()
            .map(|orphan| pending.push(&self.tenant, orphan))
            .sum()
    }

    fn retry_pending(next: &mut TenantIndex, pending: &mut PendingQueue) -> usize {
        let mut resolved = 0;
        let mut waiting = VecDeque::with_capacity(pending.entries.len());
        for subscription in pending.entries.drain(..) {
            if next.resolves(&subscription) {
                next.subscriptions.insert(
                    (subscription.application_id, subscription.api_id),
                    Arc::new(subscription),
                );
                resolved += 1;
            } else {
                waiting.push_back(subscription);
            }
        }
        pending.entries = waiting;
        resolved
    }
}

impl std::fmt::Debug for TenantStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantStore")
            .field("tenant", &self.tenant)
            .field("counts", &self.index.load().counts())
            .finish()
    }
}
