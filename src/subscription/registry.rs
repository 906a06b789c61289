//! Tenant to store mapping with lazy creation and readiness tracking.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::info;

use super::events::{SnapshotKind, StoreSnapshot, SubscriptionEvent};
use super::store::{ApplyOutcome, TenantStore};

/// Collections that must have been loaded before requests are served.
const REQUIRED_FOR_READY: [SnapshotKind; 4] = [
    SnapshotKind::Apis,
    SnapshotKind::Applications,
    SnapshotKind::Subscriptions,
    SnapshotKind::KeyMappings,
];

/// Lookup result that keeps "tenant not loaded" apart from "entity not found".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    /// No store exists for the tenant yet
    NotLoaded,
    /// The tenant is loaded but holds no such entity
    NotFound,
    Found(T),
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_not_loaded(&self) -> bool {
        matches!(self, Self::NotLoaded)
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::NotFound, Self::Found)
    }
}

/// All tenant stores of this enforcer.
pub struct StoreRegistry {
    tenants: ArcSwap<HashMap<String, Arc<TenantStore>>>,
    writer: Mutex<()>,
    loaded: AtomicU8,
    pending_capacity: usize,
}

impl StoreRegistry {
    pub fn new(pending_capacity: usize) -> Self {
        Self {
            tenants: ArcSwap::from_pointee(HashMap::new()),
            writer: Mutex::new(()),
            loaded: AtomicU8::new(0),
            pending_capacity,
        }
    }

    /// Store of a tenant, if one has been created.
    pub fn tenant(&self, tenant: &str) -> Option<Arc<TenantStore>> {
        self.tenants.load().get(tenant).cloned()
    }

    /// Run `f` against a tenant store, reporting an unknown tenant as not loaded.
    pub fn lookup<T>(&self, tenant: &str, f: impl FnOnce(&TenantStore) -> Option<T>) -> Lookup<T> {
        match self.tenants.load().get(tenant) {
            Some(store) => f(store).into(),
            None => Lookup::NotLoaded,
        }
    }

    pub fn get_or_create(&self, tenant: &str) -> Arc<TenantStore> {
        if let Some(store) = self.tenant(tenant) {
            return store;
        }
        let _guard = self.writer.lock();
        if let Some(store) = self.tenants.load().get(tenant) {
            return Arc::clone(store);
        }
        let store = Arc::new(TenantStore::new(tenant, self.pending_capacity));
        let mut next = HashMap::clone(&self.tenants.load());
        next.insert(tenant.to_string(), Arc::clone(&store));
        self.tenants.store(Arc::new(next));
        info!(tenant = %tenant, "Created tenant store");
        store
    }

    /// Tear down a tenant store. Returns whether one existed.
    pub fn undeploy(&self, tenant: &str) -> bool {
        let _guard = self.writer.lock();
        let current = self.tenants.load();
        if !current.contains_key(tenant) {
            return false;
        }
        let mut next = HashMap::clone(&current);
        next.remove(tenant);
        self.tenants.store(Arc::new(next));
        info!(tenant = %tenant, "Undeployed tenant store");
        true
    }

    /// Replace one collection across all tenants.
    ///
    /// Tenants present in the registry but absent from `per_tenant` have the
    /// collection cleared, since a snapshot is the full state of its type.
    pub fn apply_snapshot(
        &self,
        kind: SnapshotKind,
        per_tenant: HashMap<String, StoreSnapshot>,
    ) -> HashMap<String, ApplyOutcome> {
        let mut outcomes = HashMap::with_capacity(per_tenant.len());
        let untouched: Vec<String> = self
            .tenants
            .load()
            .keys()
            .filter(|t| !per_tenant.contains_key(*t))
            .cloned()
            .collect();

        for (tenant, snapshot) in per_tenant {
            let outcome = self.get_or_create(&tenant).apply_snapshot(snapshot);
            outcomes.insert(tenant, outcome);
        }
        for tenant in untouched {
            if let Some(store) = self.tenant(&tenant) {
                outcomes.insert(tenant, store.apply_snapshot(kind.empty_snapshot()));
            }
        }

        self.loaded.fetch_or(kind.bit(), Ordering::AcqRel);
        outcomes
    }

    pub fn apply_event(&self, tenant: &str, event: SubscriptionEvent) -> ApplyOutcome {
        self.get_or_create(tenant).apply_event(event)
    }

    /// Whether every required collection has been loaded at least once.
    pub fn is_ready(&self) -> bool {
        let loaded = self.loaded.load(Ordering::Acquire);
        REQUIRED_FOR_READY.iter().all(|kind| loaded & kind.bit() != 0)
    }

    pub fn tenant_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tenants.load().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("tenants", &self.tenant_names())
            .field("ready", &self.is_ready())
            .finish()
    }
}
