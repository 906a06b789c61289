//! Immutable lookup tables for one tenant.
//!
//! A [`TenantIndex`] is never mutated once published. Writers clone the current
//! index, apply their change to the clone and swap it in as a whole, so readers
//! always see one consistent version.

use std::collections::HashMap;
use std::sync::Arc;

use super::model::{
    Api, ApiId, AppId, Application, ApplicationKeyMapping, KeyMappingKey, Policy, PolicyKind,
    Subscription,
};

/// Point lookup tables of a tenant.
#[derive(Debug, Clone, Default)]
pub struct TenantIndex {
    pub(crate) apis: HashMap<ApiId, Arc<Api>>,
    pub(crate) api_by_context: HashMap<(String, String), ApiId>,
    pub(crate) applications: HashMap<AppId, Arc<Application>>,
    pub(crate) app_by_uuid: HashMap<String, AppId>,
    pub(crate) key_mappings: HashMap<KeyMappingKey, Arc<ApplicationKeyMapping>>,
    pub(crate) subscriptions: HashMap<(AppId, ApiId), Arc<Subscription>>,
    pub(crate) policies: HashMap<(PolicyKind, String), Arc<Policy>>,
}

impl TenantIndex {
    pub fn api_by_context(&self, context: &str, version: &str) -> Option<Arc<Api>> {
        self.api_by_context
            .get(&(context.to_string(), version.to_string()))
            .and_then(|id| self.apis.get(id))
            .cloned()
    }

    pub fn api(&self, id: ApiId) -> Option<Arc<Api>> {
        self.apis.get(&id).cloned()
    }

    pub fn application(&self, id: AppId) -> Option<Arc<Application>> {
        self.applications.get(&id).cloned()
    }

    pub fn application_by_uuid(&self, uuid: &str) -> Option<Arc<Application>> {
        self.app_by_uuid
            .get(uuid)
            .and_then(|id| self.applications.get(id))
            .cloned()
    }

    pub fn key_mapping(&self, consumer_key: &str, key_manager: &str) -> Option<Arc<ApplicationKeyMapping>> {
        self.key_mappings
            .get(&KeyMappingKey {
                consumer_key: consumer_key.to_string(),
                key_manager: key_manager.to_string(),
            })
            .cloned()
    }

    pub fn subscription(&self, application_id: AppId, api_id: ApiId) -> Option<Arc<Subscription>> {
        self.subscriptions.get(&(application_id, api_id)).cloned()
    }

    pub fn policy(&self, kind: PolicyKind, name: &str) -> Option<Arc<Policy>> {
        self.policies.get(&(kind, name.to_string())).cloned()
    }

    /// Number of entries per table, for logs.
    pub fn counts(&self) -> IndexCounts {
        IndexCounts {
            apis: self.apis.len(),
            applications: self.applications.len(),
            subscriptions: self.subscriptions.len(),
            key_mappings: self.key_mappings.len(),
            policies: self.policies.len(),
        }
    }

    pub(crate) fn insert_api(&mut self, api: Api) {
        if let Some(previous) = self.apis.get(&api.id) {
            self.api_by_context
                .remove(&(previous.context.clone(), previous.version.clone()));
        }
        self.api_by_context
            .insert((api.context.clone(), api.version.clone()), api.id);
        self.apis.insert(api.id, Arc::new(api));
    }

    /// Remove an API and every subscription pointing at it.
    pub(crate) fn remove_api(&mut self, id: ApiId) -> Option<Arc<Api>> {
        let removed = self.apis.remove(&id)?;
        self.api_by_context
            .remove(&(removed.context.clone(), removed.version.clone()));
        self.subscriptions.retain(|(_, api_id), _| *api_id != id);
        Some(removed)
    }

    pub(crate) fn insert_application(&mut self, app: Application) {
        if let Some(previous) = self.applications.get(&app.id) {
            if previous.uuid != app.uuid {
                self.app_by_uuid.remove(&previous.uuid);
            }
        }
        self.app_by_uuid.insert(app.uuid.clone(), app.id);
        self.applications.insert(app.id, Arc::new(app));
    }

    /// Remove an application with its subscriptions and key mappings.
    pub(crate) fn remove_application(&mut self, id: AppId) -> Option<Arc<Application>> {
        let removed = self.applications.remove(&id)?;
        self.app_by_uuid.remove(&removed.uuid);
        self.subscriptions.retain(|(app_id, _), _| *app_id != id);
        self.key_mappings.retain(|_, mapping| mapping.application_id != id);
        Some(removed)
    }

    /// Whether both ends of the subscription are present.
    pub(crate) fn resolves(&self, subscription: &Subscription) -> bool {
        self.applications.contains_key(&subscription.application_id)
            && self.apis.contains_key(&subscription.api_id)
    }

    pub(crate) fn clear_apis(&mut self) {
        self.apis.clear();
        self.api_by_context.clear();
    }

    pub(crate) fn clear_applications(&mut self) {
        self.applications.clear();
        self.app_by_uuid.clear();
    }

    /// Drop subscriptions whose application or API is gone.
    pub(crate) fn retain_resolved_subscriptions(&mut self) -> Vec<Subscription> {
        let mut orphans = Vec::new();
        let apps = &self.applications;
        let apis = &self.apis;
        self.subscriptions.retain(|(app_id, api_id), subscription| {
            let keep = apps.contains_key(app_id) && apis.contains_key(api_id);
            if !keep {
                orphans.push(subscription.as_ref().clone());
            }
            keep
        });
        orphans
    }
}

/// Table sizes of a [`TenantIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexCounts {
    pub apis: usize,
    pub applications: usize,
    pub subscriptions: usize,
    pub key_mappings: usize,
    pub policies: usize,
}
