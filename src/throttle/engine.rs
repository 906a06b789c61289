//! Throttling engine.
//!
//! Keys are evaluated in a fixed order: custom policies, API, resource,
//! application, subscription. The first denial wins and hands back what the
//! earlier levels counted. Admitted counts are queued for peer replicas, and
//! peer counts are folded into the local counters as they arrive.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use super::blocking::{BlockingSubject, KeyVariables, ThrottleData};
use super::counter::{Admission, CounterLimit, CounterTable, retry_after};
use super::keys::{ThrottleKey, ThrottleLevel};
use super::publisher::ThrottleEventQueue;
use crate::auth::AuthenticationContext;
use crate::config::ThrottleConfig;
use crate::discovery::channel::SyncHealth;
use crate::discovery::proto::type_url;
use crate::error::EnforcerError;
use crate::observability::EnforcerMetrics;
use crate::shutdown::ShutdownSignal;
use crate::subscription::{Policy, StoreRegistry};

/// What the engine needs to know about one request.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleRequest<'a> {
    pub auth: &'a AuthenticationContext,
    pub client_ip: Option<IpAddr>,
    /// Request payload bytes, counted by bandwidth quotas
    pub payload_size: u64,
}

/// Counter update or cluster-wide decision exchanged between replicas.
///
/// An event with a non-zero `delta` and no decision only carries a count. An
/// event without a delta is a decision: `Some` throttles the key cluster-wide
/// until then, `None` lifts it.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerThrottleEvent {
    pub key: String,
    pub delta: u64,
    pub timestamp_ms: i64,
    pub throttled_until_ms: Option<i64>,
}

/// A key to check and the quota it is checked against.
#[derive(Debug, Clone)]
struct Check {
    key: ThrottleKey,
    limit: CounterLimit,
    content_aware: bool,
}

/// Admission control over local counters.
pub struct ThrottleEngine {
    config: ThrottleConfig,
    registry: Arc<StoreRegistry>,
    counters: CounterTable,
    remote_decisions: DashMap<String, i64>,
    data: ArcSwap<ThrottleData>,
    health: Option<Arc<SyncHealth>>,
    degraded: AtomicBool,
    metrics: Option<EnforcerMetrics>,
    events: Option<ThrottleEventQueue>,
}

impl ThrottleEngine {
    pub fn new(config: ThrottleConfig, registry: Arc<StoreRegistry>) -> Self {
        Self {
            config,
            registry,
            counters: CounterTable::new(),
            remote_decisions: DashMap::new(),
            data: ArcSwap::from_pointee(ThrottleData::default()),
            health: None,
            degraded: AtomicBool::new(false),
            metrics: None,
            events: None,
        }
    }

    /// Watch the peer event stream's health to detect degraded mode.
    #[must_use]
    pub fn with_health(mut self, health: Arc<SyncHealth>) -> Self {
        self.health = Some(health);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: EnforcerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Report admitted counts to peer replicas through `queue`.
    #[must_use]
    pub fn with_event_queue(mut self, queue: ThrottleEventQueue) -> Self {
        self.events = Some(queue);
        self
    }

    /// Swap in blocking conditions and custom policies.
    pub fn replace_throttle_data(&self, data: ThrottleData) {
        info!(
            blocking_conditions = data.blocking.len(),
            custom_policies = data.custom_policies.len(),
            "Throttle data updated"
        );
        self.data.store(Arc::new(data));
    }

    pub fn throttle_data(&self) -> Arc<ThrottleData> {
        self.data.load_full()
    }

    /// Fold a peer event into local state.
    pub fn apply_peer_event(&self, event: PeerThrottleEvent) {
        if !self.config.peer_sync_enabled {
            return;
        }
        if event.delta > 0 {
            self.counters.add_peer_delta(&event.key, event.delta, event.timestamp_ms);
            if event.throttled_until_ms.is_none() {
                return;
            }
        }
        match event.throttled_until_ms {
            Some(until) => {
                self.remote_decisions
                    .entry(event.key)
                    .and_modify(|current| *current = (*current).max(until))
                    .or_insert(until);
            }
            None => {
                self.remote_decisions.remove(&event.key);
            }
        }
    }

    /// Admit or deny a request.
    pub fn check(&self, request: &ThrottleRequest<'_>) -> Result<(), EnforcerError> {
        self.check_at(request, Utc::now().timestamp_millis())
    }

    #[instrument(skip_all, fields(api = %request.auth.api.display_key()))]
    pub fn check_at(&self, request: &ThrottleRequest<'_>, now_ms: i64) -> Result<(), EnforcerError> {
        if !self.config.enabled {
            return Ok(());
        }
        self.refresh_degraded();

        let data = self.data.load();
        if let Some(condition) = data.blocking.matching(&blocking_subject(request)) {
            debug!(condition = %condition, "Request matched a blocking condition");
            return Err(EnforcerError::RequestBlocked { condition });
        }

        // Counts are only kept when every level admits the request.
        let mut admitted: Vec<(String, Admission)> = Vec::new();
        for check in self.checks(request, &data) {
            let amount = if check.content_aware {
                request.payload_size
            } else {
                1
            };
            let outcome = match self.remote_decision(&check.key.key, now_ms) {
                Some(until) => Err(retry_after(until, now_ms)),
                None => self.counters.acquire(&check.key.key, check.limit, amount, now_ms),
            };
            match outcome {
                Ok(admission) => admitted.push((check.key.key, admission)),
                Err(retry_after) => {
                    for (key, admission) in admitted {
                        self.counters.release(&key, admission);
                    }
                    return Err(self.deny(check.key, retry_after));
                }
            }
        }

        self.report(admitted, now_ms);
        Ok(())
    }

    fn report(&self, admitted: Vec<(String, Admission)>, now_ms: i64) {
        let Some(queue) = &self.events else { return };
        if !self.config.peer_sync_enabled {
            return;
        }
        for (key, admission) in admitted {
            if admission.amount == 0 {
                continue;
            }
            queue.push(PeerThrottleEvent {
                key,
                delta: admission.amount,
                timestamp_ms: now_ms,
                throttled_until_ms: None,
            });
        }
    }

    /// Drop idle counters and lapsed peer decisions.
    pub fn prune_idle(&self) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        self.remote_decisions.retain(|_, until| *until > now_ms);
        let removed = self.counters.prune_idle(self.config.counter_idle_timeout, now_ms);
        if removed > 0 {
            debug!(removed, remaining = self.counters.len(), "Pruned idle throttle counters");
        }
        removed
    }

    /// Prune on the configured interval until shutdown.
    pub async fn run_pruner(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let mut interval = tokio::time::interval(self.config.prune_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.prune_idle();
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    pub fn counters(&self) -> &CounterTable {
        &self.counters
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn deny(&self, key: ThrottleKey, retry_after: std::time::Duration) -> EnforcerError {
        debug!(level = %key.level, key = %key.key, ?retry_after, "Request throttled");
        if let Some(metrics) = &self.metrics {
            metrics.record_throttle_denial(key.level.as_str());
        }
        EnforcerError::Throttled {
            level: key.level,
            key: key.key,
            retry_after,
        }
    }

    fn remote_decision(&self, key: &str, now_ms: i64) -> Option<i64> {
        let until = *self.remote_decisions.get(key)?;
        if until > now_ms {
            Some(until)
        } else {
            self.remote_decisions.remove_if(key, |_, v| *v <= now_ms);
            None
        }
    }

    fn refresh_degraded(&self) {
        let Some(health) = &self.health else { return };
        if !self.config.peer_sync_enabled {
            return;
        }
        let connected = health.is_connected(type_url::THROTTLE_EVENT);
        let was_degraded = self.degraded.swap(!connected, Ordering::Relaxed);
        if was_degraded == connected {
            if connected {
                info!("Peer throttle stream restored, cluster-wide counts in effect");
            } else {
                warn!("Peer throttle stream unavailable, enforcing local counts only");
            }
            if let Some(metrics) = &self.metrics {
                metrics.set_degraded("throttle", !connected);
            }
        }
    }

    /// Every key that applies to the request, in precedence order.
    fn checks(&self, request: &ThrottleRequest<'_>, data: &ThrottleData) -> Vec<Check> {
        let auth = request.auth;
        let api = &auth.api;
        let tenant = api.tenant_domain.as_str();
        let mut checks = Vec::new();

        if !data.custom_policies.is_empty() {
            let vars = KeyVariables {
                user_id: auth.username.clone(),
                api_context: api.context.clone(),
                api_version: api.version.clone(),
                app_tenant: auth.application_tenant_or_api().to_string(),
                api_tenant: tenant.to_string(),
                app_id: auth.application_id.map(|id| id.to_string()).unwrap_or_default(),
                client_ip: request.client_ip.map(|ip| ip.to_string()).unwrap_or_default(),
            };
            for policy in data.custom_policies.iter().filter(|p| p.applies_to(tenant)) {
                checks.push(Check {
                    key: ThrottleKey::custom(policy.expand(&vars)),
                    limit: policy.limit(),
                    content_aware: false,
                });
            }
        }

        let store = self.registry.tenant(tenant);
        let api_policy = |name: &str| store.as_ref().and_then(|s| s.api_policy(name));

        // An API level tier replaces the resource tiers of that API.
        match auth.api_tier.as_deref() {
            Some(tier) => {
                if let Some(policy) = api_policy(tier) {
                    push_policy(&mut checks, ThrottleKey::api(&api.context, &api.version), &policy, true);
                }
            }
            None => {
                let resource = auth.resource.as_ref();
                if let (Some(resource), Some(tier)) = (resource, auth.resource_tier.as_deref()) {
                    if let Some(policy) = api_policy(tier) {
                        let key = ThrottleKey::resource(
                            &api.context,
                            &api.version,
                            &resource.url_pattern,
                            &resource.http_method,
                        );
                        push_policy(&mut checks, key, &policy, true);
                    }
                }
            }
        }

        if let Some(application_id) = auth.application_id {
            let app_store = self.registry.tenant(auth.application_tenant_or_api());
            if let Some(policy) = app_store
                .as_ref()
                .and_then(|s| s.application_policy(&auth.application_tier))
            {
                push_policy(
                    &mut checks,
                    ThrottleKey::application(application_id, &auth.username),
                    &policy,
                    true,
                );
            }

            if let Some(policy) = store
                .as_ref()
                .and_then(|s| s.subscription_policy(&auth.subscription_tier))
            {
                let key = ThrottleKey::subscription(application_id, &api.context, &api.version);
                if let Some(burst) = policy.burst.filter(|b| b.limit > 0) {
                    checks.push(Check {
                        key: key.burst(),
                        limit: CounterLimit {
                            limit: u64::from(burst.limit),
                            window: burst.time_unit.duration(),
                            stop_on_quota_reach: false,
                        },
                        content_aware: false,
                    });
                }
                push_policy(&mut checks, key, &policy, policy.stop_on_quota_reach);
            }
        }

        checks
    }
}

impl std::fmt::Debug for ThrottleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleEngine")
            .field("enabled", &self.config.enabled)
            .field("counters", &self.counters.len())
            .field("degraded", &self.is_degraded())
            .finish_non_exhaustive()
    }
}

fn push_policy(checks: &mut Vec<Check>, key: ThrottleKey, policy: &Policy, stop_on_quota_reach: bool) {
    if policy.is_unlimited() {
        return;
    }
    checks.push(Check {
        key,
        limit: CounterLimit {
            limit: policy.quota.limit,
            window: policy.quota.window(),
            stop_on_quota_reach,
        },
        content_aware: policy.is_content_aware(),
    });
}

fn blocking_subject(request: &ThrottleRequest<'_>) -> BlockingSubject {
    let auth = request.auth;
    let application = match (&auth.subscriber, &auth.application_name) {
        (Some(subscriber), Some(name)) => Some(format!("{subscriber}:{name}")),
        _ => None,
    };
    let subscription = match (&auth.subscriber, &auth.application_name) {
        (Some(subscriber), Some(name)) => Some(format!(
            "{}:{}:{subscriber}-{name}:{}",
            auth.api.context,
            auth.api.version,
            auth.key_type.as_str()
        )),
        _ => None,
    };
    BlockingSubject {
        tenant: auth.api.tenant_domain.clone(),
        api_context: auth.api.context.clone(),
        application,
        user: auth.username.clone(),
        subscription,
        client_ip: request.client_ip,
    }
}
