//! Enforcer wiring.
//!
//! Everything a decision needs is built once here and shared by reference;
//! nothing in the crate reaches for process-wide state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthPipeline, IssuerRegistry, RevokedTokens, TrustedIssuer, ValidatorDeps};
use crate::backend_jwt::{BackendTokenIssuer, SigningError};
use crate::config::Config;
use crate::discovery::proto::{short_type_name, type_url, Node};
use crate::discovery::{
    BackoffPolicy, DiscoveryChannel, DiscoveryTransport, KeyManagerSink, ResourceSink, RevokedTokenSink, StoreSink,
    SubscriptionEventSink, SubscriptionState, SyncHealth, ThrottleDataSink, ThrottleEventSink,
};
use crate::keystore::{Keystore, KeystoreError};
use crate::observability::EnforcerMetrics;
use crate::shutdown::ShutdownSignal;
use crate::subscription::StoreRegistry;
use crate::throttle::{
    PeerThrottleEvent, ThrottleEngine, ThrottleEventPublisher, ThrottleEventQueue, ThrottleEventTransport,
};

/// Cluster name reported to the control plane.
const NODE_CLUSTER: &str = "gateway-enforcer";

const STALENESS_CHECK_FLOOR: Duration = Duration::from_secs(5);

/// How often expired backend tokens are swept from the cache.
const TOKEN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Failures that stop the enforcer from starting.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Keystore(#[from] KeystoreError),

    #[error("Backend token signer unusable: {0}")]
    Signing(#[from] SigningError),

    #[error("Failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Shared state of one enforcer process.
pub struct EnforcerContext {
    pub config: Config,
    pub registry: Arc<StoreRegistry>,
    pub keystore: Arc<Keystore>,
    pub issuers: Arc<IssuerRegistry>,
    pub revoked: Arc<RevokedTokens>,
    pub pipeline: AuthPipeline,
    pub throttle: Arc<ThrottleEngine>,
    pub backend_jwt: Option<BackendTokenIssuer>,
    pub health: Arc<SyncHealth>,
    pub metrics: EnforcerMetrics,
    http_client: reqwest::Client,
    /// Outbound throttle events, until a publisher takes them
    throttle_events: Mutex<Option<mpsc::Receiver<PeerThrottleEvent>>>,
}

impl EnforcerContext {
    /// Build every component from configuration and loaded key material.
    ///
    /// A configured backend token signer is exercised once; a key that cannot
    /// sign fails startup.
    pub fn build(config: Config, keystore: Keystore, metrics: &prometheus::Registry) -> Result<Self, StartupError> {
        let metrics = EnforcerMetrics::new(metrics)?;
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        let registry = Arc::new(StoreRegistry::new(config.pending_subscription_capacity));
        let keystore = Arc::new(keystore);
        let issuers = Arc::new(IssuerRegistry::new(
            config
                .auth
                .issuers
                .iter()
                .map(|issuer| TrustedIssuer::from_config(issuer, config.auth.jwks_cache_ttl, &http_client))
                .collect(),
        ));
        let revoked = Arc::new(RevokedTokens::new());
        let deps = ValidatorDeps {
            keystore: Arc::clone(&keystore),
            issuers: Arc::clone(&issuers),
            revoked: Arc::clone(&revoked),
        };
        let pipeline = AuthPipeline::from_config(&config.auth, &deps, Arc::clone(&registry));

        let health = Arc::new(SyncHealth::new());
        let mut throttle = ThrottleEngine::new(config.throttle.clone(), Arc::clone(&registry))
            .with_health(Arc::clone(&health))
            .with_metrics(metrics.clone());
        let mut throttle_events = None;
        if config.throttle.enabled && config.throttle.peer_sync_enabled {
            let (queue, receiver) = ThrottleEventQueue::bounded(config.throttle.event_queue_capacity);
            throttle = throttle.with_event_queue(queue.with_metrics(metrics.clone()));
            throttle_events = Some(receiver);
        }
        let throttle = Arc::new(throttle);

        let backend_jwt = if config.backend_jwt.enabled {
            let issuer = BackendTokenIssuer::new(config.backend_jwt.clone(), keystore.signing_material().as_ref())?;
            issuer.self_test()?;
            Some(issuer)
        } else {
            None
        };

        info!(
            validators = ?pipeline.validator_kinds(),
            issuers = issuers.len(),
            trusted_certificates = keystore.trust_store().len(),
            backend_jwt = backend_jwt.is_some(),
            "Enforcer context built"
        );

        Ok(Self {
            config,
            registry,
            keystore,
            issuers,
            revoked,
            pipeline,
            throttle,
            backend_jwt,
            health,
            metrics,
            http_client,
            throttle_events: Mutex::new(throttle_events),
        })
    }

    /// One sink per resource type the enforcer subscribes to.
    pub fn sinks(&self) -> Vec<Arc<dyn ResourceSink>> {
        let tenant = self.config.auth.default_tenant.as_str();
        let mut sinks: Vec<Arc<dyn ResourceSink>> = StoreSink::all(&self.registry, tenant)
            .into_iter()
            .map(|sink| Arc::new(sink) as Arc<dyn ResourceSink>)
            .collect();
        sinks.push(Arc::new(SubscriptionEventSink::new(Arc::clone(&self.registry), tenant)));
        sinks.push(Arc::new(KeyManagerSink::new(
            Arc::clone(&self.issuers),
            self.config.auth.jwks_cache_ttl,
            self.http_client.clone(),
        )));
        sinks.push(Arc::new(RevokedTokenSink::new(Arc::clone(&self.revoked))));
        sinks.push(Arc::new(ThrottleDataSink::new(Arc::clone(&self.throttle))));
        if self.config.throttle.peer_sync_enabled {
            sinks.push(Arc::new(ThrottleEventSink::new(
                Arc::clone(&self.throttle),
                self.config.discovery.node_id.as_str(),
            )));
        }
        sinks
    }

    /// Discovery channels over a shared transport, one per sink.
    pub fn discovery_channels(&self, transport: Arc<dyn DiscoveryTransport>) -> Vec<DiscoveryChannel> {
        let node = Node {
            id: self.config.discovery.node_id.clone(),
            cluster: NODE_CLUSTER.to_string(),
        };
        let backoff = BackoffPolicy::from_config(&self.config.discovery);
        self.sinks()
            .into_iter()
            .map(|sink| {
                let subscription = SubscriptionState::new(sink.type_url(), node.clone());
                DiscoveryChannel::new(Arc::clone(&transport), subscription, sink, backoff.clone())
                    .with_health(Arc::clone(&self.health))
                    .with_metrics(self.metrics.clone())
            })
            .collect()
    }

    /// Take the outbound throttle event queue. `None` when peer sync is off or it was already taken.
    pub fn take_throttle_events(&self) -> Option<mpsc::Receiver<PeerThrottleEvent>> {
        self.throttle_events.lock().take()
    }

    /// Publisher draining the outbound throttle events onto `transport`.
    pub fn throttle_event_publisher(
        &self,
        transport: Arc<dyn ThrottleEventTransport>,
    ) -> Option<ThrottleEventPublisher> {
        let receiver = self.take_throttle_events()?;
        Some(
            ThrottleEventPublisher::new(
                receiver,
                transport,
                self.config.discovery.node_id.as_str(),
                &self.config.throttle,
            )
            .with_metrics(self.metrics.clone()),
        )
    }

    /// Sweep expired backend tokens from the cache until shutdown.
    pub async fn sweep_backend_tokens(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let Some(issuer) = &self.backend_jwt else { return };
        let mut interval = tokio::time::interval(TOKEN_SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = issuer.purge_cache(Utc::now().timestamp());
                    if removed > 0 {
                        debug!(removed, "Swept expired backend tokens");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    /// Reload the trust store and signing key. A failed reload keeps the old material.
    pub fn reload_keys(&self) {
        if let Err(e) = self.keystore.reload() {
            error!(error = %e, "Key material reload failed, keeping previous keys");
            return;
        }
        if let Some(issuer) = &self.backend_jwt {
            if let Err(e) = issuer.reload(self.keystore.signing_material().as_ref()) {
                error!(error = %e, "Backend token signer reload failed, keeping previous signer");
            }
        }
        info!(trusted_certificates = self.keystore.trust_store().len(), "Key material reloaded");
    }

    /// Warn about resource types whose last ack is older than the staleness bound.
    pub fn log_stale_sync(&self) -> Vec<String> {
        let stale = self.health.stale_types(self.config.discovery.stale_after);
        for stale_type in &stale {
            warn!(
                type_url = %short_type_name(stale_type),
                stale_after_secs = self.config.discovery.stale_after.as_secs(),
                "Discovery data is stale, serving from last known state"
            );
        }
        self.metrics
            .set_degraded("discovery", stale.iter().any(|t| t != type_url::THROTTLE_EVENT));
        stale
    }

    /// Periodically report stale discovery data until shutdown.
    pub async fn watch_sync_staleness(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let period = (self.config.discovery.stale_after / 2).max(STALENESS_CHECK_FLOOR);
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.log_stale_sync();
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}

impl std::fmt::Debug for EnforcerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnforcerContext")
            .field("registry", &self.registry)
            .field("pipeline", &self.pipeline)
            .field("throttle", &self.throttle)
            .field("backend_jwt", &self.backend_jwt)
            .finish_non_exhaustive()
    }
}
