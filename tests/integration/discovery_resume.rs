//! Discovery Resume Integration Tests
//!
//! A scripted in-memory transport stands in for the control plane so the
//! channel's ack, nack, resume and reconnect behavior can be observed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use gateway_enforcer::discovery::channel::ResponseStream;
use gateway_enforcer::discovery::proto::{
    to_any, type_url, ApiResource, DiscoveryRequest, DiscoveryResponse, Node, UrlMappingResource,
};
use gateway_enforcer::discovery::{
    BackoffPolicy, DiscoveryChannel, DiscoveryError, DiscoveryTransport, StoreSink, SubscriptionState, SyncHealth,
};
use gateway_enforcer::shutdown::ShutdownCoordinator;
use gateway_enforcer::subscription::{SnapshotKind, StoreRegistry};

use crate::common::TENANT;

/// What the control plane does on one connection attempt.
enum Session {
    Refuse,
    /// Send these responses, then close the stream
    Respond(Vec<DiscoveryResponse>),
}

#[derive(Default)]
struct Recorded {
    opens: Vec<(Instant, DiscoveryRequest)>,
    outbound: Vec<mpsc::Receiver<DiscoveryRequest>>,
}

struct ScriptedTransport {
    script: Mutex<VecDeque<Session>>,
    recorded: Mutex<Recorded>,
}

impl ScriptedTransport {
    fn new(script: Vec<Session>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            recorded: Mutex::new(Recorded::default()),
        })
    }

    fn opens(&self) -> Vec<(Instant, DiscoveryRequest)> {
        self.recorded.lock().opens.clone()
    }

    /// Requests the channel sent after the initial subscribe, across all sessions.
    fn follow_ups(&self) -> Vec<DiscoveryRequest> {
        let mut recorded = self.recorded.lock();
        let mut sent = Vec::new();
        for receiver in &mut recorded.outbound {
            while let Ok(request) = receiver.try_recv() {
                sent.push(request);
            }
        }
        sent
    }
}

#[async_trait]
impl DiscoveryTransport for ScriptedTransport {
    async fn open(
        &self,
        initial: DiscoveryRequest,
    ) -> Result<(mpsc::Sender<DiscoveryRequest>, ResponseStream), DiscoveryError> {
        self.recorded.lock().opens.push((Instant::now(), initial));

        // Once the script runs out the control plane stays unreachable.
        let session = self.script.lock().pop_front().unwrap_or(Session::Refuse);
        match session {
            Session::Refuse => Err(DiscoveryError::Connect {
                reason: "connection refused".to_string(),
            }),
            Session::Respond(responses) => {
                let (sender, receiver) = mpsc::channel(16);
                self.recorded.lock().outbound.push(receiver);
                let stream = futures::stream::iter(responses.into_iter().map(Ok)).boxed();
                Ok((sender, stream))
            }
        }
    }
}

fn node() -> Node {
    Node {
        id: "enforcer-test".to_string(),
        cluster: "gateway-enforcer".to_string(),
    }
}

fn api_resource(context: &str) -> ApiResource {
    ApiResource {
        id: 10,
        uuid: "pets-api".to_string(),
        provider: "admin".to_string(),
        name: "PetStore".to_string(),
        version: "1.0".to_string(),
        context: context.to_string(),
        tenant_domain: TENANT.to_string(),
        policy: String::new(),
        lifecycle_state: "PUBLISHED".to_string(),
        api_type: "HTTP".to_string(),
        url_mappings: vec![UrlMappingResource {
            http_method: "GET".to_string(),
            url_pattern: "/cats/{id}".to_string(),
            scopes: vec![],
            throttling_policy: String::new(),
            auth_scheme: "any".to_string(),
        }],
        client_certificates: vec![],
    }
}

fn api_response(version: &str, nonce: &str, context: &str) -> DiscoveryResponse {
    DiscoveryResponse {
        version_info: version.to_string(),
        resources: vec![to_any(type_url::API, &api_resource(context))],
        canary: false,
        type_url: type_url::API.to_string(),
        nonce: nonce.to_string(),
    }
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        initial_delay: Duration::from_millis(30),
        max_delay: Duration::from_millis(240),
        multiplier: 2.0,
        jitter: true,
    }
    .without_jitter()
}

/// Run an API channel until `done` holds or five seconds pass.
async fn drive(
    transport: Arc<ScriptedTransport>,
    registry: Arc<StoreRegistry>,
    health: Arc<SyncHealth>,
    done: impl Fn(&ScriptedTransport) -> bool,
) {
    let sink = Arc::new(StoreSink::new(SnapshotKind::Apis, registry, TENANT));
    let channel = DiscoveryChannel::new(
        Arc::clone(&transport) as Arc<dyn DiscoveryTransport>,
        SubscriptionState::new(type_url::API, node()),
        sink,
        fast_backoff(),
    )
    .with_health(health);

    let mut coordinator = ShutdownCoordinator::new();
    coordinator.spawn_graceful("discovery", move |signal| channel.run(signal));

    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(&transport) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    coordinator.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_reconnect_resumes_from_acked_version() {
    let transport = ScriptedTransport::new(vec![
        Session::Respond(vec![api_response("v1", "n1", "/pets/1.0")]),
        Session::Respond(vec![]),
    ]);
    let registry = Arc::new(StoreRegistry::new(64));

    drive(Arc::clone(&transport), Arc::clone(&registry), Arc::new(SyncHealth::new()), |t| {
        t.opens().len() >= 2
    })
    .await;

    let opens = transport.opens();
    assert!(opens.len() >= 2);
    assert_eq!(opens[0].1.version_info, "");
    assert_eq!(opens[0].1.node.as_ref().map(|n| n.id.as_str()), Some("enforcer-test"));
    assert_eq!(opens[1].1.version_info, "v1");

    let acks = transport.follow_ups();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].version_info, "v1");
    assert_eq!(acks[0].response_nonce, "n1");
    assert!(acks[0].error_detail.is_none());

    let api = registry.lookup(TENANT, |store| store.api_by_context("/pets/1.0", "1.0")).found();
    assert!(api.is_some());
}

#[tokio::test]
async fn test_invalid_response_is_nacked_and_store_untouched() {
    let transport = ScriptedTransport::new(vec![Session::Respond(vec![
        api_response("v1", "n1", "/pets/1.0"),
        api_response("v2", "n2", ""),
    ])]);
    let registry = Arc::new(StoreRegistry::new(64));

    drive(Arc::clone(&transport), Arc::clone(&registry), Arc::new(SyncHealth::new()), |t| {
        t.opens().len() >= 2
    })
    .await;

    let sent = transport.follow_ups();
    assert_eq!(sent.len(), 2);
    let nack = &sent[1];
    assert_eq!(nack.version_info, "v1");
    assert_eq!(nack.response_nonce, "n2");
    let detail = nack.error_detail.as_ref().expect("nack carries error detail");
    assert!(detail.message.contains("context"));

    // The rejected snapshot left the v1 index in place.
    let api = registry.lookup(TENANT, |store| store.api_by_context("/pets/1.0", "1.0")).found();
    assert!(api.is_some());
    assert_eq!(transport.opens()[1].1.version_info, "v1");
}

#[tokio::test]
async fn test_refused_connections_back_off_exponentially() {
    let transport = ScriptedTransport::new(vec![]);
    let health = Arc::new(SyncHealth::new());

    drive(
        Arc::clone(&transport),
        Arc::new(StoreRegistry::new(64)),
        Arc::clone(&health),
        |t| t.opens().len() >= 6,
    )
    .await;

    let opens = transport.opens();
    assert!(opens.len() >= 6, "only {} attempts", opens.len());
    let gaps: Vec<Duration> = opens.windows(2).map(|w| w[1].0 - w[0].0).collect();

    let policy = fast_backoff();
    for (attempt, gap) in gaps.iter().enumerate().take(5) {
        assert!(*gap >= policy.delay_for_attempt(attempt as u32), "gap {attempt} was {gap:?}");
    }
    assert!(gaps[3] > gaps[0]);
    assert!(!health.is_connected(type_url::API));
    assert!(opens.iter().all(|(_, request)| request.version_info.is_empty()));
}
