//! Discovery stream client.
//!
//! One [`DiscoveryChannel`] drives one resource type: it subscribes, hands
//! each response to its sink, acks or nacks the outcome and reconnects with
//! backoff when the stream fails. Channels sharing a [`GrpcTransport`] share
//! one HTTP/2 connection but keep their own version, nonce and backoff state.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info, instrument, warn};

use super::backoff::BackoffPolicy;
use super::proto::{
    short_type_name, DiscoveryRequest, DiscoveryResponse, Node, PublishThrottleEventsResponse, Status,
    ThrottleEventBatch, PUBLISH_THROTTLE_EVENTS_PATH, STREAM_RESOURCES_PATH,
};
use super::sinks::ResourceSink;
use crate::config::DiscoveryConfig;
use crate::observability::metrics::{DiscoveryEvent, EnforcerMetrics};
use crate::shutdown::ShutdownSignal;
use crate::throttle::ThrottleEventTransport;

/// gRPC status code carried in nack error details (`INVALID_ARGUMENT`).
const NACK_STATUS_CODE: i32 = 3;

/// Outbound request buffer per stream.
const REQUEST_BUFFER: usize = 16;

/// Discovery transport errors.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Could not reach the control plane
    #[error("Failed to connect to control plane: {reason}")]
    Connect { reason: String },

    /// The stream failed with a gRPC status
    #[error("Discovery stream error: {0}")]
    Stream(#[from] tonic::Status),

    /// The outbound half of the stream closed
    #[error("Discovery request stream closed")]
    Closed,

    /// TLS material could not be loaded
    #[error("Invalid control plane TLS configuration: {reason}")]
    Tls { reason: String },
}

/// Inbound half of a discovery stream.
pub type ResponseStream = BoxStream<'static, Result<DiscoveryResponse, tonic::Status>>;

/// Opens discovery streams.
#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    /// Open a stream whose first request is `initial`.
    async fn open(
        &self,
        initial: DiscoveryRequest,
    ) -> Result<(mpsc::Sender<DiscoveryRequest>, ResponseStream), DiscoveryError>;
}

/// Transport over a shared tonic channel.
#[derive(Clone)]
pub struct GrpcTransport {
    channel: Channel,
}

impl GrpcTransport {
    /// Build a lazily connecting transport for the configured control plane.
    pub fn from_config(config: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let mut endpoint = Endpoint::from_shared(config.control_plane_url.to_string())
            .map_err(|e| DiscoveryError::Connect {
                reason: e.to_string(),
            })?
            .http2_keep_alive_interval(std::time::Duration::from_secs(30))
            .keep_alive_while_idle(true);

        if let Some(path) = &config.ca_cert_path {
            let pem = std::fs::read(path).map_err(|e| DiscoveryError::Tls {
                reason: format!("{}: {e}", path.display()),
            })?;
            let domain = config
                .control_plane_url
                .host_str()
                .unwrap_or_default()
                .to_string();
            endpoint = endpoint
                .tls_config(
                    ClientTlsConfig::new()
                        .ca_certificate(Certificate::from_pem(pem))
                        .domain_name(domain),
                )
                .map_err(|e| DiscoveryError::Tls {
                    reason: e.to_string(),
                })?;
        }

        Ok(Self::from_channel(endpoint.connect_lazy()))
    }

    /// Transport over an existing channel.
    pub fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl DiscoveryTransport for GrpcTransport {
    async fn open(
        &self,
        initial: DiscoveryRequest,
    ) -> Result<(mpsc::Sender<DiscoveryRequest>, ResponseStream), DiscoveryError> {
        let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
        tx.send(initial).await.map_err(|_| DiscoveryError::Closed)?;
        let outbound = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|request| (request, rx))
        });

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await.map_err(|e| DiscoveryError::Connect {
            reason: e.to_string(),
        })?;
        let codec = tonic::codec::ProstCodec::<DiscoveryRequest, DiscoveryResponse>::default();
        let response = grpc
            .streaming(
                tonic::Request::new(outbound),
                PathAndQuery::from_static(STREAM_RESOURCES_PATH),
                codec,
            )
            .await?;

        Ok((tx, response.into_inner().boxed()))
    }
}

/// Throttle counts go to the control plane over the same connection as discovery.
#[async_trait]
impl ThrottleEventTransport for GrpcTransport {
    async fn publish(&self, batch: ThrottleEventBatch) -> Result<(), DiscoveryError> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await.map_err(|e| DiscoveryError::Connect {
            reason: e.to_string(),
        })?;
        let codec = tonic::codec::ProstCodec::<ThrottleEventBatch, PublishThrottleEventsResponse>::default();
        grpc.unary(
            tonic::Request::new(batch),
            PathAndQuery::from_static(PUBLISH_THROTTLE_EVENTS_PATH),
            codec,
        )
        .await?;
        Ok(())
    }
}

/// Version and nonce bookkeeping of one resource type.
#[derive(Debug, Clone)]
pub struct SubscriptionState {
    type_url: String,
    node: Node,
    resource_names: Vec<String>,
    acked_version: String,
}

impl SubscriptionState {
    pub fn new(type_url: impl Into<String>, node: Node) -> Self {
        Self {
            type_url: type_url.into(),
            node,
            resource_names: Vec::new(),
            acked_version: String::new(),
        }
    }

    /// Restrict the subscription to named resources.
    #[must_use]
    pub fn with_resource_names(mut self, names: Vec<String>) -> Self {
        self.resource_names = names;
        self
    }

    pub fn type_url(&self) -> &str {
        &self.type_url
    }

    /// Version of the last snapshot the sink accepted; empty on cold start.
    pub fn acked_version(&self) -> &str {
        &self.acked_version
    }

    /// First request on a new stream, resuming from the last acked version.
    pub fn subscribe_request(&self) -> DiscoveryRequest {
        DiscoveryRequest {
            version_info: self.acked_version.clone(),
            node: Some(self.node.clone()),
            resource_names: self.resource_names.clone(),
            type_url: self.type_url.clone(),
            response_nonce: String::new(),
            error_detail: None,
        }
    }

    /// Acknowledge `response` and remember its version.
    pub fn ack_request(&mut self, response: &DiscoveryResponse) -> DiscoveryRequest {
        self.acked_version = response.version_info.clone();
        DiscoveryRequest {
            version_info: response.version_info.clone(),
            node: Some(self.node.clone()),
            resource_names: self.resource_names.clone(),
            type_url: self.type_url.clone(),
            response_nonce: response.nonce.clone(),
            error_detail: None,
        }
    }

    /// Reject `response`, citing the previously acked version.
    pub fn nack_request(&self, response: &DiscoveryResponse, detail: &str) -> DiscoveryRequest {
        DiscoveryRequest {
            version_info: self.acked_version.clone(),
            node: Some(self.node.clone()),
            resource_names: self.resource_names.clone(),
            type_url: self.type_url.clone(),
            response_nonce: response.nonce.clone(),
            error_detail: Some(Status {
                code: NACK_STATUS_CODE,
                message: detail.to_string(),
            }),
        }
    }
}

/// Sync state of one resource type.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeHealth {
    pub connected: bool,
    pub last_ack: Option<Instant>,
}

/// Connection and freshness of every discovery stream.
#[derive(Debug, Default)]
pub struct SyncHealth {
    types: DashMap<String, TypeHealth>,
}

impl SyncHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_connected(&self, type_url: &str) {
        self.types.entry(type_url.to_string()).or_default().connected = true;
    }

    pub fn mark_disconnected(&self, type_url: &str) {
        self.types.entry(type_url.to_string()).or_default().connected = false;
    }

    pub fn mark_acked(&self, type_url: &str) {
        let mut entry = self.types.entry(type_url.to_string()).or_default();
        entry.connected = true;
        entry.last_ack = Some(Instant::now());
    }

    pub fn is_connected(&self, type_url: &str) -> bool {
        self.types.get(type_url).is_some_and(|h| h.connected)
    }

    pub fn get(&self, type_url: &str) -> Option<TypeHealth> {
        self.types.get(type_url).map(|h| *h)
    }

    /// Types whose last ack is older than `max_age`, or that never acked.
    pub fn stale_types(&self, max_age: std::time::Duration) -> Vec<String> {
        let mut stale: Vec<String> = self
            .types
            .iter()
            .filter(|entry| entry.last_ack.is_none_or(|at| at.elapsed() > max_age))
            .map(|entry| entry.key().clone())
            .collect();
        stale.sort();
        stale
    }
}

/// Long-lived subscription to one resource type.
pub struct DiscoveryChannel {
    transport: Arc<dyn DiscoveryTransport>,
    state: SubscriptionState,
    sink: Arc<dyn ResourceSink>,
    backoff: BackoffPolicy,
    health: Arc<SyncHealth>,
    metrics: Option<EnforcerMetrics>,
}

impl DiscoveryChannel {
    pub fn new(
        transport: Arc<dyn DiscoveryTransport>,
        subscription: SubscriptionState,
        sink: Arc<dyn ResourceSink>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            transport,
            state: subscription,
            sink,
            backoff,
            health: Arc::new(SyncHealth::new()),
            metrics: None,
        }
    }

    /// Report connection state into a shared health table.
    #[must_use]
    pub fn with_health(mut self, health: Arc<SyncHealth>) -> Self {
        self.health = health;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: EnforcerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> &SubscriptionState {
        &self.state
    }

    /// Drive the subscription until shutdown.
    #[instrument(skip_all, fields(type_url = %short_type_name(self.state.type_url())))]
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        let type_url = self.state.type_url().to_string();
        let mut attempt: u32 = 0;

        loop {
            let result = tokio::select! {
                _ = shutdown.recv() => break,
                result = self.run_stream(&mut attempt) => result,
            };
            self.health.mark_disconnected(&type_url);

            match result {
                Ok(()) => info!(version = %self.state.acked_version(), "Control plane closed discovery stream"),
                Err(e) => warn!(error = %e, version = %self.state.acked_version(), "Discovery stream failed"),
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            if let Some(metrics) = &self.metrics {
                metrics.record_discovery(short_type_name(&type_url), DiscoveryEvent::Reconnect);
            }
            debug!(delay_ms = delay.as_millis() as u64, attempt, "Reconnecting discovery stream");

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.health.mark_disconnected(&type_url);
        info!("Discovery channel stopped");
    }

    /// One stream lifetime. Returns when the peer closes or the stream fails.
    async fn run_stream(&mut self, attempt: &mut u32) -> Result<(), DiscoveryError> {
        let (requests, mut responses) = self.transport.open(self.state.subscribe_request()).await?;
        let type_url = self.state.type_url().to_string();
        let type_name = short_type_name(&type_url).to_string();
        self.health.mark_connected(&type_url);
        info!(version = %self.state.acked_version(), "Subscribed to discovery stream");

        while let Some(item) = responses.next().await {
            let response = item?;
            match self.sink.apply(&response) {
                Ok(applied) => {
                    let ack = self.state.ack_request(&response);
                    requests.send(ack).await.map_err(|_| DiscoveryError::Closed)?;
                    *attempt = 0;
                    self.health.mark_acked(&type_url);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_discovery(&type_name, DiscoveryEvent::Ack);
                    }
                    info!(
                        version = %response.version_info,
                        nonce = %response.nonce,
                        resources = applied,
                        "Applied discovery response"
                    );
                }
                Err(e) => {
                    let nack = self.state.nack_request(&response, &e.to_string());
                    requests.send(nack).await.map_err(|_| DiscoveryError::Closed)?;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_discovery(&type_name, DiscoveryEvent::Nack);
                    }
                    warn!(
                        version = %response.version_info,
                        nonce = %response.nonce,
                        error = %e,
                        "Rejected discovery response"
                    );
                }
            }
        }

        Ok(())
    }
}
