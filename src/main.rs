//! Gateway Enforcer - Main Entry Point
//!
//! Loads configuration and key material, starts one discovery stream per
//! resource type and serves decisions over gRPC until terminated.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tonic::transport::Server;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use gateway_enforcer::config::Config;
use gateway_enforcer::discovery::GrpcTransport;
use gateway_enforcer::grpc::EnforcerGrpcService;
use gateway_enforcer::keystore::Keystore;
use gateway_enforcer::observability::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use gateway_enforcer::shutdown::{run_with_graceful_shutdown, ShutdownCoordinator};
use gateway_enforcer::{DecisionService, EnforcerContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;

    let telemetry_config = TelemetryConfig {
        otlp_endpoint: config.otlp_endpoint_str().to_string(),
        ..TelemetryConfig::default()
    };
    init_telemetry(&telemetry_config).map_err(|e| anyhow::anyhow!("telemetry init failed: {e}"))?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Gateway Enforcer");

    let addr: SocketAddr = config.listen_addr().parse().context("invalid listen address")?;
    let shutdown_timeout = Duration::from_secs(config.shutdown_timeout_seconds);

    let keystore = Keystore::load(config.keystore.clone()).context("failed to load key material")?;
    let transport = GrpcTransport::from_config(&config.discovery).context("invalid discovery endpoint")?;
    let metrics = prometheus::Registry::new();
    let context = Arc::new(EnforcerContext::build(config, keystore, &metrics)?);

    let mut coordinator = ShutdownCoordinator::new();

    let transport = Arc::new(transport);
    if let Some(publisher) = context.throttle_event_publisher(Arc::clone(&transport) as _) {
        coordinator.spawn_graceful("throttle-events", move |signal| publisher.run(signal));
    }
    for channel in context.discovery_channels(transport) {
        coordinator.spawn_graceful("discovery", move |signal| channel.run(signal));
    }

    let throttle = Arc::clone(&context.throttle);
    coordinator.spawn_graceful("throttle-pruner", move |signal| throttle.run_pruner(signal));

    let sweeper = Arc::clone(&context);
    coordinator.spawn_graceful("backend-token-sweep", move |signal| sweeper.sweep_backend_tokens(signal));

    let watcher = Arc::clone(&context);
    coordinator.spawn_graceful("sync-staleness", move |signal| watcher.watch_sync_staleness(signal));

    #[cfg(unix)]
    {
        let reloader = Arc::clone(&context);
        coordinator.spawn_graceful("key-reload", move |signal| {
            gateway_enforcer::shutdown::reload_on_hangup(signal, move || reloader.reload_keys())
        });
    }

    let service = EnforcerGrpcService::new(DecisionService::new(context));
    info!(%addr, "Decision service listening");

    let server = Server::builder()
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_grpc()).into_inner())
        .add_service(service.into_server())
        .serve(addr);
    run_with_graceful_shutdown(server, coordinator, shutdown_timeout).await;

    shutdown_telemetry();
    info!("Gateway Enforcer stopped");

    Ok(())
}
