//! Tracing Subscriber Setup
//!
//! JSON logs filtered through `RUST_LOG` (default `info`). With the `otel`
//! feature spans are also exported over OTLP.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for traces
    pub service_name: String,
    /// OTLP endpoint URL, used with the `otel` feature
    pub otlp_endpoint: String,
    /// Sampling ratio (0.0 to 1.0)
    pub sampling_ratio: f64,
    /// Emit JSON logs to stdout
    pub enable_console: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "gateway-enforcer".to_string(),
            otlp_endpoint: "http://localhost:4317".to_string(),
            sampling_ratio: 1.0,
            enable_console: true,
        }
    }
}

type InitError = Box<dyn std::error::Error + Send + Sync>;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn json_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
}

/// Install the global subscriber.
#[cfg(not(feature = "otel"))]
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), InitError> {
    let console = config.enable_console.then(json_layer);
    tracing_subscriber::registry()
        .with(env_filter())
        .with(console)
        .try_init()?;
    Ok(())
}

/// Install the global subscriber with an OTLP span exporter.
#[cfg(feature = "otel")]
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), InitError> {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::{Config, Sampler, TracerProvider};
    use opentelemetry_sdk::{runtime, Resource};

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()?;

    let sampler = if config.sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if config.sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(config.sampling_ratio)
    };

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(
            Config::default().with_sampler(sampler).with_resource(Resource::new(vec![
                KeyValue::new("service.name", config.service_name.clone()),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ])),
        )
        .build();
    let tracer = provider.tracer("gateway-enforcer");
    opentelemetry::global::set_tracer_provider(provider);

    let console = config.enable_console.then(json_layer);
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(console)
        .try_init()?;
    Ok(())
}

/// Flush and stop span export.
pub fn shutdown_telemetry() {
    #[cfg(feature = "otel")]
    opentelemetry::global::shutdown_tracer_provider();
}
