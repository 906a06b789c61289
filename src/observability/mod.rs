//! Observability: structured logging, optional OTLP tracing and Prometheus metrics.

pub mod metrics;
pub mod telemetry;

pub use metrics::{DiscoveryEvent, EnforcerMetrics};
pub use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
