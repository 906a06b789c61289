//! Enforcer Metrics
//!
//! Prometheus metrics for decisions, discovery sync, throttling and degraded mode.

use std::time::Duration;

use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};

const NAMESPACE: &str = "gateway_enforcer";

/// Discovery stream events counted per resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Ack,
    Nack,
    Reconnect,
}

impl DiscoveryEvent {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Nack => "nack",
            Self::Reconnect => "reconnect",
        }
    }
}

/// All metrics exported by the enforcer.
#[derive(Clone)]
pub struct EnforcerMetrics {
    /// Decisions by outcome and machine code
    pub decisions: CounterVec,
    /// Decision latency by outcome
    pub decision_latency: HistogramVec,
    /// Discovery acks, nacks and reconnects by resource type
    pub discovery_events: CounterVec,
    /// Throttle denials by level
    pub throttle_denials: CounterVec,
    /// Outbound throttle events by outcome (`published`, `dropped`)
    pub throttle_events: CounterVec,
    /// 1 while a component runs degraded
    pub degraded: GaugeVec,
}

impl EnforcerMetrics {
    /// Creates and registers the metrics
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let decisions = CounterVec::new(
            Opts::new("decisions_total", "Total enforcement decisions").namespace(NAMESPACE),
            &["outcome", "code"],
        )?;
        registry.register(Box::new(decisions.clone()))?;

        let decision_latency = HistogramVec::new(
            HistogramOpts::new("decision_latency_seconds", "Decision latency in seconds")
                .namespace(NAMESPACE)
                .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5, 1.0]),
            &["outcome"],
        )?;
        registry.register(Box::new(decision_latency.clone()))?;

        let discovery_events = CounterVec::new(
            Opts::new("discovery_events_total", "Discovery stream acks, nacks and reconnects")
                .namespace(NAMESPACE),
            &["type", "event"],
        )?;
        registry.register(Box::new(discovery_events.clone()))?;

        let throttle_denials = CounterVec::new(
            Opts::new("throttle_denials_total", "Requests denied by throttling").namespace(NAMESPACE),
            &["level"],
        )?;
        registry.register(Box::new(throttle_denials.clone()))?;

        let throttle_events = CounterVec::new(
            Opts::new("throttle_events_total", "Throttle events sent to peer replicas").namespace(NAMESPACE),
            &["outcome"],
        )?;
        registry.register(Box::new(throttle_events.clone()))?;

        let degraded = GaugeVec::new(
            Opts::new("degraded_mode", "Whether a component runs in degraded mode").namespace(NAMESPACE),
            &["component"],
        )?;
        registry.register(Box::new(degraded.clone()))?;

        Ok(Self {
            decisions,
            decision_latency,
            discovery_events,
            throttle_denials,
            throttle_events,
            degraded,
        })
    }

    /// Records one decision
    pub fn record_decision(&self, outcome: &str, code: &str, latency: Duration) {
        self.decisions.with_label_values(&[outcome, code]).inc();
        self.decision_latency
            .with_label_values(&[outcome])
            .observe(latency.as_secs_f64());
    }

    pub fn record_discovery(&self, type_name: &str, event: DiscoveryEvent) {
        self.discovery_events
            .with_label_values(&[type_name, event.as_str()])
            .inc();
    }

    pub fn record_throttle_denial(&self, level: &str) {
        self.throttle_denials.with_label_values(&[level]).inc();
    }

    pub fn record_throttle_events(&self, outcome: &str, count: usize) {
        self.throttle_events
            .with_label_values(&[outcome])
            .inc_by(count as f64);
    }

    pub fn set_degraded(&self, component: &str, degraded: bool) {
        self.degraded
            .with_label_values(&[component])
            .set(if degraded { 1.0 } else { 0.0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let registry = Registry::new();
        let metrics = EnforcerMetrics::new(&registry).unwrap();
        metrics.record_decision("allow", "OK", Duration::from_millis(2));
        metrics.record_discovery("Api", DiscoveryEvent::Nack);
        metrics.set_degraded("throttle_peer_sync", true);

        assert_eq!(metrics.decisions.with_label_values(&["allow", "OK"]).get(), 1.0);
        assert_eq!(metrics.degraded.with_label_values(&["throttle_peer_sync"]).get(), 1.0);
        assert!(EnforcerMetrics::new(&registry).is_err());
    }
}
