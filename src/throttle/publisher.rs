//! Outbound throttle events.
//!
//! Every admitted request reports what it counted so peer replicas can fold
//! the count into their own windows. The request path only enqueues onto a
//! bounded queue; [`ThrottleEventPublisher`] batches the queue onto the peer
//! transport in the background. A full queue drops events rather than making
//! a request wait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use super::engine::PeerThrottleEvent;
use crate::config::ThrottleConfig;
use crate::discovery::DiscoveryError;
use crate::discovery::proto::{ThrottleEventBatch, ThrottleEventResource};
use crate::observability::EnforcerMetrics;
use crate::shutdown::ShutdownSignal;

/// Sends batches of throttle events to the peer aggregation service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ThrottleEventTransport: Send + Sync {
    async fn publish(&self, batch: ThrottleEventBatch) -> Result<(), DiscoveryError>;
}

/// Request-side handle of the outbound event queue.
#[derive(Clone)]
pub struct ThrottleEventQueue {
    sender: mpsc::Sender<PeerThrottleEvent>,
    metrics: Option<EnforcerMetrics>,
}

impl ThrottleEventQueue {
    /// A queue holding at most `capacity` events, and the receiver that drains it.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<PeerThrottleEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender, metrics: None }, receiver)
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: EnforcerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Enqueue without waiting. Returns false when the event was dropped.
    pub fn push(&self, event: PeerThrottleEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(key = %event.key, "Throttle event queue full, dropping event");
                self.record_dropped(1);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Throttle event publisher stopped, dropping event");
                self.record_dropped(1);
                false
            }
        }
    }

    fn record_dropped(&self, count: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.record_throttle_events("dropped", count);
        }
    }
}

impl std::fmt::Debug for ThrottleEventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleEventQueue")
            .field("capacity", &self.sender.max_capacity())
            .field("free", &self.sender.capacity())
            .finish()
    }
}

/// Drains the event queue in batches until shutdown.
pub struct ThrottleEventPublisher {
    receiver: mpsc::Receiver<PeerThrottleEvent>,
    transport: Arc<dyn ThrottleEventTransport>,
    origin: String,
    batch_size: usize,
    flush_interval: Duration,
    metrics: Option<EnforcerMetrics>,
}

impl ThrottleEventPublisher {
    /// `origin` is this replica's node id, stamped on every event.
    pub fn new(
        receiver: mpsc::Receiver<PeerThrottleEvent>,
        transport: Arc<dyn ThrottleEventTransport>,
        origin: impl Into<String>,
        config: &ThrottleConfig,
    ) -> Self {
        Self {
            receiver,
            transport,
            origin: origin.into(),
            batch_size: config.event_batch_size.max(1),
            flush_interval: config.event_flush_interval,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: EnforcerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Send a batch once it is full or the flush interval passes. Pending
    /// events are flushed once more on shutdown.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        let mut pending = Vec::with_capacity(self.batch_size);
        let mut interval = tokio::time::interval(self.flush_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                received = self.receiver.recv() => match received {
                    Some(event) => {
                        pending.push(event);
                        if pending.len() >= self.batch_size {
                            self.flush(&mut pending).await;
                        }
                    }
                    None => break,
                },
                _ = interval.tick() => self.flush(&mut pending).await,
                _ = shutdown.recv() => break,
            }
        }

        while let Ok(event) = self.receiver.try_recv() {
            pending.push(event);
        }
        self.flush(&mut pending).await;
    }

    async fn flush(&self, pending: &mut Vec<PeerThrottleEvent>) {
        if pending.is_empty() {
            return;
        }
        let events: Vec<ThrottleEventResource> = pending
            .drain(..)
            .map(|event| ThrottleEventResource {
                throttle_key: event.key,
                delta: event.delta,
                timestamp: event.timestamp_ms,
                is_throttled: false,
                expiry_timestamp: 0,
                origin: self.origin.clone(),
            })
            .collect();
        let count = events.len();

        match self.transport.publish(ThrottleEventBatch { events }).await {
            Ok(()) => {
                debug!(count, "Published throttle events");
                if let Some(metrics) = &self.metrics {
                    metrics.record_throttle_events("published", count);
                }
            }
            Err(e) => {
                warn!(error = %e, count, "Failed to publish throttle events, dropping batch");
                if let Some(metrics) = &self.metrics {
                    metrics.record_throttle_events("dropped", count);
                }
            }
        }
    }
}
