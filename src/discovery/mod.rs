//! Discovery channel to the control plane.
//!
//! Every resource type the enforcer consumes has its own xDS subscription
//! over one shared gRPC connection. Responses are validated, applied to
//! their sink and then acked; a response that fails validation is nacked
//! with the last good version so the control plane can correct it.

pub mod backoff;
pub mod channel;
pub mod proto;
pub mod sinks;

pub use backoff::BackoffPolicy;
pub use channel::{DiscoveryChannel, DiscoveryError, DiscoveryTransport, GrpcTransport, SubscriptionState, SyncHealth};
pub use sinks::{
    KeyManagerSink, ResourceSink, RevokedTokenSink, SinkError, StoreSink, SubscriptionEventSink, ThrottleDataSink,
    ThrottleEventSink,
};
