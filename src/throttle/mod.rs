//! Throttling: blocking conditions, custom policies and tiered quotas.

pub mod blocking;
pub mod counter;
pub mod engine;
pub mod keys;
pub mod publisher;

pub use blocking::{
    BlockingConditionType, BlockingConditions, BlockingSubject, CustomPolicy, IpCondition, KeyVariables, ThrottleData,
};
pub use counter::{Admission, CounterDecision, CounterLimit, CounterTable};
pub use engine::{PeerThrottleEvent, ThrottleEngine, ThrottleRequest};
pub use keys::{ThrottleKey, ThrottleLevel};
pub use publisher::{ThrottleEventPublisher, ThrottleEventQueue, ThrottleEventTransport};
