//! Gateway Enforcer - policy decision core for an API gateway data plane.
//!
//! Keeps subscription, key-manager and throttle state in sync with a control
//! plane over a discovery stream, authenticates requests against it, applies
//! rate limits and optionally mints backend JWTs, answering each data-plane
//! call with an allow/deny decision.

#![forbid(unsafe_code)]

pub mod auth;
pub mod backend_jwt;
pub mod config;
pub mod context;
pub mod decision;
pub mod discovery;
pub mod error;
pub mod grpc;
pub mod keystore;
pub mod observability;
pub mod shutdown;
pub mod subscription;
pub mod throttle;

pub use config::Config;
pub use context::{EnforcerContext, StartupError};
pub use decision::{Decision, DecisionRequest, DecisionService};
pub use error::{EnforcerError, ErrorCode, ErrorResponse};
