//! Authentication: credential validators, trusted issuers and the pipeline that
//! ties a credential to an application subscription.

pub mod claims;
pub mod context;
pub mod issuers;
pub mod jwks;
pub mod pipeline;
pub mod request;
pub mod revocation;
pub mod token;
pub mod validators;

pub use claims::{ClaimSet, ClaimValue};
pub use context::AuthenticationContext;
pub use issuers::{IssuerRegistry, KeySource, TrustedIssuer};
pub use jwks::JwksCache;
pub use pipeline::AuthPipeline;
pub use request::AuthRequest;
pub use revocation::RevokedTokens;
pub use validators::{Credential, Resolution, Validator, ValidatorDeps, ValidatorKind};
