//! Backend JWT issuer.
//!
//! After a request is admitted the enforcer can hand the data plane a token
//! describing the caller, signed with the gateway's own key, so upstream
//! services need not trust or parse the caller's credential.

pub mod cache;
pub mod issuer;
pub mod signer;

pub use cache::TokenCache;
pub use issuer::{BackendToken, BackendTokenIssuer};
pub use signer::{SigningAlgorithm, SigningError, TokenSigner};
