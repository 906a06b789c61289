//! Signing backends for backend tokens.

use std::fmt;

use ring::rand::SystemRandom;
use ring::signature::{RSA_PKCS1_SHA256, RsaKeyPair};
use thiserror::Error;

use crate::keystore::SigningMaterial;

/// Why a backend token could not be produced.
#[derive(Error, Debug)]
pub enum SigningError {
    #[error("No signing key configured")]
    MissingKey,

    #[error("Signing key rejected: {reason}")]
    KeyRejected { reason: String },

    #[error("Unsupported backend token algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Failed to sign backend token")]
    Sign,

    #[error("Failed to encode backend token: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Algorithm used for backend tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    Rs256,
    /// Unsecured tokens with an empty signature segment
    None,
}

impl SigningAlgorithm {
    pub fn parse(raw: &str) -> Result<Self, SigningError> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "RS256" | "SHA256WITHRSA" => Ok(Self::Rs256),
            "NONE" => Ok(Self::None),
            _ => Err(SigningError::UnsupportedAlgorithm(raw.to_string())),
        }
    }

    /// `alg` header value.
    pub fn header_value(&self) -> &'static str {
        match self {
            Self::Rs256 => "RS256",
            Self::None => "none",
        }
    }
}

/// Signs the `header.body` assertion of a backend token.
pub enum TokenSigner {
    Rs256 {
        key_pair: RsaKeyPair,
        /// `x5t#S256` of the signing certificate
        thumbprint: String,
        rng: SystemRandom,
    },
    Unsigned,
}

impl TokenSigner {
    pub fn new(algorithm: SigningAlgorithm, material: Option<&SigningMaterial>) -> Result<Self, SigningError> {
        match algorithm {
            SigningAlgorithm::None => Ok(Self::Unsigned),
            SigningAlgorithm::Rs256 => {
                let material = material.ok_or(SigningError::MissingKey)?;
                let key_pair = RsaKeyPair::from_pkcs8(&material.private_key_pkcs8).map_err(|e| {
                    SigningError::KeyRejected {
                        reason: e.to_string(),
                    }
                })?;
                Ok(Self::Rs256 {
                    key_pair,
                    thumbprint: material.certificate.thumbprint_sha256.clone(),
                    rng: SystemRandom::new(),
                })
            }
        }
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        match self {
            Self::Rs256 { .. } => SigningAlgorithm::Rs256,
            Self::Unsigned => SigningAlgorithm::None,
        }
    }

    pub fn thumbprint(&self) -> Option<&str> {
        match self {
            Self::Rs256 { thumbprint, .. } => Some(thumbprint),
            Self::Unsigned => None,
        }
    }

    /// Raw signature over `assertion`, empty for unsigned tokens.
    pub fn sign(&self, assertion: &[u8]) -> Result<Vec<u8>, SigningError> {
        match self {
            Self::Rs256 { key_pair, rng, .. } => {
                let mut signature = vec![0; key_pair.public().modulus_len()];
                key_pair
                    .sign(&RSA_PKCS1_SHA256, rng, assertion, &mut signature)
                    .map_err(|_| SigningError::Sign)?;
                Ok(signature)
            }
            Self::Unsigned => Ok(Vec::new()),
        }
    }
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner")
            .field("algorithm", &self.algorithm())
            .field("thumbprint", &self.thumbprint())
            .finish()
    }
}
