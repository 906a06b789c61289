//! Trust store and signing key loading.
//!
//! The trust store is a directory of PEM certificates; each file's stem is its
//! alias. The signing key is a PKCS#8 PEM private key with a matching PEM
//! certificate. Both are swapped atomically on reload.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, DecodingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};
use x509_parser::oid_registry::{OID_KEY_TYPE_EC_PUBLIC_KEY, OID_PKCS1_RSAENCRYPTION};
use x509_parser::prelude::*;

use crate::config::KeystoreConfig;

/// Key material errors.
#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid PEM in {origin}: {reason}")]
    Pem { origin: String, reason: String },

    #[error("Invalid certificate {alias}: {reason}")]
    Certificate { alias: String, reason: String },

    #[error("Invalid signing key: {reason}")]
    Key { reason: String },
}

/// Public key family of a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Rsa,
    Ec,
}

impl KeyFamily {
    /// JWS algorithms a key of this family may verify.
    pub fn algorithms(&self) -> Vec<Algorithm> {
        match self {
            Self::Rsa => vec![
                Algorithm::RS256,
                Algorithm::RS384,
                Algorithm::RS512,
                Algorithm::PS256,
                Algorithm::PS384,
                Algorithm::PS512,
            ],
            Self::Ec => vec![Algorithm::ES256, Algorithm::ES384],
        }
    }
}

/// A parsed trust store entry.
#[derive(Clone)]
pub struct TrustedCertificate {
    pub alias: String,
    pub der: Vec<u8>,
    /// Subject distinguished name
    pub subject: String,
    /// Validity bounds in epoch seconds
    pub not_before: i64,
    pub not_after: i64,
    pub family: Option<KeyFamily>,
    decoding_key: Option<Arc<DecodingKey>>,
    /// base64url SHA-256 of the DER encoding (`x5t#S256`)
    pub thumbprint_sha256: String,
}

impl TrustedCertificate {
    pub fn from_der(alias: impl Into<String>, der: Vec<u8>) -> Result<Self, KeystoreError> {
        let alias = alias.into();
        let (_, cert) = X509Certificate::from_der(&der).map_err(|e| KeystoreError::Certificate {
            alias: alias.clone(),
            reason: e.to_string(),
        })?;

        let spki = cert.public_key();
        let key_bits = spki.subject_public_key.data.as_ref();
        let (family, decoding_key) = if spki.algorithm.algorithm == OID_PKCS1_RSAENCRYPTION {
            (Some(KeyFamily::Rsa), Some(Arc::new(DecodingKey::from_rsa_der(key_bits))))
        } else if spki.algorithm.algorithm == OID_KEY_TYPE_EC_PUBLIC_KEY {
            (Some(KeyFamily::Ec), Some(Arc::new(DecodingKey::from_ec_der(key_bits))))
        } else {
            (None, None)
        };

        let subject = cert.subject().to_string();
        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();
        let thumbprint_sha256 = URL_SAFE_NO_PAD.encode(Sha256::digest(&der));

        Ok(Self {
            alias,
            der,
            subject,
            not_before,
            not_after,
            family,
            decoding_key,
            thumbprint_sha256,
        })
    }

    /// Parse the first certificate of a PEM document.
    pub fn from_pem(alias: impl Into<String>, pem: &[u8]) -> Result<Self, KeystoreError> {
        let alias = alias.into();
        let der = first_certificate_der(pem, &alias)?;
        Self::from_der(alias, der)
    }

    /// Key to verify JWS signatures with, when the key family is supported.
    pub fn decoding_key(&self) -> Option<&DecodingKey> {
        self.decoding_key.as_deref()
    }

    pub fn is_valid_at(&self, epoch_seconds: i64) -> bool {
        self.not_before <= epoch_seconds && epoch_seconds <= self.not_after
    }
}

impl std::fmt::Debug for TrustedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustedCertificate")
            .field("alias", &self.alias)
            .field("subject", &self.subject)
            .field("not_after", &self.not_after)
            .field("family", &self.family)
            .finish()
    }
}

fn first_certificate_der(pem: &[u8], origin: &str) -> Result<Vec<u8>, KeystoreError> {
    let mut reader = pem;
    rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| KeystoreError::Pem {
            origin: origin.to_string(),
            reason: "no certificate found".to_string(),
        })?
        .map(|der| der.to_vec())
        .map_err(|e| KeystoreError::Pem {
            origin: origin.to_string(),
            reason: e.to_string(),
        })
}

/// Certificates trusted for token verification and mutual TLS, by alias.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    certificates: HashMap<String, Arc<TrustedCertificate>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.pem`, `*.crt` and `*.cer` file of a directory.
    ///
    /// Files that fail to parse are skipped with a warning so one bad
    /// certificate does not take the whole store down.
    pub fn load_dir(dir: &Path) -> Result<Self, KeystoreError> {
        let entries = std::fs::read_dir(dir).map_err(|source| KeystoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut store = Self::new();
        for entry in entries {
            let path = entry
                .map_err(|source| KeystoreError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?
                .path();
            let is_cert = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| matches!(e, "pem" | "crt" | "cer"));
            let Some(alias) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_cert {
                continue;
            }

            let bytes = std::fs::read(&path).map_err(|source| KeystoreError::Io {
                path: path.clone(),
                source,
            })?;
            match TrustedCertificate::from_pem(alias, &bytes) {
                Ok(cert) => store.insert(cert),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable certificate"),
            }
        }
        Ok(store)
    }

    pub fn insert(&mut self, certificate: TrustedCertificate) {
        self.certificates
            .insert(certificate.alias.clone(), Arc::new(certificate));
    }

    pub fn get(&self, alias: &str) -> Option<Arc<TrustedCertificate>> {
        self.certificates.get(alias).cloned()
    }

    /// Entry whose DER encoding equals `der`.
    pub fn find_by_der(&self, der: &[u8]) -> Option<Arc<TrustedCertificate>> {
        self.certificates.values().find(|c| c.der == der).cloned()
    }

    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<_> = self.certificates.keys().cloned().collect();
        aliases.sort();
        aliases
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}

/// Private key and certificate used to sign backend tokens.
#[derive(Clone)]
pub struct SigningMaterial {
    /// PKCS#8 DER private key
    pub private_key_pkcs8: Vec<u8>,
    pub certificate: TrustedCertificate,
}

impl std::fmt::Debug for SigningMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningMaterial")
            .field("certificate", &self.certificate)
            .finish_non_exhaustive()
    }
}

impl SigningMaterial {
    pub fn from_pem(key_pem: &[u8], cert_pem: &[u8]) -> Result<Self, KeystoreError> {
        let mut reader = key_pem;
        let private_key_pkcs8 = loop {
            match rustls_pemfile::read_one(&mut reader) {
                Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => break key.secret_pkcs8_der().to_vec(),
                Ok(Some(_)) => continue,
                Ok(None) => {
                    return Err(KeystoreError::Key {
                        reason: "no PKCS#8 private key found".to_string(),
                    });
                }
                Err(e) => {
                    return Err(KeystoreError::Key {
                        reason: e.to_string(),
                    });
                }
            }
        };
        let certificate = TrustedCertificate::from_pem("signing", cert_pem)?;
        Ok(Self {
            private_key_pkcs8,
            certificate,
        })
    }

    pub fn load(key_path: &Path, cert_path: &Path) -> Result<Self, KeystoreError> {
        let key_pem = std::fs::read(key_path).map_err(|source| KeystoreError::Io {
            path: key_path.to_path_buf(),
            source,
        })?;
        let cert_pem = std::fs::read(cert_path).map_err(|source| KeystoreError::Io {
            path: cert_path.to_path_buf(),
            source,
        })?;
        Self::from_pem(&key_pem, &cert_pem)
    }
}

/// Hot-reloadable key material.
pub struct Keystore {
    config: KeystoreConfig,
    trust_store: ArcSwap<TrustStore>,
    signing: ArcSwap<Option<SigningMaterial>>,
}

impl Keystore {
    /// Load key material from the configured paths.
    pub fn load(config: KeystoreConfig) -> Result<Self, KeystoreError> {
        let (trust_store, signing) = Self::read(&config)?;
        info!(
            certificates = trust_store.len(),
            signing_key = signing.is_some(),
            "Loaded key material"
        );
        Ok(Self {
            config,
            trust_store: ArcSwap::from_pointee(trust_store),
            signing: ArcSwap::from_pointee(signing),
        })
    }

    /// In-memory keystore, for tests and embedding.
    pub fn from_parts(trust_store: TrustStore, signing: Option<SigningMaterial>) -> Self {
        Self {
            config: KeystoreConfig::default(),
            trust_store: ArcSwap::from_pointee(trust_store),
            signing: ArcSwap::from_pointee(signing),
        }
    }

    fn read(config: &KeystoreConfig) -> Result<(TrustStore, Option<SigningMaterial>), KeystoreError> {
        let trust_store = match &config.trust_store_dir {
            Some(dir) => TrustStore::load_dir(dir)?,
            None => TrustStore::new(),
        };
        let signing = match (&config.signing_key_path, &config.signing_cert_path) {
            (Some(key), Some(cert)) => Some(SigningMaterial::load(key, cert)?),
            _ => None,
        };
        Ok((trust_store, signing))
    }

    pub fn trust_store(&self) -> Arc<TrustStore> {
        self.trust_store.load_full()
    }

    pub fn signing_material(&self) -> Option<SigningMaterial> {
        self.signing.load().as_ref().clone()
    }

    /// Re-read key material. On error the previous material stays in place.
    pub fn reload(&self) -> Result<(), KeystoreError> {
        let (trust_store, signing) = Self::read(&self.config)?;
        info!(certificates = trust_store.len(), "Reloaded key material");
        self.trust_store.store(Arc::new(trust_store));
        self.signing.store(Arc::new(signing));
        Ok(())
    }
}

impl std::fmt::Debug for Keystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keystore")
            .field("aliases", &self.trust_store.load().aliases())
            .finish_non_exhaustive()
    }
}
