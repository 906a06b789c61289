//! Credential material of one request.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use crate::subscription::{Api, UrlMapping};

/// What the pipeline sees of an inbound call.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub tenant: String,
    pub api: Arc<Api>,
    /// Matched resource, `None` when no URL mapping matched
    pub resource: Option<UrlMapping>,
    /// Header names are lowercase
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    /// DER of the TLS peer certificate, when the data plane terminated mTLS
    pub peer_certificate: Option<Vec<u8>>,
    pub client_ip: Option<IpAddr>,
}

impl AuthRequest {
    pub fn new(tenant: impl Into<String>, api: Arc<Api>, resource: Option<UrlMapping>) -> Self {
        Self {
            tenant: tenant.into(),
            api,
            resource,
            headers: HashMap::new(),
            query: HashMap::new(),
            peer_certificate: None,
            client_ip: None,
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_peer_certificate(mut self, der: Vec<u8>) -> Self {
        self.peer_certificate = Some(der);
        self
    }

    #[must_use]
    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Token of an `Authorization: <scheme> <token>` header, scheme matched case-insensitively.
    pub fn authorization(&self, scheme: &str) -> Option<&str> {
        let value = self.header("authorization")?.trim();
        let (given, token) = value.split_once(' ')?;
        given.eq_ignore_ascii_case(scheme).then(|| token.trim()).filter(|t| !t.is_empty())
    }
}
