//! `enforcer.v1` messages exchanged with the data plane.

use std::collections::HashMap;

#[derive(Clone, PartialEq, prost::Message)]
pub struct CheckRequest {
    #[prost(string, tag = "1")]
    pub correlation_id: String,
    #[prost(string, tag = "2")]
    pub tenant_domain: String,
    #[prost(string, tag = "3")]
    pub api_context: String,
    #[prost(string, tag = "4")]
    pub api_version: String,
    #[prost(string, tag = "5")]
    pub method: String,
    #[prost(string, tag = "6")]
    pub path: String,
    #[prost(map = "string, string", tag = "7")]
    pub headers: HashMap<String, String>,
    #[prost(map = "string, string", tag = "8")]
    pub query_params: HashMap<String, String>,
    #[prost(string, tag = "9")]
    pub client_ip: String,
    /// DER encoded
    #[prost(bytes = "vec", tag = "10")]
    pub peer_certificate: Vec<u8>,
    #[prost(uint64, tag = "11")]
    pub payload_size: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthContextSummary {
    #[prost(bool, tag = "1")]
    pub authenticated: bool,
    #[prost(string, tag = "2")]
    pub username: String,
    #[prost(string, tag = "3")]
    pub application_id: String,
    #[prost(string, tag = "4")]
    pub application_name: String,
    #[prost(string, tag = "5")]
    pub subscriber: String,
    #[prost(string, tag = "6")]
    pub key_type: String,
    #[prost(string, tag = "7")]
    pub subscription_tier: String,
    #[prost(string, tag = "8")]
    pub application_tier: String,
    #[prost(string, tag = "9")]
    pub api_tier: String,
    #[prost(string, repeated, tag = "10")]
    pub scopes: Vec<String>,
    #[prost(string, tag = "11")]
    pub validator: String,
    #[prost(string, tag = "12")]
    pub consumer_key: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CheckResponse {
    #[prost(bool, tag = "1")]
    pub allowed: bool,
    #[prost(uint32, tag = "2")]
    pub http_status: u32,
    /// Machine code such as `AUTH_CREDENTIALS_EXPIRED`, empty when allowed
    #[prost(string, tag = "3")]
    pub code: String,
    #[prost(uint32, tag = "4")]
    pub numeric_code: u32,
    #[prost(string, tag = "5")]
    pub message: String,
    #[prost(uint64, tag = "6")]
    pub retry_after_seconds: u64,
    #[prost(map = "string, string", tag = "7")]
    pub response_headers: HashMap<String, String>,
    #[prost(message, optional, tag = "8")]
    pub auth_context: Option<AuthContextSummary>,
    #[prost(string, tag = "9")]
    pub backend_token: String,
    #[prost(string, tag = "10")]
    pub backend_token_header: String,
    #[prost(string, tag = "11")]
    pub correlation_id: String,
}
