//! gRPC Service Implementation
//!
//! Exposes the decision service to the data plane as
//! `enforcer.v1.DecisionService/Check`. Denials are regular responses carrying
//! the HTTP status and machine code; gRPC errors are reserved for malformed calls.

pub mod proto;
pub mod server;

use std::net::IpAddr;

use tonic::{Request, Response, Status};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::auth::AuthenticationContext;
use crate::decision::{retry_after_secs, Decision, DecisionRequest, DecisionService};
use proto::{AuthContextSummary, CheckRequest, CheckResponse};
pub use server::{DecisionRpc, DecisionRpcServer};

/// Decision RPC handler.
#[derive(Debug, Clone)]
pub struct EnforcerGrpcService {
    decisions: DecisionService,
}

impl EnforcerGrpcService {
    pub fn new(decisions: DecisionService) -> Self {
        Self { decisions }
    }

    pub fn into_server(self) -> DecisionRpcServer<Self> {
        DecisionRpcServer::new(self)
    }

    /// Correlation id from the data plane, or a fresh one when absent or unparseable.
    fn correlation_id(raw: &str) -> Uuid {
        Uuid::parse_str(raw.trim()).unwrap_or_else(|_| Uuid::new_v4())
    }

    fn to_decision_request(req: CheckRequest) -> Result<DecisionRequest, Status> {
        if req.api_context.is_empty() || req.method.is_empty() {
            return Err(Status::invalid_argument("api_context and method are required"));
        }

        let client_ip = match req.client_ip.trim() {
            "" => None,
            raw => match raw.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    debug!(client_ip = %raw, "Ignoring unparseable client address");
                    None
                }
            },
        };

        Ok(DecisionRequest {
            correlation_id: Some(Self::correlation_id(&req.correlation_id)),
            tenant: Some(req.tenant_domain).filter(|t| !t.is_empty()),
            api_context: req.api_context,
            api_version: req.api_version,
            method: req.method,
            path: req.path,
            headers: req.headers,
            query: req.query_params,
            client_ip,
            peer_certificate: Some(req.peer_certificate).filter(|der| !der.is_empty()),
            payload_size: req.payload_size,
        })
    }

    fn summarize(context: &AuthenticationContext) -> AuthContextSummary {
        AuthContextSummary {
            authenticated: context.authenticated,
            username: context.username.clone(),
            application_id: context.application_id.map(|id| id.to_string()).unwrap_or_default(),
            application_name: context.application_name.clone().unwrap_or_default(),
            subscriber: context.subscriber.clone().unwrap_or_default(),
            key_type: context.key_type.as_str().to_string(),
            subscription_tier: context.subscription_tier.clone(),
            application_tier: context.application_tier.clone(),
            api_tier: context.api_tier.clone().unwrap_or_default(),
            scopes: context.scopes.clone(),
            validator: context.validator.map(|v| v.to_string()).unwrap_or_default(),
            consumer_key: context.consumer_key.clone().unwrap_or_default(),
        }
    }

    fn to_response(decision: Decision) -> CheckResponse {
        let (backend_token_header, backend_token) = decision
            .backend_token
            .map(|t| (t.header_name, t.token))
            .unwrap_or_default();

        CheckResponse {
            allowed: decision.allowed,
            http_status: u32::from(decision.http_status),
            code: decision.code.map(|c| c.as_str().to_string()).unwrap_or_default(),
            numeric_code: decision.code.map_or(0, |c| c.numeric()),
            message: decision.message,
            retry_after_seconds: decision.retry_after.map_or(0, retry_after_secs),
            response_headers: decision.response_headers,
            auth_context: decision.context.as_ref().map(Self::summarize),
            backend_token,
            backend_token_header,
            correlation_id: decision.correlation_id.to_string(),
        }
    }
}

#[tonic::async_trait]
impl DecisionRpc for EnforcerGrpcService {
    #[instrument(skip(self, request))]
    async fn check(&self, request: Request<CheckRequest>) -> Result<Response<CheckResponse>, Status> {
        let decision_request = Self::to_decision_request(request.into_inner())?;
        let decision = self.decisions.decide(decision_request).await;
        Ok(Response::new(Self::to_response(decision)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EnforcerError, ErrorCode};

    fn check_request() -> CheckRequest {
        CheckRequest {
            api_context: "/pets".to_string(),
            api_version: "1.0".to_string(),
            method: "GET".to_string(),
            path: "/pets/1.0/cats".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_method_rejected() {
        let mut req = check_request();
        req.method.clear();
        let status = EnforcerGrpcService::to_decision_request(req).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn test_request_conversion() {
        let id = Uuid::new_v4();
        let mut req = check_request();
        req.correlation_id = id.to_string();
        req.client_ip = "10.0.0.7".to_string();

        let converted = EnforcerGrpcService::to_decision_request(req).unwrap();
        assert_eq!(converted.correlation_id, Some(id));
        assert_eq!(converted.client_ip, Some("10.0.0.7".parse().unwrap()));
        assert!(converted.tenant.is_none());
        assert!(converted.peer_certificate.is_none());
    }

    #[test]
    fn test_bad_client_ip_is_dropped() {
        let mut req = check_request();
        req.client_ip = "not-an-ip".to_string();
        let converted = EnforcerGrpcService::to_decision_request(req).unwrap();
        assert!(converted.client_ip.is_none());
    }

    #[test]
    fn test_denial_response_fields() {
        let err = EnforcerError::BackendUnavailable {
            reason: "stream down".to_string(),
            retry_after: Some(std::time::Duration::from_millis(1500)),
        };
        let decision = Decision::deny(&err, Uuid::new_v4(), None);
        let response = EnforcerGrpcService::to_response(decision);

        assert!(!response.allowed);
        assert_eq!(response.http_status, 503);
        assert_eq!(response.code, ErrorCode::BackendUnavailable.as_str());
        assert_eq!(response.numeric_code, 102503);
        assert_eq!(response.retry_after_seconds, 2);
        assert!(response.auth_context.is_none());
        assert!(!response.message.contains("stream down"));
    }
}
