//! Per-request decision orchestration.
//!
//! A decision resolves the API, authenticates the caller, applies throttling and
//! optionally mints a backend token, all within the configured request deadline.
//! Anything that cannot finish in time fails closed with a 503.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::auth::{AuthRequest, AuthenticationContext};
use crate::backend_jwt::BackendToken;
use crate::context::EnforcerContext;
use crate::error::{EnforcerError, ErrorCode, ErrorResponse};
use crate::subscription::{Api, AuthScheme, Lookup};
use crate::throttle::ThrottleRequest;

/// Suggested retry while the store has not been populated yet.
const NOT_READY_RETRY: Duration = Duration::from_secs(5);

/// What the data plane knows about an inbound call.
#[derive(Debug, Clone, Default)]
pub struct DecisionRequest {
    /// Propagated from the data plane when present
    pub correlation_id: Option<Uuid>,
    /// Falls back to the configured default tenant
    pub tenant: Option<String>,
    pub api_context: String,
    pub api_version: String,
    pub method: String,
    /// Full request path including the API context
    pub path: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub client_ip: Option<IpAddr>,
    /// DER of the TLS peer certificate
    pub peer_certificate: Option<Vec<u8>>,
    pub payload_size: u64,
}

/// Outcome handed back to the data plane.
#[derive(Debug, Clone)]
pub struct Decision {
    pub correlation_id: Uuid,
    pub allowed: bool,
    pub http_status: u16,
    /// Set on denials
    pub code: Option<ErrorCode>,
    pub message: String,
    pub retry_after: Option<Duration>,
    /// Headers the data plane must add to its response, names lowercase
    pub response_headers: HashMap<String, String>,
    pub context: Option<AuthenticationContext>,
    pub backend_token: Option<BackendToken>,
}

impl Decision {
    fn allow(correlation_id: Uuid, context: AuthenticationContext, backend_token: Option<BackendToken>) -> Self {
        Self {
            correlation_id,
            allowed: true,
            http_status: 200,
            code: None,
            message: String::new(),
            retry_after: None,
            response_headers: HashMap::new(),
            context: Some(context),
            backend_token,
        }
    }

    /// Denial built from a request-facing error. `challenge` is only used for credential failures.
    pub fn deny(error: &EnforcerError, correlation_id: Uuid, challenge: Option<String>) -> Self {
        let response = ErrorResponse::from_error(error, correlation_id);
        let mut response_headers = HashMap::new();
        if response.code.is_credential_failure() {
            if let Some(challenge) = challenge.filter(|c| !c.is_empty()) {
                response_headers.insert("www-authenticate".to_string(), challenge);
            }
        }
        if let Some(retry_after) = response.retry_after {
            response_headers.insert("retry-after".to_string(), retry_after_secs(retry_after).to_string());
        }

        Self {
            correlation_id,
            allowed: false,
            http_status: response.code.http_status(),
            code: Some(response.code),
            message: response.to_wire_message(),
            retry_after: response.retry_after,
            response_headers,
            context: None,
            backend_token: None,
        }
    }
}

/// Whole seconds, rounded up so a client never retries early.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 { secs + 1 } else { secs.max(1) }
}

/// Decision entry point shared by every inbound call.
#[derive(Debug, Clone)]
pub struct DecisionService {
    context: Arc<EnforcerContext>,
}

impl DecisionService {
    pub fn new(context: Arc<EnforcerContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &EnforcerContext {
        &self.context
    }

    #[instrument(
        skip_all,
        fields(api = %format!("{}:{}", request.api_context, request.api_version), method = %request.method)
    )]
    pub async fn decide(&self, request: DecisionRequest) -> Decision {
        let started = Instant::now();
        let correlation_id = request.correlation_id.unwrap_or_else(Uuid::new_v4);
        let deadline = self.context.config.request_deadline;

        let result = match tokio::time::timeout(deadline, self.evaluate(&request)).await {
            Ok(result) => result,
            Err(_) => Err(EnforcerError::DeadlineExceeded { duration: deadline }),
        };

        let decision = match result {
            Ok((auth, backend_token)) => {
                debug!(
                    correlation_id = %correlation_id,
                    username = %auth.username,
                    application = ?auth.application_id,
                    "Request allowed"
                );
                Decision::allow(correlation_id, auth, backend_token)
            }
            Err(err) => {
                let challenge = err
                    .code()
                    .is_credential_failure()
                    .then(|| self.context.pipeline.challenge_for(self.auth_scheme(&request)));
                let decision = Decision::deny(&err, correlation_id, challenge);
                log_denial(&err, &decision);
                decision
            }
        };

        let code = decision.code.map_or("OK", |c| c.as_str());
        let outcome = if decision.allowed { "allow" } else { "deny" };
        self.context.metrics.record_decision(outcome, code, started.elapsed());
        decision
    }

    async fn evaluate(
        &self,
        request: &DecisionRequest,
    ) -> Result<(AuthenticationContext, Option<BackendToken>), EnforcerError> {
        let ctx = &self.context;
        let tenant = self.tenant(request);
        let api = self.resolve_api(tenant, request)?;
        let resource = api.match_resource(&request.method, &request.path).cloned();

        let mut auth_request = AuthRequest::new(tenant, Arc::clone(&api), resource);
        auth_request.headers = request
            .headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
            .collect();
        auth_request.query = request.query.clone();
        auth_request.peer_certificate = request.peer_certificate.clone();
        auth_request.client_ip = request.client_ip;

        let auth = ctx.pipeline.authenticate(&auth_request).await?;

        ctx.throttle.check(&ThrottleRequest {
            auth: &auth,
            client_ip: request.client_ip,
            payload_size: request.payload_size,
        })?;

        let backend_token = self.backend_token(&auth)?;
        Ok((auth, backend_token))
    }

    fn tenant<'a>(&'a self, request: &'a DecisionRequest) -> &'a str {
        request
            .tenant
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(self.context.config.auth.default_tenant.as_str())
    }

    /// The store must have seen every required snapshot; an unloaded tenant is an
    /// outage, an unknown API in a loaded tenant is a denial.
    fn resolve_api(&self, tenant: &str, request: &DecisionRequest) -> Result<Arc<Api>, EnforcerError> {
        let registry = &self.context.registry;
        if !registry.is_ready() {
            return Err(EnforcerError::BackendUnavailable {
                reason: "subscription data not yet received".to_string(),
                retry_after: Some(NOT_READY_RETRY),
            });
        }

        match registry.lookup(tenant, |store| store.api_by_context(&request.api_context, &request.api_version)) {
            Lookup::Found(api) => Ok(api),
            Lookup::NotFound => Err(EnforcerError::ResourceForbidden {
                reason: format!("no API deployed at {}:{}", request.api_context, request.api_version),
            }),
            Lookup::NotLoaded => Err(EnforcerError::BackendUnavailable {
                reason: format!("tenant {tenant} not loaded"),
                retry_after: Some(NOT_READY_RETRY),
            }),
        }
    }

    fn auth_scheme(&self, request: &DecisionRequest) -> AuthScheme {
        self.context
            .registry
            .lookup(self.tenant(request), |store| {
                store.api_by_context(&request.api_context, &request.api_version)
            })
            .found()
            .and_then(|api| api.match_resource(&request.method, &request.path).map(|r| r.auth_scheme))
            .unwrap_or_default()
    }

    /// A signing failure denies the request only when configured to; otherwise
    /// the request continues without a token.
    fn backend_token(&self, auth: &AuthenticationContext) -> Result<Option<BackendToken>, EnforcerError> {
        let Some(issuer) = &self.context.backend_jwt else {
            return Ok(None);
        };
        if !auth.authenticated {
            return Ok(None);
        }

        match issuer.issue(auth) {
            Ok(token) => Ok(Some(token)),
            Err(e) if self.context.config.backend_jwt.fail_on_signing_error => {
                Err(EnforcerError::Internal(anyhow::anyhow!("backend token signing failed: {e}")))
            }
            Err(e) => {
                warn!(error = %e, api = %auth.api.display_key(), "Backend token not issued");
                self.context.metrics.set_degraded("backend_jwt", true);
                Ok(None)
            }
        }
    }
}

fn log_denial(error: &EnforcerError, decision: &Decision) {
    let code = decision.code.map_or("", |c| c.as_str());
    match error {
        EnforcerError::BackendUnavailable { .. } | EnforcerError::DeadlineExceeded { .. } => warn!(
            correlation_id = %decision.correlation_id,
            code,
            error = %error,
            "Request failed closed"
        ),
        EnforcerError::Internal(e) => warn!(
            correlation_id = %decision.correlation_id,
            code,
            error = %e,
            "Request denied on internal error"
        ),
        _ => info!(
            correlation_id = %decision.correlation_id,
            code,
            status = decision.http_status,
            "Request denied"
        ),
    }
}
