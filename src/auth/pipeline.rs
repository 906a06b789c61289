//! Authentication pipeline.
//!
//! Picks the validators a resource accepts, lets the first one that can read
//! the request's credentials verify them, then resolves the application and
//! subscription behind the credential.

use std::sync::Arc;

use tracing::{debug, instrument};

use super::context::AuthenticationContext;
use super::request::AuthRequest;
use super::validators::{Credential, Resolution, Validator, ValidatorDeps, ValidatorKind};
use crate::config::AuthConfig;
use crate::error::EnforcerError;
use crate::subscription::model::{LIFECYCLE_BLOCKED, LIFECYCLE_PROTOTYPED};
use crate::subscription::{
    Application, AuthScheme, KeyType, Lookup, Policy, StoreRegistry, Subscription, SubscriptionState,
    TenantStore, UrlMapping,
};

/// Ordered validators plus the store they resolve against.
pub struct AuthPipeline {
    validators: Vec<Validator>,
    registry: Arc<StoreRegistry>,
}

impl AuthPipeline {
    /// Validators are tried in priority order whatever order they are given in.
    pub fn new(mut validators: Vec<Validator>, registry: Arc<StoreRegistry>) -> Self {
        validators.sort_by_key(Validator::kind);
        validators.dedup_by_key(|v| v.kind());
        Self { validators, registry }
    }

    pub fn from_config(config: &AuthConfig, deps: &ValidatorDeps, registry: Arc<StoreRegistry>) -> Self {
        let validators = config
            .validators
            .iter()
            .map(|kind| Validator::build(*kind, config, deps))
            .collect();
        Self::new(validators, registry)
    }

    pub fn validator_kinds(&self) -> Vec<ValidatorKind> {
        self.validators.iter().map(Validator::kind).collect()
    }

    /// Authenticate a request and resolve its entitlements.
    ///
    /// When no validator can read the request the result is missing
    /// credentials; when several can and all fail, the first failure wins.
    #[instrument(skip_all, fields(tenant = %request.tenant, api = %request.api.display_key()))]
    pub async fn authenticate(&self, request: &AuthRequest) -> Result<AuthenticationContext, EnforcerError> {
        if request.api.lifecycle_state.eq_ignore_ascii_case(LIFECYCLE_BLOCKED) {
            return Err(EnforcerError::ApiBlocked {
                api: request.api.display_key(),
            });
        }

        let scheme = scheme_of(request.resource.as_ref());
        if scheme == AuthScheme::None || request.api.lifecycle_state.eq_ignore_ascii_case(LIFECYCLE_PROTOTYPED) {
            debug!("Resource is open, skipping authentication");
            return Ok(AuthenticationContext::anonymous(
                Arc::clone(&request.api),
                request.resource.clone(),
            ));
        }

        let mut first_error = None;
        for validator in self.validators.iter().filter(|v| v.kind().supports(scheme)) {
            if !validator.can_handle(request) {
                continue;
            }
            let outcome = match validator.validate(request).await {
                Ok(credential) => self.authorize(request, credential),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(context) => {
                    debug!(validator = %validator.kind(), user = %context.username, "Request authenticated");
                    return Ok(context);
                }
                Err(e) => {
                    debug!(validator = %validator.kind(), error = %e, "Validator rejected request");
                    first_error.get_or_insert(e);
                }
            }
        }
        Err(first_error.unwrap_or(EnforcerError::MissingCredentials))
    }

    /// `WWW-Authenticate` value for a credential failure on a resource declaring `scheme`.
    pub fn challenge_for(&self, scheme: AuthScheme) -> String {
        self.validators
            .iter()
            .map(Validator::kind)
            .filter(|kind| kind.supports(scheme))
            .map(|kind| kind.challenge())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn authorize(&self, request: &AuthRequest, credential: Credential) -> Result<AuthenticationContext, EnforcerError> {
        let tenant = request.tenant.as_str();
        let api = &request.api;

        let (application, key_type, consumer_key) = match credential.resolution.clone() {
            Resolution::Static { tier } => return Ok(static_context(request, credential, &tier)),
            Resolution::KeyMapping {
                consumer_key,
                key_manager,
            } => {
                let mapping = self.find(
                    tenant,
                    |s| s.key_mapping(&consumer_key, &key_manager),
                    "no application is registered for the consumer key",
                )?;
                let application = self.find(
                    tenant,
                    |s| s.application(mapping.application_id),
                    "application of the consumer key is unknown",
                )?;
                (application, mapping.key_type, Some(consumer_key))
            }
            Resolution::Application { uuid, key_type } => {
                let application = self.find(
                    tenant,
                    |s| s.application_by_uuid(&uuid),
                    "application of the API key is unknown",
                )?;
                (application, key_type, None)
            }
        };

        let subscription = self.find(
            tenant,
            |s| s.subscription(application.id, api.id),
            "application is not subscribed to the API",
        )?;
        check_subscription_state(&subscription, key_type, &api.display_key())?;
        check_scopes(credential.scopes.as_deref(), request.resource.as_ref())?;

        let policies = self
            .registry
            .tenant(tenant)
            .map(|store| ResolvedPolicies::load(&store, &subscription, &application, request))
            .unwrap_or_default();

        Ok(AuthenticationContext {
            authenticated: true,
            validator: Some(credential.kind),
            username: credential.subject,
            subscriber: Some(application.owner.clone()),
            application_id: Some(application.id),
            application_uuid: Some(application.uuid.clone()),
            application_name: Some(application.name.clone()),
            application_tenant: Some(application.tenant_domain.clone()),
            application_tier: application.policy.clone(),
            subscription_tier: subscription.policy.clone(),
            api_tier: api.api_tier().map(str::to_string),
            resource_tier: request.resource.as_ref().and_then(|r| r.throttling_policy.clone()),
            scopes: credential.scopes.unwrap_or_default(),
            key_type,
            consumer_key,
            content_aware: policies.content_aware(),
            stop_on_quota_reach: policies.subscription.as_ref().is_none_or(|p| p.stop_on_quota_reach),
            claims: credential.claims,
            token_id: credential.token_id,
            token_signature: credential.signature,
            token_issuer: credential.issuer,
            token_expires_at: credential.expires_at,
            api: Arc::clone(api),
            resource: request.resource.clone(),
        })
    }

    fn find<T>(
        &self,
        tenant: &str,
        f: impl FnOnce(&TenantStore) -> Option<T>,
        missing: &str,
    ) -> Result<T, EnforcerError> {
        match self.registry.lookup(tenant, f) {
            Lookup::Found(value) => Ok(value),
            Lookup::NotFound => Err(EnforcerError::ResourceForbidden {
                reason: missing.to_string(),
            }),
            Lookup::NotLoaded => Err(EnforcerError::BackendUnavailable {
                reason: format!("subscription data for tenant {tenant} is not loaded"),
                retry_after: None,
            }),
        }
    }
}

impl std::fmt::Debug for AuthPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthPipeline")
            .field("validators", &self.validator_kinds())
            .finish_non_exhaustive()
    }
}

fn scheme_of(resource: Option<&UrlMapping>) -> AuthScheme {
    resource.map_or(AuthScheme::Any, |r| r.auth_scheme)
}

/// Policies that apply to an authenticated request.
#[derive(Default)]
struct ResolvedPolicies {
    subscription: Option<Arc<Policy>>,
    application: Option<Arc<Policy>>,
    api: Option<Arc<Policy>>,
    resource: Option<Arc<Policy>>,
}

impl ResolvedPolicies {
    fn load(store: &TenantStore, subscription: &Subscription, application: &Application, request: &AuthRequest) -> Self {
        Self {
            subscription: store.subscription_policy(&subscription.policy),
            application: store.application_policy(&application.policy),
            api: request.api.api_tier().and_then(|tier| store.api_policy(tier)),
            resource: request
                .resource
                .as_ref()
                .and_then(|r| r.throttling_policy.as_deref())
                .and_then(|tier| store.api_policy(tier)),
        }
    }

    fn content_aware(&self) -> bool {
        [&self.subscription, &self.application, &self.api, &self.resource]
            .into_iter()
            .flatten()
            .any(|policy| policy.is_content_aware())
    }
}

fn static_context(request: &AuthRequest, credential: Credential, tier: &str) -> AuthenticationContext {
    let mut context = AuthenticationContext::anonymous(Arc::clone(&request.api), request.resource.clone());
    context.authenticated = true;
    context.validator = Some(credential.kind);
    context.username = credential.subject;
    context.application_tier = tier.to_string();
    context.subscription_tier = tier.to_string();
    context.scopes = credential.scopes.unwrap_or_default();
    context.claims = credential.claims;
    context.token_id = credential.token_id;
    context.token_signature = credential.signature;
    context.token_issuer = credential.issuer;
    context.token_expires_at = credential.expires_at;
    context
}

fn check_subscription_state(
    subscription: &Subscription,
    key_type: KeyType,
    api: &str,
) -> Result<(), EnforcerError> {
    match subscription.state {
        SubscriptionState::Unblocked | SubscriptionState::TierUpdatePending => Ok(()),
        SubscriptionState::ProdOnlyBlocked if key_type == KeyType::Sandbox => Ok(()),
        SubscriptionState::Blocked | SubscriptionState::ProdOnlyBlocked => {
            Err(EnforcerError::ApiBlocked { api: api.to_string() })
        }
        SubscriptionState::OnHold | SubscriptionState::Rejected => Err(EnforcerError::SubscriptionInactive {
            state: subscription.state.to_string(),
        }),
    }
}

/// A resource declaring scopes needs at least one of them; credentials without scopes skip the check.
fn check_scopes(scopes: Option<&[String]>, resource: Option<&UrlMapping>) -> Result<(), EnforcerError> {
    let (Some(scopes), Some(resource)) = (scopes, resource) else {
        return Ok(());
    };
    if resource.scopes.is_empty() || resource.scopes.iter().any(|required| scopes.contains(required)) {
        Ok(())
    } else {
        Err(EnforcerError::InvalidScope {
            required: resource.scopes.clone(),
        })
    }
}
