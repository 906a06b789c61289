//! Shared fixtures: configuration, seeded store data and signed tokens.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::json;

use gateway_enforcer::config::Config;
use gateway_enforcer::keystore::Keystore;
use gateway_enforcer::subscription::{
    Api, Application, ApplicationKeyMapping, AuthScheme, KeyType, Policy, PolicyKind, Quota, QuotaType,
    SnapshotKind, StoreRegistry, StoreSnapshot, Subscription, SubscriptionState, TimeUnit, UrlMapping,
};
use gateway_enforcer::{DecisionRequest, DecisionService, EnforcerContext};

pub const TENANT: &str = "carbon.super";
pub const ISSUER: &str = "https://idp.gateway.test/oauth2/token";
pub const KEY_MANAGER: &str = "Resident Key Manager";
pub const CONSUMER_KEY: &str = "pets-app-consumer-key";
pub const API_ID: u64 = 10;
pub const APP_ID: u64 = 20;
pub const APP_POLICY: &str = "FivePerMinute";

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

pub fn config(extra: &[(&str, &str)]) -> Config {
    let issuers = json!([{
        "name": KEY_MANAGER,
        "issuer": ISSUER,
        "certificate_alias": "idp",
    }])
    .to_string();
    let trust_store = fixture("truststore").display().to_string();

    let mut vars: HashMap<String, String> = HashMap::from([
        ("ENFORCER_VALIDATORS".to_string(), "jwt,api_key".to_string()),
        ("ENFORCER_JWT_ISSUERS".to_string(), issuers),
        ("ENFORCER_TRUST_STORE_DIR".to_string(), trust_store),
    ]);
    for (name, value) in extra {
        vars.insert(name.to_string(), value.to_string());
    }
    Config::from_lookup(&|name: &str| vars.get(name).cloned()).expect("test configuration is valid")
}

pub fn context(config: Config) -> Arc<EnforcerContext> {
    let keystore = Keystore::load(config.keystore.clone()).expect("fixture trust store loads");
    Arc::new(EnforcerContext::build(config, keystore, &prometheus::Registry::new()).expect("context builds"))
}

pub fn service(extra: &[(&str, &str)]) -> DecisionService {
    DecisionService::new(context(config(extra)))
}

pub fn api() -> Api {
    Api {
        id: API_ID,
        uuid: "pets-api".to_string(),
        provider: "admin".to_string(),
        name: "PetStore".to_string(),
        version: "1.0".to_string(),
        context: "/pets/1.0".to_string(),
        tenant_domain: TENANT.to_string(),
        policy: None,
        lifecycle_state: "PUBLISHED".to_string(),
        api_type: "HTTP".to_string(),
        url_mappings: vec![UrlMapping {
            http_method: "GET".to_string(),
            url_pattern: "/cats/{id}".to_string(),
            scopes: vec![],
            throttling_policy: None,
            auth_scheme: AuthScheme::Any,
        }],
        client_certificates: vec![],
    }
}

pub fn application() -> Application {
    Application {
        id: APP_ID,
        uuid: "pets-app".to_string(),
        name: "PetsApp".to_string(),
        owner: "alice".to_string(),
        policy: APP_POLICY.to_string(),
        token_type: "JWT".to_string(),
        attributes: HashMap::new(),
        group_ids: vec![],
        tenant_domain: TENANT.to_string(),
    }
}

pub fn subscription() -> Subscription {
    Subscription {
        id: 30,
        application_id: APP_ID,
        api_id: API_ID,
        policy: "Unlimited".to_string(),
        state: SubscriptionState::Unblocked,
        timestamp: 1,
    }
}

pub fn application_policy(limit: u64) -> Policy {
    Policy {
        id: 40,
        name: APP_POLICY.to_string(),
        tenant_domain: TENANT.to_string(),
        kind: PolicyKind::Application,
        quota: Quota {
            quota_type: QuotaType::RequestCount,
            limit,
            unit_time: 1,
            time_unit: TimeUnit::Minute,
        },
        burst: None,
        stop_on_quota_reach: true,
        graphql_max_depth: 0,
        graphql_max_complexity: 0,
    }
}

fn snapshot(kind: SnapshotKind, snapshot: StoreSnapshot) -> (SnapshotKind, HashMap<String, StoreSnapshot>) {
    (kind, HashMap::from([(TENANT.to_string(), snapshot)]))
}

/// Load the PetStore API, the PetsApp application and its key mapping, plus `subscriptions`.
pub fn seed(registry: &StoreRegistry, subscriptions: Vec<Subscription>, app_limit: u64) {
    let mapping = ApplicationKeyMapping {
        consumer_key: CONSUMER_KEY.to_string(),
        key_manager: KEY_MANAGER.to_string(),
        application_id: APP_ID,
        key_type: KeyType::Production,
        state: "COMPLETED".to_string(),
    };

    for (kind, per_tenant) in [
        snapshot(SnapshotKind::Apis, StoreSnapshot::Apis(vec![api()])),
        snapshot(SnapshotKind::Applications, StoreSnapshot::Applications(vec![application()])),
        snapshot(SnapshotKind::KeyMappings, StoreSnapshot::KeyMappings(vec![mapping])),
        snapshot(SnapshotKind::Subscriptions, StoreSnapshot::Subscriptions(subscriptions)),
        snapshot(
            SnapshotKind::Policies(PolicyKind::Application),
            StoreSnapshot::Policies(PolicyKind::Application, vec![application_policy(app_limit)]),
        ),
    ] {
        registry.apply_snapshot(kind, per_tenant);
    }
}

/// RS256 token from the fixture issuer, expiring `expires_in` seconds from now.
pub fn token(expires_in: i64) -> String {
    let now = Utc::now().timestamp();
    let claims = json!({
        "iss": ISSUER,
        "sub": "alice@carbon.super",
        "azp": CONSUMER_KEY,
        "scope": "read:pets write:pets",
        "iat": now - 10,
        "exp": now + expires_in,
        "jti": uuid::Uuid::new_v4().to_string(),
    });
    let key = EncodingKey::from_rsa_pem(include_bytes!("../fixtures/issuer.key")).expect("fixture key parses");
    encode(&Header::new(Algorithm::RS256), &claims, &key).expect("token encodes")
}

pub fn request(bearer: Option<&str>) -> DecisionRequest {
    let mut headers = HashMap::new();
    if let Some(token) = bearer {
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
    }
    DecisionRequest {
        api_context: "/pets/1.0".to_string(),
        api_version: "1.0".to_string(),
        method: "GET".to_string(),
        path: "/pets/1.0/cats/7".to_string(),
        headers,
        client_ip: Some("192.0.2.10".parse().expect("valid ip")),
        ..Default::default()
    }
}
