//! Snapshot Property Tests

use std::collections::HashMap;

use proptest::prelude::*;

use gateway_enforcer::subscription::{
    Api, Application, AuthScheme, SnapshotKind, StoreRegistry, StoreSnapshot, Subscription, SubscriptionState,
    UrlMapping,
};

const TENANT: &str = "carbon.super";

fn api(id: u64) -> Api {
    Api {
        id,
        uuid: format!("api-{id}"),
        provider: "admin".to_string(),
        name: format!("Api{id}"),
        version: "1.0".to_string(),
        context: format!("/api{id}/1.0"),
        tenant_domain: TENANT.to_string(),
        policy: None,
        lifecycle_state: "PUBLISHED".to_string(),
        api_type: "HTTP".to_string(),
        url_mappings: vec![UrlMapping {
            http_method: "GET".to_string(),
            url_pattern: "/*".to_string(),
            scopes: vec![],
            throttling_policy: None,
            auth_scheme: AuthScheme::Any,
        }],
        client_certificates: vec![],
    }
}

fn application(id: u64) -> Application {
    Application {
        id,
        uuid: format!("app-{id}"),
        name: format!("App{id}"),
        owner: "alice".to_string(),
        policy: "Unlimited".to_string(),
        token_type: "JWT".to_string(),
        attributes: HashMap::new(),
        group_ids: vec![],
        tenant_domain: TENANT.to_string(),
    }
}

fn subscription(id: u64, application_id: u64, api_id: u64) -> Subscription {
    Subscription {
        id,
        application_id,
        api_id,
        policy: "Unlimited".to_string(),
        state: SubscriptionState::Unblocked,
        timestamp: 1,
    }
}

fn tenant(snapshot: StoreSnapshot) -> HashMap<String, StoreSnapshot> {
    HashMap::from([(TENANT.to_string(), snapshot)])
}

fn apply_all(registry: &StoreRegistry, apis: &[u64], apps: &[u64], subs: &[(u64, u64)]) {
    registry.apply_snapshot(SnapshotKind::Apis, tenant(StoreSnapshot::Apis(apis.iter().copied().map(api).collect())));
    registry.apply_snapshot(
        SnapshotKind::Applications,
        tenant(StoreSnapshot::Applications(apps.iter().copied().map(application).collect())),
    );
    registry.apply_snapshot(
        SnapshotKind::Subscriptions,
        tenant(StoreSnapshot::Subscriptions(
            subs.iter()
                .enumerate()
                .map(|(i, (app, api))| subscription(i as u64 + 1, *app, *api))
                .collect(),
        )),
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: applying the same snapshots twice leaves the same index
    #[test]
    fn prop_snapshot_apply_idempotent(
        apis in proptest::collection::btree_set(1u64..40, 0..15),
        apps in proptest::collection::btree_set(1u64..40, 0..15),
        subs in proptest::collection::vec((1u64..40, 1u64..40), 0..30),
    ) {
        let apis: Vec<u64> = apis.into_iter().collect();
        let apps: Vec<u64> = apps.into_iter().collect();
        let registry = StoreRegistry::new(1_000);

        apply_all(&registry, &apis, &apps, &subs);
        let first = registry.tenant(TENANT).map(|store| store.snapshot().counts());
        apply_all(&registry, &apis, &apps, &subs);
        let second = registry.tenant(TENANT).map(|store| store.snapshot().counts());

        prop_assert_eq!(first, second);
    }

    /// Property: only subscriptions whose application and API both exist are visible
    #[test]
    fn prop_visible_subscriptions_resolve(
        apis in proptest::collection::btree_set(1u64..20, 0..10),
        apps in proptest::collection::btree_set(1u64..20, 0..10),
        subs in proptest::collection::vec((1u64..20, 1u64..20), 0..30),
    ) {
        let api_ids: Vec<u64> = apis.iter().copied().collect();
        let app_ids: Vec<u64> = apps.iter().copied().collect();
        let registry = StoreRegistry::new(1_000);
        apply_all(&registry, &api_ids, &app_ids, &subs);

        let Some(store) = registry.tenant(TENANT) else {
            return Ok(());
        };
        for (app, api) in &subs {
            let visible = store.subscription(*app, *api).is_some();
            prop_assert_eq!(visible, apps.contains(app) && apis.contains(api));
        }
    }
}
