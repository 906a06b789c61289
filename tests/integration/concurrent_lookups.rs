//! Concurrent Lookup Integration Tests
//!
//! Readers racing full-state replacements must always see one complete
//! generation of the index, never a blend of two.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gateway_enforcer::subscription::{Api, SnapshotKind, StoreRegistry, StoreSnapshot};

use crate::common::{self, TENANT};

const APIS_PER_GENERATION: u64 = 25;
const READERS: usize = 100;
const LOOKUPS_PER_READER: usize = 100;

/// Every API of generation `generation` carries its number in `provider`.
fn generation(generation: u64) -> HashMap<String, StoreSnapshot> {
    // Odd generations publish twice as many APIs as even ones.
    let size = if generation % 2 == 0 {
        APIS_PER_GENERATION
    } else {
        APIS_PER_GENERATION * 2
    };
    let apis: Vec<Api> = (0..size)
        .map(|i| Api {
            id: i,
            uuid: format!("api-{i}"),
            provider: format!("gen-{generation}"),
            context: format!("/api{i}/1.0"),
            ..common::api()
        })
        .collect();
    HashMap::from([(TENANT.to_string(), StoreSnapshot::Apis(apis))])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_observe_mixed_generations() {
    let registry = Arc::new(StoreRegistry::new(64));
    registry.apply_snapshot(SnapshotKind::Apis, generation(0));
    let stop = Arc::new(AtomicBool::new(false));

    let writer = {
        let registry = Arc::clone(&registry);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut n = 1;
            while !stop.load(Ordering::Relaxed) {
                registry.apply_snapshot(SnapshotKind::Apis, generation(n));
                n += 1;
                tokio::task::yield_now().await;
            }
            n
        })
    };

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for _ in 0..LOOKUPS_PER_READER {
                    let index = registry
                        .tenant(TENANT)
                        .map(|store| store.snapshot())
                        .expect("tenant stays loaded across replacements");

                    let first = index.api(0).expect("api 0 exists in every generation");
                    let generation: u64 = first.provider["gen-".len()..].parse().expect("numbered generation");
                    let expected = if generation % 2 == 0 {
                        APIS_PER_GENERATION
                    } else {
                        APIS_PER_GENERATION * 2
                    };

                    assert_eq!(index.counts().apis as u64, expected);
                    for i in 0..expected {
                        let by_id = index.api(i).expect("api present in its generation");
                        assert_eq!(by_id.provider, first.provider);
                        let by_context = index
                            .api_by_context(&format!("/api{i}/1.0"), "1.0")
                            .expect("context index matches id index");
                        assert!(Arc::ptr_eq(&by_id, &by_context));
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for reader in readers {
        reader.await.expect("reader observed a consistent index");
    }
    stop.store(true, Ordering::Relaxed);
    let generations = writer.await.unwrap();
    assert!(generations > 1);
}
