//! Plan cache staleness and refresh behaviour

mod common;

use common::*;
use featurefetch_core::{AggregationDef, Definition, Operation, ServingPlan};
use featurefetch_online::MetadataResolver;
use std::sync::Arc;
use std::time::Duration;

fn counting(column: &str) -> Definition {
    let mut def = group_by("purchases", "purchase_events");
    def.aggregations = vec![AggregationDef::new(column, Operation::Count)];
    Definition::GroupBy(def)
}

fn features(plan: &ServingPlan) -> Vec<String> {
    match plan {
        ServingPlan::GroupBy(gb) => gb.feature_names(),
        ServingPlan::Join(join) => join.parts.iter().map(|p| p.namespace.clone()).collect(),
    }
}

async fn wait_for_features(resolver: &MetadataResolver, name: &str, expected: &[&str]) -> bool {
    for _ in 0..100 {
        if let Some(plan) = resolver.cached(name) {
            if features(&plan) == expected {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_expired_plan_is_served_while_refreshing() {
    init_tracing();
    let source = SlowSource::new([counting("amount")], Duration::from_millis(100));
    let resolver = MetadataResolver::new(source.clone(), Duration::ZERO);

    // cold: waits on the source
    let first = resolver.resolve("purchases").await.unwrap();
    assert_eq!(features(&first), vec!["amount_count"]);

    source.inner.put(counting("quantity"));

    // expired: answered from cache without waiting on the slow source
    let stale = tokio::time::timeout(Duration::from_millis(50), resolver.resolve("purchases"))
        .await
        .expect("stale resolve must not block")
        .unwrap();
    assert_eq!(features(&stale), vec!["amount_count"]);

    assert!(wait_for_features(&resolver, "purchases", &["quantity_count"]).await);
    let fresh = resolver.resolve("purchases").await.unwrap();
    assert_eq!(features(&fresh), vec!["quantity_count"]);
}

#[tokio::test]
async fn test_one_refresh_in_flight_per_name() {
    let source = SlowSource::new([counting("amount")], Duration::from_millis(50));
    let resolver = MetadataResolver::new(source.clone(), Duration::ZERO);
    resolver.resolve("purchases").await.unwrap();
    assert_eq!(source.calls(), 1);

    for _ in 0..10 {
        resolver.resolve("purchases").await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn test_failed_refresh_keeps_stale_plan() {
    let source = SlowSource::new([counting("amount")], Duration::ZERO);
    let resolver = MetadataResolver::new(source.clone(), Duration::ZERO);
    resolver.resolve("purchases").await.unwrap();

    source.inner.remove("purchases");
    let stale = resolver.resolve("purchases").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(features(&stale), vec!["amount_count"]);
    let still = resolver.resolve("purchases").await.unwrap();
    assert_eq!(features(&still), vec!["amount_count"]);
}

#[tokio::test]
async fn test_refresh_loop_updates_expired_entries() {
    let source = SlowSource::new([counting("amount")], Duration::ZERO);
    let resolver = MetadataResolver::new(source.clone(), Duration::from_millis(10));
    resolver.resolve("purchases").await.unwrap();

    let handle = resolver.spawn_refresh_loop(Duration::from_millis(20));
    source.inner.put(counting("quantity"));

    assert!(wait_for_features(&resolver, "purchases", &["quantity_count"]).await);
    handle.abort();
}

#[tokio::test]
async fn test_refresh_loop_stops_with_resolver() {
    let source = SlowSource::new([counting("amount")], Duration::ZERO);
    let resolver = MetadataResolver::new(source, Duration::from_secs(60));
    let handle = resolver.spawn_refresh_loop(Duration::from_millis(5));

    drop(resolver);
    let finished = tokio::time::timeout(Duration::from_secs(1), handle).await;
    assert!(finished.is_ok());
}

#[tokio::test]
async fn test_concurrent_resolves_share_cached_plan() {
    let source = SlowSource::new([counting("amount")], Duration::ZERO);
    let resolver = MetadataResolver::new(source, Duration::from_secs(60));
    let first = resolver.resolve("purchases").await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.resolve("purchases").await.unwrap() })
        })
        .collect();
    for handle in handles {
        assert!(Arc::ptr_eq(&first, &handle.await.unwrap()));
    }
}
