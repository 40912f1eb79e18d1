//! Idempotent synthetic catalog against an in-memory live system
//!
//! Run with: cargo test --package fieldops-e2e --test production_provider

use std::sync::Arc;
use std::time::Duration;

use fieldops_common::{EntityCategory, EntityRecord, ExecutionMode};
use fieldops_e2e::config::ProductionConfig;
use fieldops_e2e::{
    default_catalog, CleanupPolicy, EntitySpec, MemoryLiveSystem, MutatingOperation,
    ProductionTestDataProvider, RetryPolicy,
};

const BUGS: &str = "Bugs Bunny - looneyTunesTest";

fn provider(live: Arc<MemoryLiveSystem>, policy: CleanupPolicy) -> ProductionTestDataProvider {
    let config = ProductionConfig {
        cleanup_policy: policy,
        ..ProductionConfig::default()
    };
    ProductionTestDataProvider::new(live, &config, RetryPolicy::new(3, Duration::from_millis(1)))
}

fn catalog(provider: &ProductionTestDataProvider) -> Vec<EntitySpec> {
    default_catalog(provider.naming(), &["Toontown".to_string(), "Acme Acres".to_string()])
}

#[tokio::test]
async fn repeated_ensure_reuses_entities() {
    let live = Arc::new(MemoryLiveSystem::new());
    let provider = provider(live.clone(), CleanupPolicy::Preserve);
    let catalog = catalog(&provider);

    for _ in 0..3 {
        let ctx = provider.ensure(&catalog).await.unwrap();
        assert_eq!(ctx.mode(), ExecutionMode::Production);
        ctx.cleanup().await.unwrap();
    }

    assert_eq!(live.count_named(EntityCategory::Customers, BUGS), 1);
    assert_eq!(live.create_calls(), catalog.len() as u64);
    assert_eq!(live.delete_calls(), 0);
}

#[tokio::test]
async fn concurrent_ensures_do_not_duplicate() {
    let live = Arc::new(MemoryLiveSystem::new());
    let provider = provider(live.clone(), CleanupPolicy::Preserve);
    let catalog = catalog(&provider);

    let (a, b, c) = tokio::join!(
        provider.ensure(&catalog),
        provider.ensure(&catalog),
        provider.ensure(&catalog)
    );
    for ctx in [a.unwrap(), b.unwrap(), c.unwrap()] {
        assert_eq!(ctx.test_data().len(), catalog.len());
    }

    for spec in &catalog {
        assert_eq!(live.count_named(spec.category, &spec.name), 1, "{}", spec.name);
    }
}

#[tokio::test]
async fn every_ensured_record_is_marked_and_flagged() {
    let live = Arc::new(MemoryLiveSystem::new());
    let provider = provider(live.clone(), CleanupPolicy::Preserve);
    let ctx = provider.ensure(&catalog(&provider)).await.unwrap();

    let naming = provider.naming();
    for (category, record) in ctx.test_data().iter() {
        assert!(naming.check_record(record).is_ok(), "{} {:?}", category, record);
        if let Some(email) = &record.email {
            assert!(naming.is_compliant(email), "unmarked email {}", email);
        }
    }
    assert!(ctx
        .test_data()
        .find_by_name(EntityCategory::Routes, "Acme Acres Route - looneyTunesTest")
        .is_some());
}

#[tokio::test]
async fn real_customers_stay_out_of_reach() {
    let live = Arc::new(MemoryLiveSystem::new());
    live.seed(
        EntityCategory::Customers,
        EntityRecord::new("real-1", "John Smith", false),
    );
    let provider = provider(live.clone(), CleanupPolicy::Remove);
    let ctx = provider.ensure(&catalog(&provider)).await.unwrap();

    assert!(ctx.test_data().find_by_name(EntityCategory::Customers, "John Smith").is_none());
    let refused = ctx
        .guard_mutation(&MutatingOperation::new("delete", "customer", "John Smith"))
        .unwrap_err();
    assert_eq!(refused.kind(), "safety_violation");

    ctx.cleanup().await.unwrap();
    assert_eq!(live.count_named(EntityCategory::Customers, "John Smith"), 1);
    assert_eq!(live.count_named(EntityCategory::Customers, BUGS), 0);
}

#[tokio::test]
async fn remove_policy_leaves_preexisting_synthetic_entities() {
    let live = Arc::new(MemoryLiveSystem::new());
    live.seed(EntityCategory::Customers, EntityRecord::new("seed-1", BUGS, true));
    let provider = provider(live.clone(), CleanupPolicy::Remove);
    let catalog = catalog(&provider);

    let ctx = provider.ensure(&catalog).await.unwrap();
    ctx.cleanup().await.unwrap();

    assert_eq!(live.count_named(EntityCategory::Customers, BUGS), 1);
    assert_eq!(live.delete_calls(), catalog.len() as u64 - 1);
}

#[tokio::test]
async fn transient_live_failures_are_retried() {
    let live = Arc::new(MemoryLiveSystem::new());
    let provider = provider(live.clone(), CleanupPolicy::Preserve);
    live.fail_next(2);

    let ctx = provider.ensure(&catalog(&provider)).await.unwrap();
    assert!(ctx.test_data().find_by_name(EntityCategory::Customers, BUGS).is_some());
}
