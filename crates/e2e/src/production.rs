//! Production mode: idempotent synthetic entities in the live system

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use fieldops_common::{EntityCategory, EntityRecord, ExecutionMode, NamingConvention, TestDataSet};

use crate::config::{CleanupPolicy, ProductionConfig};
use crate::context::{ContextSource, DataContext};
use crate::error::{E2eError, E2eResult};
use crate::live::{LiveSystem, NewEntity};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::safety::{MutatingOperation, ProductionSafetyGuard};

/// Domain used for synthetic email addresses
pub const SYNTHETIC_EMAIL_DOMAIN: &str = "fieldops.test";

/// Customers every production run can rely on
pub const LOONEY_TUNES_CUSTOMERS: [(&str, &str); 6] = [
    ("Bugs Bunny", "bugs.bunny"),
    ("Daffy Duck", "daffy.duck"),
    ("Porky Pig", "porky.pig"),
    ("Elmer Fudd", "elmer.fudd"),
    ("Tweety Bird", "tweety.bird"),
    ("Wile E Coyote", "wile.coyote"),
];

/// One synthetic entity a scenario needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub category: EntityCategory,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl EntitySpec {
    pub fn new(category: EntityCategory, name: impl Into<String>) -> Self {
        Self {
            category,
            name: name.into(),
            email: None,
            location: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// The fixed customer set plus one route per location, all marked
pub fn default_catalog(naming: &NamingConvention, locations: &[String]) -> Vec<EntitySpec> {
    let customers = LOONEY_TUNES_CUSTOMERS.iter().map(|(name, local)| {
        EntitySpec::new(EntityCategory::Customers, naming.apply(name))
            .with_email(naming.apply_email(local, SYNTHETIC_EMAIL_DOMAIN))
    });
    let routes = locations.iter().map(|location| {
        EntitySpec::new(EntityCategory::Routes, naming.apply(&format!("{} Route", location)))
            .with_location(location.clone())
    });
    customers.chain(routes).collect()
}

/// Ensures synthetic entities exist in the live system
#[derive(Clone)]
pub struct ProductionTestDataProvider {
    live: Arc<dyn LiveSystem>,
    naming: NamingConvention,
    cleanup_policy: CleanupPolicy,
    request_timeout: Duration,
    retry: RetryExecutor,
    catalog_name: String,
}

impl std::fmt::Debug for ProductionTestDataProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductionTestDataProvider")
            .field("naming", &self.naming)
            .field("cleanup_policy", &self.cleanup_policy)
            .field("catalog_name", &self.catalog_name)
            .finish_non_exhaustive()
    }
}

impl ProductionTestDataProvider {
    pub fn new(live: Arc<dyn LiveSystem>, config: &ProductionConfig, policy: RetryPolicy) -> Self {
        Self {
            live,
            naming: config.naming(),
            cleanup_policy: config.cleanup_policy,
            request_timeout: config.request_timeout(),
            retry: RetryExecutor::new(policy),
            catalog_name: "default".to_string(),
        }
    }

    /// Name used for the catalog in reports and errors
    pub fn with_catalog_name(mut self, name: impl Into<String>) -> Self {
        self.catalog_name = name.into();
        self
    }

    pub fn naming(&self) -> &NamingConvention {
        &self.naming
    }

    pub fn cleanup_policy(&self) -> CleanupPolicy {
        self.cleanup_policy
    }

    /// Make sure every entity in `catalog` exists, creating what is missing.
    ///
    /// Existence is decided by exact name, so running the same catalog
    /// again creates nothing. A create that loses a race against another
    /// worker is treated as success once the entity can be fetched.
    pub async fn ensure(&self, catalog: &[EntitySpec]) -> E2eResult<DataContext> {
        let connection = self.live.connection_info();
        let guard = ProductionSafetyGuard::new(ExecutionMode::Production, self.naming.clone(), &connection);

        let mut created: Vec<(EntityCategory, EntityRecord)> = Vec::new();
        let data = match self.ensure_catalog(&guard, catalog, &mut created).await {
            Ok(data) => data,
            Err(e) => {
                // Entities created before the failure are still ours to remove.
                if !created.is_empty() {
                    let partial = created.len();
                    if let Err(cleanup_err) = (self.cleanup_action(guard, created))().await {
                        warn!(
                            catalog = %self.catalog_name,
                            created = partial,
                            error = %cleanup_err,
                            "Cleanup after partial ensure"
                        );
                    }
                }
                return Err(e);
            }
        };

        info!(
            catalog = %self.catalog_name,
            entities = data.len(),
            created = created.len(),
            host = %connection.host,
            "Production catalog ensured"
        );

        let ctx = DataContext::builder(
            ExecutionMode::Production,
            ContextSource::Catalog {
                name: self.catalog_name.clone(),
                created: created.len(),
            },
        )
        .test_data(data)
        .connection(connection)
        .naming(self.naming.clone())
        .on_cleanup(self.cleanup_action(guard, created))
        .build();

        if let Err(e) = ctx.check_invariants() {
            if let Err(cleanup_err) = ctx.cleanup().await {
                warn!(catalog = %self.catalog_name, error = %cleanup_err, "Cleanup after failed ensure");
            }
            return Err(e);
        }
        Ok(ctx)
    }

    async fn ensure_catalog(
        &self,
        guard: &ProductionSafetyGuard,
        catalog: &[EntitySpec],
        created: &mut Vec<(EntityCategory, EntityRecord)>,
    ) -> E2eResult<TestDataSet> {
        let mut data = TestDataSet::new();

        for spec in catalog {
            let entity = self.prepare(spec);
            let (record, was_created) = self
                .ensure_one(guard, spec.category, &entity)
                .await
                .map_err(|e| self.ensure_error(spec.category, &entity.name, e))?;

            if was_created {
                created.push((spec.category, record.clone()));
            }
            data.push(spec.category, record);
        }

        for spec in catalog {
            let name = self.naming.apply(&spec.name);
            let present = self
                .retry
                .execute("confirm entity", || self.find(spec.category, &name))
                .await
                .map_err(|e| self.ensure_error(spec.category, &name, e))?;
            if present.is_empty() {
                return Err(self.ensure_error(
                    spec.category,
                    &name,
                    E2eError::Step("entity not present after ensure".into()),
                ));
            }
        }
        Ok(data)
    }

    fn prepare(&self, spec: &EntitySpec) -> NewEntity {
        let email = spec.email.as_ref().map(|email| {
            match email.split_once('@') {
                Some((local, domain)) if !self.naming.is_compliant(email) => {
                    self.naming.apply_email(local, domain)
                }
                _ => email.clone(),
            }
        });
        NewEntity {
            name: self.naming.apply(&spec.name),
            email,
            location: spec.location.clone(),
            attributes: Default::default(),
            is_test_data: true,
        }
    }

    async fn ensure_one(
        &self,
        guard: &ProductionSafetyGuard,
        category: EntityCategory,
        entity: &NewEntity,
    ) -> E2eResult<(EntityRecord, bool)> {
        let this = self;
        let existing = self
            .retry
            .execute("existence check", move || this.find(category, &entity.name))
            .await?;
        if let Some(record) = self.pick(category, existing) {
            debug!(category = %category, name = %entity.name, "Synthetic entity already present");
            return Ok((record, false));
        }

        guard.validate(&MutatingOperation::new("create", category.kind(), &entity.name))?;

        self.retry
            .execute("create entity", move || async move {
                // Another worker may have created it since the first check.
                if let Some(record) = this.pick(category, this.find(category, &entity.name).await?) {
                    return Ok((record, false));
                }
                match this.timed("create", this.live.create(category, entity)).await {
                    Ok(record) => {
                        info!(category = %category, name = %entity.name, "Created synthetic entity");
                        Ok((record, true))
                    }
                    Err(E2eError::Duplicate { .. }) => {
                        debug!(category = %category, name = %entity.name, "Lost create race, refetching");
                        this.pick(category, this.find(category, &entity.name).await?)
                            .map(|record| (record, false))
                            .ok_or_else(|| {
                                E2eError::Step("duplicate reported but entity not found".into())
                            })
                    }
                    Err(e) => Err(e),
                }
            })
            .await
    }

    fn pick(&self, category: EntityCategory, mut found: Vec<EntityRecord>) -> Option<EntityRecord> {
        if found.len() > 1 {
            warn!(
                category = %category,
                name = %found[0].name,
                count = found.len(),
                "Multiple synthetic entities share a name, using the first"
            );
        }
        if found.is_empty() {
            None
        } else {
            Some(found.swap_remove(0))
        }
    }

    async fn find(&self, category: EntityCategory, name: &str) -> E2eResult<Vec<EntityRecord>> {
        self.timed("existence check", self.live.find_by_name(category, name))
            .await
    }

    async fn timed<T>(&self, operation: &str, fut: impl Future<Output = E2eResult<T>>) -> E2eResult<T> {
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .unwrap_or_else(|_| {
                Err(E2eError::Timeout {
                    operation: operation.to_string(),
                    millis: self.request_timeout.as_millis() as u64,
                })
            })
    }

    fn ensure_error(&self, category: EntityCategory, name: &str, error: E2eError) -> E2eError {
        match error {
            E2eError::SafetyViolation { .. } | E2eError::EntityEnsure { .. } => error,
            other => E2eError::EntityEnsure {
                catalog: self.catalog_name.clone(),
                target_kind: category.kind().to_string(),
                name: name.to_string(),
                reason: other.to_string(),
            },
        }
    }

    fn cleanup_action(
        &self,
        guard: ProductionSafetyGuard,
        created: Vec<(EntityCategory, EntityRecord)>,
    ) -> impl FnOnce() -> futures::future::BoxFuture<'static, E2eResult<()>> + Send + 'static {
        let policy = self.cleanup_policy;
        let live = Arc::clone(&self.live);
        let retry = self.retry.clone();
        let catalog = self.catalog_name.clone();

        move || {
            async move {
                if policy == CleanupPolicy::Preserve || created.is_empty() {
                    debug!(%catalog, created = created.len(), "Preserving synthetic entities");
                    return Ok(());
                }

                let mut failures = Vec::new();
                for (category, record) in created.iter().rev() {
                    let op = MutatingOperation::new("delete", category.kind(), &record.name);
                    let result = guard
                        .guarded(&op, || retry.execute("delete entity", || live.delete(*category, &record.id)))
                        .await;
                    match result {
                        Ok(()) => debug!(category = %category, name = %record.name, "Removed synthetic entity"),
                        Err(e) => failures.push(format!("{} '{}': {}", category.kind(), record.name, e)),
                    }
                }

                if failures.is_empty() {
                    info!(%catalog, removed = created.len(), "Synthetic entities removed");
                    Ok(())
                } else {
                    Err(E2eError::Cleanup {
                        mode: ExecutionMode::Production,
                        details: failures.join("; "),
                    })
                }
            }
            .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::MemoryLiveSystem;

    fn provider(live: Arc<MemoryLiveSystem>, cleanup_policy: CleanupPolicy) -> ProductionTestDataProvider {
        let config = ProductionConfig {
            cleanup_policy,
            ..ProductionConfig::default()
        };
        ProductionTestDataProvider::new(live, &config, RetryPolicy::new(3, Duration::from_millis(1)))
    }

    #[test]
    fn test_default_catalog_is_marked() {
        let naming = NamingConvention::default();
        let catalog = default_catalog(&naming, &["Toontown".to_string()]);
        assert_eq!(catalog.len(), LOONEY_TUNES_CUSTOMERS.len() + 1);
        assert!(catalog.iter().all(|s| naming.is_compliant(&s.name)));
        assert_eq!(catalog[0].name, "Bugs Bunny - looneyTunesTest");
        assert_eq!(catalog[0].email.as_deref(), Some("bugs.bunny+looneyTunesTest@fieldops.test"));
        let route = catalog.last().unwrap();
        assert_eq!(route.category, EntityCategory::Routes);
        assert_eq!(route.location.as_deref(), Some("Toontown"));
    }

    #[tokio::test]
    async fn test_unmarked_spec_name_gets_marker() {
        let live = Arc::new(MemoryLiveSystem::new());
        let ctx = provider(live.clone(), CleanupPolicy::Preserve)
            .ensure(&[EntitySpec::new(EntityCategory::Customers, "Marvin Martian")
                .with_email("marvin@mars.test")])
            .await
            .unwrap();

        let record = &ctx.test_data().get(EntityCategory::Customers)[0];
        assert_eq!(record.name, "Marvin Martian - looneyTunesTest");
        assert_eq!(record.email.as_deref(), Some("marvin+looneyTunesTest@mars.test"));
        assert!(record.is_test_data);
    }

    #[tokio::test]
    async fn test_existing_entity_is_reused() {
        let live = Arc::new(MemoryLiveSystem::new());
        live.seed(
            EntityCategory::Customers,
            EntityRecord::new("pre-1", "Bugs Bunny - looneyTunesTest", true),
        );

        let ctx = provider(live.clone(), CleanupPolicy::Preserve)
            .ensure(&[EntitySpec::new(EntityCategory::Customers, "Bugs Bunny - looneyTunesTest")])
            .await
            .unwrap();

        assert_eq!(live.create_calls(), 0);
        assert_eq!(ctx.test_data().get(EntityCategory::Customers)[0].id, "pre-1");
        assert_eq!(ctx.source(), &ContextSource::Catalog { name: "default".into(), created: 0 });
    }

    #[tokio::test]
    async fn test_unflagged_existing_entity_fails_invariant() {
        let live = Arc::new(MemoryLiveSystem::new());
        live.seed(
            EntityCategory::Customers,
            EntityRecord::new("pre-1", "Bugs Bunny - looneyTunesTest", false),
        );

        let err = provider(live, CleanupPolicy::Preserve)
            .ensure(&[EntitySpec::new(EntityCategory::Customers, "Bugs Bunny")])
            .await
            .unwrap_err();
        assert!(matches!(err, E2eError::EntityEnsure { .. }));
    }

    #[tokio::test]
    async fn test_lost_race_is_benign() {
        let live = Arc::new(MemoryLiveSystem::new());
        live.lose_next_create_race();

        let ctx = provider(live.clone(), CleanupPolicy::Preserve)
            .ensure(&[EntitySpec::new(EntityCategory::Routes, "Toontown Route")])
            .await
            .unwrap();

        assert_eq!(live.count_named(EntityCategory::Routes, "Toontown Route - looneyTunesTest"), 1);
        assert_eq!(ctx.test_data().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let live = Arc::new(MemoryLiveSystem::new());
        live.fail_next(2);

        provider(live.clone(), CleanupPolicy::Preserve)
            .ensure(&[EntitySpec::new(EntityCategory::Customers, "Daffy Duck")])
            .await
            .unwrap();
        assert_eq!(live.count_named(EntityCategory::Customers, "Daffy Duck - looneyTunesTest"), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_entity_ensure() {
        let live = Arc::new(MemoryLiveSystem::new());
        live.fail_next(100);

        let err = provider(live, CleanupPolicy::Preserve)
            .with_catalog_name("smoke")
            .ensure(&[EntitySpec::new(EntityCategory::Customers, "Porky Pig")])
            .await
            .unwrap_err();
        match err {
            E2eError::EntityEnsure { catalog, target_kind, name, .. } => {
                assert_eq!(catalog, "smoke");
                assert_eq!(target_kind, "customer");
                assert_eq!(name, "Porky Pig - looneyTunesTest");
            }
            other => panic!("expected entity ensure error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unflagged_connection_blocks_create() {
        let live = Arc::new(MemoryLiveSystem::unflagged());
        let err = provider(live.clone(), CleanupPolicy::Preserve)
            .ensure(&[EntitySpec::new(EntityCategory::Customers, "Elmer Fudd")])
            .await
            .unwrap_err();
        assert!(matches!(err, E2eError::SafetyViolation { .. }));
        assert_eq!(live.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_remove_policy_deletes_only_created() {
        let live = Arc::new(MemoryLiveSystem::new());
        live.seed(
            EntityCategory::Customers,
            EntityRecord::new("pre-1", "Bugs Bunny - looneyTunesTest", true),
        );

        let ctx = provider(live.clone(), CleanupPolicy::Remove)
            .ensure(&[
                EntitySpec::new(EntityCategory::Customers, "Bugs Bunny"),
                EntitySpec::new(EntityCategory::Customers, "Tweety Bird"),
            ])
            .await
            .unwrap();
        assert_eq!(live.all(EntityCategory::Customers).len(), 2);

        ctx.cleanup().await.unwrap();
        let remaining = live.all(EntityCategory::Customers);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "pre-1");
        assert_eq!(live.delete_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_ensure_removes_what_it_created() {
        let live = Arc::new(MemoryLiveSystem::new());
        live.reject_create("Daffy Duck - looneyTunesTest");

        let err = provider(live.clone(), CleanupPolicy::Remove)
            .ensure(&[
                EntitySpec::new(EntityCategory::Customers, "Bugs Bunny"),
                EntitySpec::new(EntityCategory::Customers, "Daffy Duck"),
            ])
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "entity_ensure");
        assert!(err.to_string().contains("Daffy Duck"));
        assert_eq!(live.count_named(EntityCategory::Customers, "Bugs Bunny - looneyTunesTest"), 0);
        assert_eq!(live.delete_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_ensure_keeps_preexisting_entities() {
        let live = Arc::new(MemoryLiveSystem::new());
        live.seed(
            EntityCategory::Customers,
            EntityRecord::new("pre-1", "Bugs Bunny - looneyTunesTest", true),
        );
        live.reject_create("Daffy Duck - looneyTunesTest");

        provider(live.clone(), CleanupPolicy::Remove)
            .ensure(&[
                EntitySpec::new(EntityCategory::Customers, "Bugs Bunny"),
                EntitySpec::new(EntityCategory::Customers, "Daffy Duck"),
            ])
            .await
            .unwrap_err();

        assert_eq!(live.count_named(EntityCategory::Customers, "Bugs Bunny - looneyTunesTest"), 1);
        assert_eq!(live.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_preserve_policy_keeps_everything() {
        let live = Arc::new(MemoryLiveSystem::new());
        let ctx = provider(live.clone(), CleanupPolicy::Preserve)
            .ensure(&[EntitySpec::new(EntityCategory::Customers, "Tweety Bird")])
            .await
            .unwrap();
        ctx.cleanup().await.unwrap();
        assert_eq!(live.delete_calls(), 0);
        assert_eq!(live.all(EntityCategory::Customers).len(), 1);
    }
}
