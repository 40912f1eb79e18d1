//! Isolated mode: fixture bundles restored into a scratch SQLite store

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use fieldops_common::{
    digest_hex, ConnectionInfo, Database, EntityCategory, EntityRecord, ExecutionMode, TestDataSet,
};

use crate::config::IsolatedConfig;
use crate::context::{ContextSource, DataContext};
use crate::error::{E2eError, E2eResult};
use crate::retry::{RetryExecutor, RetryPolicy};

const FIXTURE_EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];

/// A named dataset on disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureBundle {
    #[serde(default)]
    pub description: Option<String>,

    /// Records keyed by category name (`customers` or `customer`)
    #[serde(default)]
    pub records: BTreeMap<String, Vec<EntityRecord>>,

    /// Checks run after restore; derived from `records` when empty
    #[serde(default)]
    pub verify: Vec<VerificationQuery>,
}

/// Post-restore check against the scratch store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerificationQuery {
    RowCount { category: EntityCategory, expected: i64 },
    MinRowCount { category: EntityCategory, min: i64 },
    KeyLookup { category: EntityCategory, name: String },
    Scalar { sql: String, expected: i64 },
}

impl VerificationQuery {
    fn run(&self, db: &Database) -> E2eResult<Option<String>> {
        let failure = match self {
            VerificationQuery::RowCount { category, expected } => {
                let actual = db.count(*category)?;
                (actual != *expected)
                    .then(|| format!("{} row count {} != expected {}", category, actual, expected))
            }
            VerificationQuery::MinRowCount { category, min } => {
                let actual = db.count(*category)?;
                (actual < *min).then(|| format!("{} row count {} < minimum {}", category, actual, min))
            }
            VerificationQuery::KeyLookup { category, name } => db
                .get_by_name(*category, name)?
                .is_none()
                .then(|| format!("{} '{}' not found", category.kind(), name)),
            VerificationQuery::Scalar { sql, expected } => {
                let actual = db.scalar(sql)?;
                (actual != *expected).then(|| format!("`{}` returned {} != expected {}", sql, actual, expected))
            }
        };
        Ok(failure)
    }
}

/// Fixture found in the fixtures directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureEntry {
    pub name: String,
    pub path: PathBuf,
}

struct Restored {
    digest: String,
    data: TestDataSet,
}

/// Scratch database owned by exactly one context
struct ScratchStore {
    db: Database,
    path: PathBuf,
    restore_lock: Arc<tokio::sync::Mutex<()>>,
    dir: tempfile::TempDir,
}

impl ScratchStore {
    fn create(scratch_root: Option<&Path>) -> E2eResult<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("fieldops-scratch-");
        let dir = match scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        let path = dir.path().join("scratch.db");
        let db = Database::open(&path)?;

        Ok(Self {
            db,
            path,
            restore_lock: Arc::new(tokio::sync::Mutex::new(())),
            dir,
        })
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: "localhost".to_string(),
            database: self.path.display().to_string(),
            is_test_connection: true,
        }
    }

    /// Empty the store and delete its directory
    fn discard(self) -> E2eResult<()> {
        self.db.clear()?;
        drop(self.db);
        self.dir.close()?;
        Ok(())
    }

    /// [`ScratchStore::discard`] off the async threads, after any restore
    /// still writing to the store has let go of it
    async fn release(self) -> E2eResult<()> {
        let permit = self.restore_lock.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            self.discard()
        })
        .await
        .map_err(|e| E2eError::Step(format!("scratch discard task failed: {}", e)))?
    }
}

/// Builds isolated contexts from fixture bundles
#[derive(Debug, Clone)]
pub struct IsolatedDataProvider {
    config: IsolatedConfig,
    retry: RetryExecutor,
}

impl IsolatedDataProvider {
    /// Missing fixtures and failed verification are retried alongside
    /// transient errors, up to the policy's attempt budget.
    pub fn new(config: IsolatedConfig, policy: RetryPolicy) -> Self {
        let policy = policy.retrying(|e: &E2eError| {
            e.is_transient()
                || matches!(
                    e,
                    E2eError::FixtureNotFound { .. } | E2eError::FixtureVerification { .. }
                )
        });
        Self {
            config,
            retry: RetryExecutor::new(policy),
        }
    }

    pub fn config(&self) -> &IsolatedConfig {
        &self.config
    }

    /// Restore `dataset` into a fresh scratch store and verify it
    pub async fn load(&self, dataset: &str) -> E2eResult<DataContext> {
        let store = ScratchStore::create(self.config.scratch_dir.as_deref())?;
        let store_ref = &store;

        let restored = self
            .retry
            .execute("fixture restore", || self.restore_once(dataset, store_ref))
            .await;

        let restored = match restored {
            Ok(restored) => restored,
            Err(e) => {
                if let Err(discard_err) = store.release().await {
                    warn!(dataset, error = %discard_err, "Failed to discard scratch store");
                }
                return Err(e);
            }
        };

        info!(
            dataset,
            digest = %restored.digest,
            records = restored.data.len(),
            store = %store.path.display(),
            "Fixture restored"
        );

        let connection = store.connection_info();
        let label = dataset.to_string();
        Ok(DataContext::builder(
            ExecutionMode::Isolated,
            ContextSource::Fixture {
                dataset: dataset.to_string(),
                digest: restored.digest,
            },
        )
        .test_data(restored.data)
        .connection(connection)
        .on_cleanup(move || {
            async move {
                store.release().await?;
                debug!(dataset = %label, "Scratch store discarded");
                Ok(())
            }
            .boxed()
        })
        .build())
    }

    /// One restore + verify attempt, bounded by the restore timeout
    async fn restore_once(&self, dataset: &str, store: &ScratchStore) -> E2eResult<Restored> {
        let path = self.locate(dataset)?;
        // The permit travels into the blocking task, so an attempt that
        // timed out still holds the store until it actually finishes.
        let permit = store.restore_lock.clone().lock_owned().await;
        let db = store.db.clone();
        let name = dataset.to_string();

        let work = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            restore_blocking(&db, &name, &path)
        });

        let timeout = self.config.restore_timeout();
        match tokio::time::timeout(timeout, work).await {
            Ok(joined) => {
                joined.map_err(|e| E2eError::Step(format!("restore task failed: {}", e)))?
            }
            Err(_) => Err(E2eError::Timeout {
                operation: format!("restore fixture '{}'", dataset),
                millis: timeout.as_millis() as u64,
            }),
        }
    }

    /// Path of the bundle for `dataset`
    pub fn locate(&self, dataset: &str) -> E2eResult<PathBuf> {
        let not_found = || E2eError::FixtureNotFound {
            dataset: dataset.to_string(),
            searched: self.config.fixtures_dir.clone(),
        };

        if dataset.is_empty() || dataset.contains(['/', '\\']) || dataset.starts_with('.') {
            return Err(not_found());
        }

        FIXTURE_EXTENSIONS
            .iter()
            .map(|ext| self.config.fixtures_dir.join(format!("{}.{}", dataset, ext)))
            .find(|p| p.is_file())
            .ok_or_else(not_found)
    }

    /// Bundles available in the fixtures directory, sorted by name
    pub fn list_fixtures(&self) -> E2eResult<Vec<FixtureEntry>> {
        if !self.config.fixtures_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.config.fixtures_dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| E2eError::Step(format!("fixture scan failed: {}", e)))?;
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
            if !entry.file_type().is_file() || !FIXTURE_EXTENSIONS.contains(&ext) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                entries.push(FixtureEntry {
                    name: stem.to_string(),
                    path: path.to_path_buf(),
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

/// Parse a bundle from raw bytes, choosing the format by extension
pub fn parse_bundle(path: &Path, bytes: &[u8]) -> E2eResult<FixtureBundle> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => Ok(serde_yaml::from_slice(bytes)?),
        _ => Ok(serde_json::from_slice(bytes)?),
    }
}

fn restore_blocking(db: &Database, dataset: &str, path: &Path) -> E2eResult<Restored> {
    let bytes = std::fs::read(path)?;
    let digest = digest_hex(&bytes);
    let bundle = parse_bundle(path, &bytes)?;

    let mut grouped: BTreeMap<EntityCategory, Vec<EntityRecord>> = BTreeMap::new();
    for (name, records) in bundle.records {
        let category: EntityCategory = name.parse()?;
        grouped.entry(category).or_default().extend(records);
    }

    db.clear()?;
    for (category, records) in &grouped {
        db.insert_records(*category, records)?;
    }
    db.kv_set("fixture", dataset)?;
    db.kv_set("digest", &digest)?;

    let checks = if bundle.verify.is_empty() {
        grouped
            .iter()
            .map(|(category, records)| VerificationQuery::RowCount {
                category: *category,
                expected: records.len() as i64,
            })
            .collect()
    } else {
        bundle.verify
    };

    for check in &checks {
        if let Some(failure) = check.run(db)? {
            return Err(E2eError::FixtureVerification {
                dataset: dataset.to_string(),
                check: failure,
            });
        }
    }
    debug!(dataset, checks = checks.len(), "Fixture verification passed");

    let mut data = TestDataSet::new();
    for category in grouped.keys() {
        data.insert(*category, db.list(*category)?);
    }

    Ok(Restored { digest, data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const CUSTOMERS: &str = r#"{
        "description": "two customers",
        "records": {
            "customers": [
                {"id": "c1", "name": "Acme Plumbing", "isTestData": true},
                {"id": "c2", "name": "Globex HVAC", "isTestData": true}
            ]
        },
        "verify": [
            {"kind": "row_count", "category": "customers", "expected": 2},
            {"kind": "key_lookup", "category": "customers", "name": "Globex HVAC"}
        ]
    }"#;

    fn provider(fixtures: &Path, scratch: &Path, attempts: u32) -> IsolatedDataProvider {
        paced_provider(fixtures, scratch, attempts, Duration::from_millis(1))
    }

    fn paced_provider(fixtures: &Path, scratch: &Path, attempts: u32, base: Duration) -> IsolatedDataProvider {
        IsolatedDataProvider::new(
            IsolatedConfig {
                fixtures_dir: fixtures.to_path_buf(),
                scratch_dir: Some(scratch.to_path_buf()),
                ..IsolatedConfig::default()
            },
            RetryPolicy::new(attempts, base),
        )
    }

    /// Write `contents` to `path` after `after` has elapsed
    fn write_later(path: PathBuf, contents: &'static str, after: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            std::fs::write(path, contents).unwrap();
        })
    }

    const SHORT_ROUTES: &str = r#"
records:
  route:
    - { id: r1, name: North Loop, is_test_data: true }
verify:
  - { kind: min_row_count, category: routes, min: 3 }
"#;

    const FULL_ROUTES: &str = r#"
records:
  route:
    - { id: r1, name: North Loop, is_test_data: true }
    - { id: r2, name: South Loop, is_test_data: true }
    - { id: r3, name: Harbor Run, is_test_data: true }
verify:
  - { kind: min_row_count, category: routes, min: 3 }
"#;

    #[tokio::test]
    async fn test_load_restores_and_verifies() {
        let fixtures = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(fixtures.path().join("customers-basic.json"), CUSTOMERS).unwrap();

        let ctx = provider(fixtures.path(), scratch.path(), 3)
            .load("customers-basic")
            .await
            .unwrap();

        assert_eq!(ctx.mode(), ExecutionMode::Isolated);
        assert!(ctx.connection_info().is_test_connection);
        assert_eq!(ctx.test_data().get(EntityCategory::Customers).len(), 2);
        match ctx.source() {
            ContextSource::Fixture { dataset, digest } => {
                assert_eq!(dataset, "customers-basic");
                assert_eq!(digest, &digest_hex(CUSTOMERS.as_bytes()));
            }
            other => panic!("unexpected source {:?}", other),
        }

        let db_path = PathBuf::from(&ctx.connection_info().database);
        assert!(db_path.exists());
        ctx.cleanup().await.unwrap();
        assert!(!db_path.exists());
    }

    #[tokio::test]
    async fn test_missing_fixture_is_not_found() {
        let fixtures = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();

        let err = provider(fixtures.path(), scratch.path(), 3)
            .load("empty-database")
            .await
            .unwrap_err();
        assert!(matches!(err, E2eError::FixtureNotFound { ref dataset, .. } if dataset == "empty-database"));

        // Failed loads leave no scratch stores behind.
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_fixture_published_during_backoff_is_restored() {
        let fixtures = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let writer = write_later(
            fixtures.path().join("customers-basic.json"),
            CUSTOMERS,
            Duration::from_millis(50),
        );

        let ctx = paced_provider(fixtures.path(), scratch.path(), 3, Duration::from_millis(200))
            .load("customers-basic")
            .await
            .unwrap();
        writer.await.unwrap();

        assert_eq!(ctx.test_data().get(EntityCategory::Customers).len(), 2);
        ctx.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_single_attempt_does_not_wait_for_fixture() {
        let fixtures = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let writer = write_later(
            fixtures.path().join("customers-basic.json"),
            CUSTOMERS,
            Duration::from_millis(50),
        );

        let started = std::time::Instant::now();
        let err = paced_provider(fixtures.path(), scratch.path(), 1, Duration::from_millis(200))
            .load("customers-basic")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "fixture_not_found");
        assert!(started.elapsed() < Duration::from_millis(200));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_fixture_spends_every_attempt() {
        let fixtures = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();

        // Three attempts wait 40ms then 80ms between them.
        let started = std::time::Instant::now();
        let err = paced_provider(fixtures.path(), scratch.path(), 3, Duration::from_millis(40))
            .load("empty-database")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "fixture_not_found");
        assert!(started.elapsed() >= Duration::from_millis(120));
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_verification_failure_is_retried() {
        let fixtures = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let path = fixtures.path().join("routes.yaml");
        std::fs::write(&path, SHORT_ROUTES).unwrap();
        let writer = write_later(path, FULL_ROUTES, Duration::from_millis(50));

        let ctx = paced_provider(fixtures.path(), scratch.path(), 3, Duration::from_millis(200))
            .load("routes")
            .await
            .unwrap();
        writer.await.unwrap();

        assert_eq!(ctx.test_data().get(EntityCategory::Routes).len(), 3);
        ctx.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_verification_mismatch_fails() {
        let fixtures = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(fixtures.path().join("routes.yaml"), SHORT_ROUTES).unwrap();

        let err = provider(fixtures.path(), scratch.path(), 2)
            .load("routes")
            .await
            .unwrap_err();
        match err {
            E2eError::FixtureVerification { dataset, check } => {
                assert_eq!(dataset, "routes");
                assert!(check.contains("minimum 3"));
            }
            other => panic!("expected verification failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_derived_checks_and_scalar() {
        let fixtures = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(
            fixtures.path().join("flagged.json"),
            r#"{
                "records": {"tickets": [{"id": "t1", "name": "Leak", "isTestData": true}]},
                "verify": [{"kind": "scalar", "sql": "SELECT COUNT(*) FROM entities WHERE is_test_data = 1", "expected": 1}]
            }"#,
        )
        .unwrap();
        std::fs::write(
            fixtures.path().join("derived.json"),
            r#"{"records": {"locations": [{"id": "l1", "name": "Depot"}]}}"#,
        )
        .unwrap();

        let p = provider(fixtures.path(), scratch.path(), 1);
        let flagged = p.load("flagged").await.unwrap();
        let derived = p.load("derived").await.unwrap();
        assert_eq!(derived.test_data().get(EntityCategory::Locations)[0].name, "Depot");
        assert_ne!(flagged.connection_info(), derived.connection_info());
        flagged.cleanup().await.unwrap();
        derived.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_restores_into_one_store_serialize() {
        let fixtures = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(fixtures.path().join("customers-basic.json"), CUSTOMERS).unwrap();

        let p = provider(fixtures.path(), scratch.path(), 1);
        let store = ScratchStore::create(Some(scratch.path())).unwrap();
        let (a, b) = tokio::join!(
            p.restore_once("customers-basic", &store),
            p.restore_once("customers-basic", &store)
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(store.db.count(EntityCategory::Customers).unwrap(), 2);
        store.discard().unwrap();
    }

    #[test]
    fn test_list_and_locate() {
        let fixtures = tempfile::tempdir().unwrap();
        std::fs::write(fixtures.path().join("default.yaml"), "records: {}").unwrap();
        std::fs::write(fixtures.path().join("customers-basic.json"), CUSTOMERS).unwrap();
        std::fs::write(fixtures.path().join("README.md"), "notes").unwrap();

        let p = provider(fixtures.path(), fixtures.path(), 1);
        let names: Vec<_> = p.list_fixtures().unwrap().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["customers-basic", "default"]);

        assert!(p.locate("default").unwrap().ends_with("default.yaml"));
        assert!(p.locate("../etc/passwd").is_err());
    }
}
