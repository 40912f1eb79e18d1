//! Per-scenario data context handed to page objects

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use fieldops_common::{
    ConnectionInfo, EntityCategory, ExecutionMode, NamingConvention, TestDataSet, TestMetadata,
    TestMode,
};

use crate::error::{E2eError, E2eResult};
use crate::safety::{MutatingOperation, ProductionSafetyGuard};

/// Deferred teardown work for a context
pub type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, E2eResult<()>> + Send>;

/// Where a context's data came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextSource {
    /// Restored fixture bundle
    Fixture { dataset: String, digest: String },
    /// Ensured production catalog
    Catalog { name: String, created: usize },
}

impl ContextSource {
    /// Dataset or catalog name, for error messages
    pub fn label(&self) -> &str {
        match self {
            ContextSource::Fixture { dataset, .. } => dataset,
            ContextSource::Catalog { name, .. } => name,
        }
    }
}

struct ContextState {
    mode: ExecutionMode,
    test_data: TestDataSet,
    connection: ConnectionInfo,
    metadata: TestMetadata,
    source: ContextSource,
}

/// Holds the teardown action; the last context handle to drop runs any
/// cleanup that the scenario hook never reached.
struct CleanupSlot {
    mode: ExecutionMode,
    label: String,
    action: Mutex<Option<CleanupFn>>,
}

impl CleanupSlot {
    fn take(&self) -> Option<CleanupFn> {
        self.action.lock().take()
    }
}

impl Drop for CleanupSlot {
    fn drop(&mut self) {
        let Some(action) = self.action.get_mut().take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    mode = %self.mode,
                    source = %self.label,
                    "Context dropped before teardown, scheduling cleanup"
                );
                let mode = self.mode;
                handle.spawn(async move {
                    if let Err(e) = action().await {
                        warn!(%mode, error = %e, "Deferred cleanup failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    mode = %self.mode,
                    source = %self.label,
                    "Context dropped outside a runtime, cleanup could not run"
                );
            }
        }
    }
}

/// Mode, dataset, connection and metadata for one scenario.
///
/// Clones share the same cleanup slot, so teardown happens once no matter
/// how many page objects hold a handle.
#[derive(Clone)]
pub struct DataContext {
    state: Arc<ContextState>,
    cleanup: Arc<CleanupSlot>,
    guard: ProductionSafetyGuard,
}

impl std::fmt::Debug for DataContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataContext")
            .field("mode", &self.state.mode)
            .field("source", &self.state.source)
            .field("connection", &self.state.connection)
            .field("records", &self.state.test_data.len())
            .field("run_id", &self.state.metadata.test_run_id)
            .finish()
    }
}

impl DataContext {
    pub fn builder(mode: ExecutionMode, source: ContextSource) -> DataContextBuilder {
        DataContextBuilder {
            mode,
            source,
            test_data: TestDataSet::new(),
            connection: None,
            naming: NamingConvention::default(),
            run_id: Uuid::new_v4(),
            cleanup: None,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.state.mode
    }

    pub fn test_mode(&self) -> TestMode {
        self.state.mode.into()
    }

    pub fn test_data(&self) -> &TestDataSet {
        &self.state.test_data
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.state.connection
    }

    pub fn metadata(&self) -> &TestMetadata {
        &self.state.metadata
    }

    pub fn source(&self) -> &ContextSource {
        &self.state.source
    }

    pub fn naming(&self) -> &NamingConvention {
        self.guard.naming()
    }

    pub fn safety_guard(&self) -> &ProductionSafetyGuard {
        &self.guard
    }

    /// Check a mutation against this context's guard
    pub fn guard_mutation(&self, operation: &MutatingOperation) -> E2eResult<()> {
        self.guard.validate(operation)
    }

    /// Mode-appropriate sanity check for a page working on `category`.
    ///
    /// Production needs at least one marked test entity in the category and
    /// no unmarked entity anywhere; isolated needs a test connection.
    pub fn validate_for(&self, category: EntityCategory) -> bool {
        match self.state.mode {
            ExecutionMode::Isolated => self.state.connection.is_test_connection,
            ExecutionMode::Production => {
                let naming = self.naming();
                self.check_invariants().is_ok()
                    && self
                        .state
                        .test_data
                        .get(category)
                        .iter()
                        .any(|r| r.is_test_data && naming.is_compliant(&r.name))
            }
        }
    }

    /// Production invariant: every record is flagged and marked
    pub fn check_invariants(&self) -> E2eResult<()> {
        if self.state.mode.is_isolated() {
            return Ok(());
        }
        let naming = self.naming();
        for (category, record) in self.state.test_data.iter() {
            if let Err(violation) = naming.check_record(record) {
                return Err(E2eError::EntityEnsure {
                    catalog: self.state.source.label().to_string(),
                    target_kind: category.kind().to_string(),
                    name: record.name.clone(),
                    reason: violation.to_string(),
                });
            }
        }
        Ok(())
    }

    /// True until [`DataContext::cleanup`] has run
    pub fn cleanup_pending(&self) -> bool {
        self.cleanup.action.lock().is_some()
    }

    /// Run the teardown action. Only the first call does work; later calls
    /// return `Ok(())`.
    ///
    /// The action runs on its own task, so it completes even if the caller
    /// stops waiting.
    pub async fn cleanup(&self) -> E2eResult<()> {
        let Some(action) = self.cleanup.take() else {
            debug!(source = %self.cleanup.label, "Cleanup already done");
            return Ok(());
        };

        debug!(mode = %self.state.mode, source = %self.cleanup.label, "Running cleanup");
        let mode = self.state.mode;
        let outcome = tokio::spawn(action()).await.map_err(|e| E2eError::Cleanup {
            mode,
            details: format!("cleanup task failed: {}", e),
        })?;
        outcome.map_err(|e| match e {
            E2eError::Cleanup { .. } => e,
            other => E2eError::Cleanup {
                mode,
                details: other.to_string(),
            },
        })
    }
}

/// Assembles a [`DataContext`]; providers fill in the data they built
pub struct DataContextBuilder {
    mode: ExecutionMode,
    source: ContextSource,
    test_data: TestDataSet,
    connection: Option<ConnectionInfo>,
    naming: NamingConvention,
    run_id: Uuid,
    cleanup: Option<CleanupFn>,
}

impl DataContextBuilder {
    pub fn test_data(mut self, data: TestDataSet) -> Self {
        self.test_data = data;
        self
    }

    pub fn connection(mut self, connection: ConnectionInfo) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn naming(mut self, naming: NamingConvention) -> Self {
        self.naming = naming;
        self
    }

    pub fn run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn on_cleanup<F>(mut self, action: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, E2eResult<()>> + Send + 'static,
    {
        self.cleanup = Some(Box::new(action));
        self
    }

    pub fn build(self) -> DataContext {
        let connection = self.connection.unwrap_or_else(|| ConnectionInfo {
            host: "localhost".to_string(),
            database: self.source.label().to_string(),
            is_test_connection: self.mode.is_isolated(),
        });
        let guard = ProductionSafetyGuard::new(self.mode, self.naming, &connection);
        let label = self.source.label().to_string();
        // Contexts without teardown work still go through the slot so
        // `cleanup()` behaves the same for every mode.
        let action: CleanupFn = self
            .cleanup
            .unwrap_or_else(|| Box::new(|| futures::future::ready(Ok(())).boxed()));

        DataContext {
            state: Arc::new(ContextState {
                mode: self.mode,
                test_data: self.test_data,
                connection,
                metadata: TestMetadata::new(self.mode, self.run_id),
                source: self.source,
            }),
            cleanup: Arc::new(CleanupSlot {
                mode: self.mode,
                label,
                action: Mutex::new(Some(action)),
            }),
            guard,
        }
    }
}
