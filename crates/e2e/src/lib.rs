//! FieldOps E2E Data Lifecycle
//!
//! This crate decides, per scenario, whether the FieldOps UI suite runs
//! against a disposable fixture database or against the live system, and
//! hands page objects a data context built for that mode:
//! - Resolves the mode from scenario tags and the environment
//! - Restores named fixture bundles into a scratch SQLite store (isolated)
//! - Ensures marked synthetic entities exist in the live system (production)
//! - Refuses production mutations of anything that lacks the naming marker
//! - Guarantees exactly one cleanup per scenario, whatever the outcome
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                ScenarioController (Before/After)            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ModeDetector                                               │
//! │    └── detect(tags, env) -> TestMode                        │
//! │  IsolatedDataProvider                                       │
//! │    └── load(dataset) -> DataContext     (fixture restore)   │
//! │  ProductionTestDataProvider                                 │
//! │    └── ensure(catalog) -> DataContext   (idempotent create) │
//! │  RetryExecutor            (timeouts, connection errors)     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  DataContext                                                │
//! │    ├── mode, test_data, connection_info, metadata           │
//! │    ├── ProductionSafetyGuard::validate(operation)           │
//! │    └── cleanup()                        (exactly once)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Page objects: ContextAware + BrowserDriver                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod context;
pub mod env;
pub mod error;
pub mod isolated;
pub mod lifecycle;
pub mod live;
pub mod mode;
pub mod page;
pub mod production;
pub mod retry;
pub mod runner;
pub mod safety;

pub use config::{CleanupPolicy, HarnessConfig};
pub use context::{ContextSource, DataContext};
pub use env::{EnvironmentView, MapEnv, ProcessEnv};
pub use error::{E2eError, E2eResult};
pub use isolated::IsolatedDataProvider;
pub use lifecycle::{ScenarioController, ScenarioInfo, ScenarioOutcome, ScenarioPhase, ScenarioSession};
pub use live::{HttpLiveSystem, LiveSystem, MemoryLiveSystem};
pub use mode::{ModeDetector, ScenarioTags};
pub use page::{BrowserDriver, ContextAware, EntityListPage, PageContext};
pub use production::{default_catalog, EntitySpec, ProductionTestDataProvider};
pub use retry::{RetryExecutor, RetryPolicy};
pub use runner::{ScenarioCase, ScenarioRunner, SuiteReport};
pub use safety::{MutatingOperation, ProductionSafetyGuard};
