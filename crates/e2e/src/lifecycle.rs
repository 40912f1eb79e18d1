//! Scenario lifecycle: detect, build, use, tear down
//!
//! ```text
//! Undetermined -> ModeResolved -> ContextBuilding -> ContextReady -> InUse -> TornDown
//!       |                               |
//!       +---------> Aborted <-----------+
//! ```
//!
//! Every scenario that reaches `ContextReady` ends in `TornDown`, whatever
//! the body did.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use fieldops_common::ExecutionMode;

use crate::config::HarnessConfig;
use crate::context::DataContext;
use crate::env::EnvironmentView;
use crate::error::{E2eError, E2eResult};
use crate::isolated::IsolatedDataProvider;
use crate::live::LiveSystem;
use crate::mode::{ModeDecision, ModeDetector, ScenarioTags};
use crate::production::{default_catalog, EntitySpec, ProductionTestDataProvider};

/// Where a scenario is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioPhase {
    Undetermined,
    ModeResolved,
    ContextBuilding,
    ContextReady,
    InUse,
    TornDown,
    Aborted,
}

impl ScenarioPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioPhase::Undetermined => "undetermined",
            ScenarioPhase::ModeResolved => "mode_resolved",
            ScenarioPhase::ContextBuilding => "context_building",
            ScenarioPhase::ContextReady => "context_ready",
            ScenarioPhase::InUse => "in_use",
            ScenarioPhase::TornDown => "torn_down",
            ScenarioPhase::Aborted => "aborted",
        }
    }

    pub fn can_transition_to(&self, next: ScenarioPhase) -> bool {
        use ScenarioPhase::*;
        matches!(
            (self, next),
            (Undetermined, ModeResolved)
                | (Undetermined, Aborted)
                | (ModeResolved, ContextBuilding)
                | (ContextBuilding, ContextReady)
                | (ContextBuilding, Aborted)
                | (ContextReady, InUse)
                | (ContextReady, TornDown)
                | (InUse, TornDown)
        )
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn advance(&mut self, next: ScenarioPhase) -> E2eResult<()> {
        if !self.can_transition_to(next) {
            return Err(fieldops_common::Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            }
            .into());
        }
        *self = next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScenarioPhase::TornDown | ScenarioPhase::Aborted)
    }
}

impl std::fmt::Display for ScenarioPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name and tags of a scenario, as the runner reports them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioInfo {
    pub name: String,
    pub tags: Vec<String>,
}

impl ScenarioInfo {
    pub fn new<I, S>(name: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }
}

/// A scenario between its `before` and `after` hooks
#[derive(Debug)]
pub struct ScenarioSession {
    scenario: String,
    decision: ModeDecision,
    phase: ScenarioPhase,
    context: DataContext,
    started: Instant,
}

impl ScenarioSession {
    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn decision(&self) -> ModeDecision {
        self.decision
    }

    pub fn phase(&self) -> ScenarioPhase {
        self.phase
    }

    /// Hand the context to page objects and steps
    pub fn enter_use(&mut self) -> E2eResult<DataContext> {
        if self.phase != ScenarioPhase::InUse {
            self.phase.advance(ScenarioPhase::InUse)?;
        }
        Ok(self.context.clone())
    }

    pub fn context(&self) -> &DataContext {
        &self.context
    }
}

/// What teardown did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub scenario: String,
    pub mode: ExecutionMode,
    pub phase: ScenarioPhase,
    /// Cleanup failure, reported beside the scenario result
    pub cleanup_warning: Option<String>,
    pub duration: Duration,
}

/// Complete result of [`ScenarioController::run_scenario`]
#[derive(Debug)]
pub struct ScenarioOutcome<T> {
    pub scenario: String,
    pub mode: Option<ExecutionMode>,
    /// Dataset or catalog the context was built from
    pub source: Option<String>,
    pub phase: ScenarioPhase,
    pub result: E2eResult<T>,
    pub cleanup_warning: Option<String>,
    pub duration: Duration,
}

impl<T> ScenarioOutcome<T> {
    pub fn passed(&self) -> bool {
        self.result.is_ok()
    }
}

/// Drives one scenario at a time through detection, context construction
/// and teardown. Built once per run and shared by all workers.
#[derive(Debug, Clone)]
pub struct ScenarioController {
    detector: ModeDetector,
    isolated: IsolatedDataProvider,
    production: ProductionTestDataProvider,
    catalog: Arc<Vec<EntitySpec>>,
    default_dataset: String,
}

impl ScenarioController {
    pub fn new(
        detector: ModeDetector,
        isolated: IsolatedDataProvider,
        production: ProductionTestDataProvider,
        catalog: Vec<EntitySpec>,
    ) -> Self {
        let default_dataset = isolated.config().default_dataset.clone();
        Self {
            detector,
            isolated,
            production,
            catalog: Arc::new(catalog),
            default_dataset,
        }
    }

    /// Wire the controller from configuration, using the default catalog
    pub fn from_config(
        config: &HarnessConfig,
        env: Arc<dyn EnvironmentView>,
        live: Arc<dyn LiveSystem>,
    ) -> Self {
        let policy = config.retry.policy();
        let production = ProductionTestDataProvider::new(live, &config.production, policy.clone());
        let catalog = default_catalog(production.naming(), &config.production.locations);
        Self::new(
            ModeDetector::new(env),
            IsolatedDataProvider::new(config.isolated.clone(), policy),
            production,
            catalog,
        )
    }

    pub fn detector(&self) -> &ModeDetector {
        &self.detector
    }

    pub fn catalog(&self) -> &[EntitySpec] {
        &self.catalog
    }

    /// `Before` hook: resolve the mode, then build the context.
    ///
    /// Any error here aborts the scenario before a page object sees it.
    pub async fn before(&self, scenario: &ScenarioInfo) -> E2eResult<ScenarioSession> {
        let started = Instant::now();
        let mut phase = ScenarioPhase::Undetermined;
        let tags = ScenarioTags::parse(&scenario.tags);

        let decision = match self.detector.decide(&tags) {
            Ok(decision) => decision,
            Err(e) => {
                phase.advance(ScenarioPhase::Aborted)?;
                error!(scenario = %scenario.name, error = %e, "Mode detection failed");
                return Err(e);
            }
        };
        phase.advance(ScenarioPhase::ModeResolved)?;
        info!(
            scenario = %scenario.name,
            declared = %decision.declared,
            mode = %decision.execution,
            source = ?decision.source,
            "Scenario mode resolved"
        );

        phase.advance(ScenarioPhase::ContextBuilding)?;
        let built = match decision.execution {
            ExecutionMode::Isolated => {
                let dataset = tags.dataset().unwrap_or(&self.default_dataset);
                self.isolated.load(dataset).await
            }
            ExecutionMode::Production => self.production.ensure(&self.catalog).await,
        };

        let context = match built {
            Ok(context) => context,
            Err(e) => {
                phase.advance(ScenarioPhase::Aborted)?;
                error!(
                    scenario = %scenario.name,
                    mode = %decision.execution,
                    kind = e.kind(),
                    error = %e,
                    "Context construction failed"
                );
                return Err(e);
            }
        };
        phase.advance(ScenarioPhase::ContextReady)?;
        debug!(
            scenario = %scenario.name,
            run_id = %context.metadata().test_run_id,
            connection = %context.connection_info(),
            "Context ready"
        );

        Ok(ScenarioSession {
            scenario: scenario.name.clone(),
            decision,
            phase,
            context,
            started,
        })
    }

    /// `After` hook: run cleanup exactly once. A cleanup failure is logged
    /// and returned as a warning; it never replaces the scenario result.
    pub async fn after(&self, mut session: ScenarioSession) -> TeardownReport {
        let cleanup_warning = match session.context.cleanup().await {
            Ok(()) => None,
            Err(e) => {
                warn!(
                    scenario = %session.scenario,
                    mode = %session.decision.execution,
                    error = %e,
                    "Cleanup failed"
                );
                Some(e.to_string())
            }
        };

        if let Err(e) = session.phase.advance(ScenarioPhase::TornDown) {
            warn!(scenario = %session.scenario, error = %e, "Unexpected phase at teardown");
            session.phase = ScenarioPhase::TornDown;
        }

        TeardownReport {
            scenario: session.scenario,
            mode: session.decision.execution,
            phase: session.phase,
            cleanup_warning,
            duration: session.started.elapsed(),
        }
    }

    /// Run `body` with a fresh context between the two hooks.
    ///
    /// A panic in the body is caught and reported as the scenario's
    /// failure after cleanup has run.
    pub async fn run_scenario<T, F, Fut>(&self, scenario: &ScenarioInfo, body: F) -> ScenarioOutcome<T>
    where
        F: FnOnce(DataContext) -> Fut,
        Fut: Future<Output = E2eResult<T>>,
    {
        let started = Instant::now();

        let mut session = match self.before(scenario).await {
            Ok(session) => session,
            Err(e) => {
                return ScenarioOutcome {
                    scenario: scenario.name.clone(),
                    mode: None,
                    source: None,
                    phase: ScenarioPhase::Aborted,
                    result: Err(e),
                    cleanup_warning: None,
                    duration: started.elapsed(),
                };
            }
        };

        let mode = session.decision.execution;
        let source = session.context.source().label().to_string();

        let result = match session.enter_use() {
            Ok(ctx) => AssertUnwindSafe(async move { body(ctx).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(E2eError::Panicked(panic_message(panic.as_ref())))),
            Err(e) => Err(e),
        };

        let teardown = self.after(session).await;

        match &result {
            Ok(_) => info!(scenario = %scenario.name, %mode, "Scenario passed"),
            Err(e) => error!(scenario = %scenario.name, %mode, kind = e.kind(), error = %e, "Scenario failed"),
        }

        ScenarioOutcome {
            scenario: scenario.name.clone(),
            mode: Some(mode),
            source: Some(source),
            phase: teardown.phase,
            result,
            cleanup_warning: teardown.cleanup_warning,
            duration: started.elapsed(),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
