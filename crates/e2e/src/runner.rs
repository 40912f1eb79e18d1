//! Suite runner: scenarios in parallel, one context each

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::config::RunnerConfig;
use crate::context::DataContext;
use crate::error::{E2eError, E2eResult};
use crate::lifecycle::{ScenarioController, ScenarioInfo, ScenarioOutcome, ScenarioPhase};

type ScenarioBody = Arc<dyn Fn(DataContext) -> BoxFuture<'static, E2eResult<()>> + Send + Sync>;

/// A scenario and the steps it runs against its context
#[derive(Clone)]
pub struct ScenarioCase {
    pub info: ScenarioInfo,
    body: ScenarioBody,
}

impl ScenarioCase {
    pub fn new<F, Fut>(info: ScenarioInfo, body: F) -> Self
    where
        F: Fn(DataContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = E2eResult<()>> + Send + 'static,
    {
        Self {
            info,
            body: Arc::new(move |ctx| body(ctx).boxed()),
        }
    }
}

impl std::fmt::Debug for ScenarioCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioCase").field("info", &self.info).finish_non_exhaustive()
    }
}

/// Primary reason a scenario failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub kind: String,
    pub message: String,
}

impl From<&E2eError> for FailureCause {
    fn from(e: &E2eError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

/// Result of running a single scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub mode: Option<String>,
    pub source: Option<String>,
    pub phase: ScenarioPhase,
    pub success: bool,
    pub duration_ms: u64,
    pub failure: Option<FailureCause>,
    /// Secondary issue: teardown failed
    pub cleanup_warning: Option<String>,
}

impl<T> From<&ScenarioOutcome<T>> for ScenarioReport {
    fn from(outcome: &ScenarioOutcome<T>) -> Self {
        Self {
            name: outcome.scenario.clone(),
            mode: outcome.mode.map(|m| m.to_string()),
            source: outcome.source.clone(),
            phase: outcome.phase,
            success: outcome.passed(),
            duration_ms: outcome.duration.as_millis() as u64,
            failure: outcome.result.as_ref().err().map(FailureCause::from),
            cleanup_warning: outcome.cleanup_warning.clone(),
        }
    }
}

/// Result of running all scenarios
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub cleanup_warnings: usize,
    pub duration_ms: u64,
    pub results: Vec<ScenarioReport>,
}

impl SuiteReport {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Runs scenario cases through a [`ScenarioController`]
pub struct ScenarioRunner {
    controller: ScenarioController,
    max_concurrent: usize,
    output_dir: PathBuf,
}

impl ScenarioRunner {
    pub fn new(controller: ScenarioController, config: &RunnerConfig) -> Self {
        Self {
            controller,
            max_concurrent: config.max_concurrent.max(1),
            output_dir: config.output_dir.clone(),
        }
    }

    pub fn controller(&self) -> &ScenarioController {
        &self.controller
    }

    /// Run every case, at most `max_concurrent` at a time. Results keep the
    /// order of `cases`.
    pub async fn run(&self, cases: &[ScenarioCase]) -> SuiteReport {
        let start = Instant::now();
        info!("Running {} scenario(s)...", cases.len());

        let mut indexed: Vec<(usize, ScenarioReport)> = futures::stream::iter(cases.iter().enumerate())
            .map(|(index, case)| async move { (index, self.run_case(case).await) })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;
        indexed.sort_by_key(|(index, _)| *index);
        let results: Vec<ScenarioReport> = indexed.into_iter().map(|(_, r)| r).collect();

        let passed = results.iter().filter(|r| r.success).count();
        let failed = results.len() - passed;
        let cleanup_warnings = results.iter().filter(|r| r.cleanup_warning.is_some()).count();
        let duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Scenario results: {} passed, {} failed, {} cleanup warning(s) ({} ms)",
            passed, failed, cleanup_warnings, duration_ms
        );

        SuiteReport {
            total: cases.len(),
            passed,
            failed,
            cleanup_warnings,
            duration_ms,
            results,
        }
    }

    async fn run_case(&self, case: &ScenarioCase) -> ScenarioReport {
        let body = Arc::clone(&case.body);
        let outcome = self
            .controller
            .run_scenario(&case.info, move |ctx| body(ctx))
            .await;
        let report = ScenarioReport::from(&outcome);

        match &report.failure {
            None => info!("✓ {} ({} ms)", report.name, report.duration_ms),
            Some(cause) => error!("✗ {} - [{}] {}", report.name, cause.kind, cause.message),
        }
        if let Some(warning) = &report.cleanup_warning {
            warn!("! {} - cleanup: {}", report.name, warning);
        }
        report
    }

    /// Write results to `test-results.json` in the output directory
    pub fn write_results(&self, results: &SuiteReport) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;

        let path = self.output_dir.join("test-results.json");
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}
