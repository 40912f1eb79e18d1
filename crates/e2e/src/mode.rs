//! Mode detection from scenario tags and environment
//!
//! Precedence, highest first:
//!
//! 1. `FIELDOPS_TEST_MODE` explicit override
//! 2. scenario tag (`@isolated`, `@production`, `@dual`)
//! 3. `FIELDOPS_DEFAULT_TEST_MODE` ambient default
//! 4. isolated
//!
//! A `@dual` scenario runs once per concrete mode under an outer
//! orchestrator that invokes the suite twice with different environments;
//! the detector never fans out on its own.

use std::sync::Arc;
use tracing::{debug, warn};

use fieldops_common::{ExecutionMode, TestMode};

use crate::env::{keys, EnvironmentView};
use crate::error::{E2eError, E2eResult};

const DATASET_TAG_PREFIX: &str = "dataset:";

/// Which precedence level produced a mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSource {
    EnvironmentOverride,
    Tag,
    AmbientDefault,
    Fallback,
}

/// Outcome of detection for one scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeDecision {
    /// Mode as declared (may be dual)
    pub declared: TestMode,
    /// Mode the data context is built for
    pub execution: ExecutionMode,
    pub source: ModeSource,
}

/// Tags of one scenario, parsed once at the boundary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioTags {
    modes: Vec<TestMode>,
    dataset: Option<String>,
    raw: Vec<String>,
}

impl ScenarioTags {
    /// Parse tags in either `@name` or bare `name` form
    pub fn parse<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = ScenarioTags::default();
        for tag in tags {
            let tag = tag.as_ref().trim();
            let bare = tag.strip_prefix('@').unwrap_or(tag);
            if bare.is_empty() {
                continue;
            }
            parsed.raw.push(bare.to_string());

            if let Some(name) = bare
                .get(..DATASET_TAG_PREFIX.len())
                .filter(|p| p.eq_ignore_ascii_case(DATASET_TAG_PREFIX))
                .map(|_| bare[DATASET_TAG_PREFIX.len()..].trim())
            {
                if !name.is_empty() {
                    parsed.dataset = Some(name.to_string());
                }
                continue;
            }

            if let Ok(mode) = bare.parse::<TestMode>() {
                if !parsed.modes.contains(&mode) {
                    parsed.modes.push(mode);
                }
            }
        }
        parsed
    }

    /// The single mode tag, `None` when untagged, error on conflict
    pub fn mode(&self) -> E2eResult<Option<TestMode>> {
        match self.modes.as_slice() {
            [] => Ok(None),
            [mode] => Ok(Some(*mode)),
            _ => Err(E2eError::AmbiguousMode {
                tags: self.modes.iter().map(|m| format!("@{}", m)).collect(),
            }),
        }
    }

    /// Dataset requested with `@dataset:<name>`
    pub fn dataset(&self) -> Option<&str> {
        self.dataset.as_deref()
    }

    pub fn raw(&self) -> &[String] {
        &self.raw
    }
}

/// Resolves a scenario's mode without performing any I/O
#[derive(Clone)]
pub struct ModeDetector {
    env: Arc<dyn EnvironmentView>,
}

impl std::fmt::Debug for ModeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeDetector").finish_non_exhaustive()
    }
}

impl ModeDetector {
    pub fn new(env: Arc<dyn EnvironmentView>) -> Self {
        Self { env }
    }

    /// Declared mode for a tag set (may be [`TestMode::Dual`])
    pub fn detect(&self, tags: &ScenarioTags) -> E2eResult<TestMode> {
        self.decide(tags).map(|d| d.declared)
    }

    /// Full decision including the concrete execution mode
    pub fn decide(&self, tags: &ScenarioTags) -> E2eResult<ModeDecision> {
        // Conflicting tags are an authoring error even when an override
        // would otherwise win.
        let tagged = tags.mode()?;

        if let Some(mode) = self.env_mode(keys::TEST_MODE)? {
            let execution = mode.concrete().ok_or_else(|| E2eError::InvalidMode {
                origin: keys::TEST_MODE.to_string(),
                value: "dual (an override must name a concrete mode)".to_string(),
            })?;
            debug!(mode = %execution, "Mode taken from environment override");
            return Ok(ModeDecision {
                declared: mode,
                execution,
                source: ModeSource::EnvironmentOverride,
            });
        }

        let ambient = self.env_mode(keys::DEFAULT_TEST_MODE)?;

        if let Some(mode) = tagged {
            let execution = match mode.concrete() {
                Some(execution) => execution,
                None => self.resolve_dual(ambient),
            };
            return Ok(ModeDecision {
                declared: mode,
                execution,
                source: ModeSource::Tag,
            });
        }

        if let Some(mode) = ambient {
            return Ok(ModeDecision {
                declared: mode,
                execution: mode.concrete().unwrap_or(ExecutionMode::Isolated),
                source: ModeSource::AmbientDefault,
            });
        }

        warn!(
            tags = ?tags.raw(),
            "No mode tag or environment setting, falling back to isolated"
        );
        Ok(ModeDecision {
            declared: TestMode::Isolated,
            execution: ExecutionMode::Isolated,
            source: ModeSource::Fallback,
        })
    }

    /// Dual declarations take the ambient default, else isolated
    fn resolve_dual(&self, ambient: Option<TestMode>) -> ExecutionMode {
        ambient
            .and_then(|m| m.concrete())
            .unwrap_or(ExecutionMode::Isolated)
    }

    fn env_mode(&self, key: &str) -> E2eResult<Option<TestMode>> {
        match self.env.non_empty(key) {
            Some(raw) => raw.parse().map(Some).map_err(|_| E2eError::InvalidMode {
                origin: key.to_string(),
                value: raw,
            }),
            None => Ok(None),
        }
    }
}
