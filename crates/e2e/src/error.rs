//! Error types for the dual-mode harness

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use thiserror::Error;

use fieldops_common::{ExecutionMode, TestMode};

/// Wording that marks a failure as timeout/connection/network class
static TRANSIENT_WORDING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(timed? ?out|timeout|connection (refused|reset|closed|aborted)|econnreset|econnrefused|socket hang up|network|temporarily unavailable|broken pipe)",
    )
    .expect("static regex")
});

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Ambiguous mode: scenario carries conflicting mode tags {tags:?}")]
    AmbiguousMode { tags: Vec<String> },

    #[error("Invalid mode '{value}' from {origin}")]
    InvalidMode { origin: String, value: String },

    #[error("Fixture not found: dataset '{dataset}' (searched {searched})")]
    FixtureNotFound { dataset: String, searched: PathBuf },

    #[error("Fixture verification failed for dataset '{dataset}': {check}")]
    FixtureVerification { dataset: String, check: String },

    #[error("Could not ensure {target_kind} '{name}' in catalog '{catalog}': {reason}")]
    EntityEnsure {
        catalog: String,
        target_kind: String,
        name: String,
        reason: String,
    },

    #[error("Safety violation in {mode} mode: refused to {operation} {target_kind} '{target_name}' ({reason})")]
    SafetyViolation {
        mode: TestMode,
        operation: String,
        target_kind: String,
        target_name: String,
        reason: String,
    },

    #[error("Cleanup failed in {mode} mode: {details}")]
    Cleanup { mode: ExecutionMode, details: String },

    #[error("Timeout after {millis} ms waiting for: {operation}")]
    Timeout { operation: String, millis: u64 },

    #[error("Duplicate {target_kind} '{name}' already exists")]
    Duplicate { target_kind: String, name: String },

    #[error("Live API returned {status} for {url}: {body}")]
    LiveApi { status: u16, url: String, body: String },

    #[error("Step failed: {0}")]
    Step(String),

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Scenario panicked: {0}")]
    Panicked(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML write error: {0}")]
    TomlWrite(#[from] toml::ser::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Common(#[from] fieldops_common::Error),
}

pub type E2eResult<T> = Result<T, E2eError>;

impl E2eError {
    /// Stable kind string used in reports
    pub fn kind(&self) -> &'static str {
        match self {
            E2eError::AmbiguousMode { .. } => "ambiguous_mode",
            E2eError::InvalidMode { .. } => "invalid_mode",
            E2eError::FixtureNotFound { .. } => "fixture_not_found",
            E2eError::FixtureVerification { .. } => "fixture_verification",
            E2eError::EntityEnsure { .. } => "entity_ensure",
            E2eError::SafetyViolation { .. } => "safety_violation",
            E2eError::Cleanup { .. } => "cleanup",
            E2eError::Timeout { .. } => "timeout",
            E2eError::Duplicate { .. } => "duplicate",
            E2eError::LiveApi { .. } => "live_api",
            E2eError::Step(_) => "step",
            E2eError::AssertionFailed(_) => "assertion",
            E2eError::Panicked(_) => "panic",
            E2eError::Config(_) => "config",
            E2eError::Io(_) => "io",
            E2eError::Json(_) => "json",
            E2eError::Yaml(_) => "yaml",
            E2eError::TomlParse(_) | E2eError::TomlWrite(_) => "toml",
            E2eError::Http(_) => "http",
            E2eError::Common(_) => "common",
        }
    }

    /// Default retry eligibility: timeout, connection and network failures.
    ///
    /// Safety violations, mode errors and assertion failures are never
    /// transient, whatever their message says.
    pub fn is_transient(&self) -> bool {
        match self {
            E2eError::Timeout { .. } => true,
            E2eError::Http(e) => e.is_timeout() || e.is_connect(),
            E2eError::LiveApi { status, .. } => *status == 429 || *status >= 500,
            E2eError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            E2eError::Common(e) => e.is_transient(),
            E2eError::Step(message) => TRANSIENT_WORDING.is_match(message),
            _ => false,
        }
    }
}
