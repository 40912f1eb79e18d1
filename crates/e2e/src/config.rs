//! Harness configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use fieldops_common::{NamingConvention, DEFAULT_MARKER};

use crate::env::{keys, EnvironmentView};
use crate::error::{E2eError, E2eResult};
use crate::retry::RetryPolicy;

/// Harness configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Fixture restore settings
    pub isolated: IsolatedConfig,

    /// Live system settings
    pub production: ProductionConfig,

    /// Backoff applied to provider I/O
    pub retry: RetryConfig,

    /// Suite execution settings
    pub runner: RunnerConfig,
}

/// Isolated (fixture) mode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolatedConfig {
    /// Directory holding fixture bundles (`<dataset>.json|yaml`)
    pub fixtures_dir: PathBuf,

    /// Where scratch databases are created (system temp dir if unset)
    pub scratch_dir: Option<PathBuf>,

    /// Upper bound for one restore + verify attempt
    pub restore_timeout_ms: u64,

    /// Dataset used when a scenario has no `@dataset:` tag
    pub default_dataset: String,
}

impl Default for IsolatedConfig {
    fn default() -> Self {
        Self {
            fixtures_dir: PathBuf::from("tests/fixtures"),
            scratch_dir: None,
            restore_timeout_ms: 30_000,
            default_dataset: "default".to_string(),
        }
    }
}

impl IsolatedConfig {
    pub fn restore_timeout(&self) -> Duration {
        Duration::from_millis(self.restore_timeout_ms)
    }
}

/// What production cleanup does with synthetic entities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Keep synthetic data for reuse by later runs
    #[default]
    Preserve,
    /// Delete entities the context created
    Remove,
}

impl FromStr for CleanupPolicy {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "preserve" | "keep" => Ok(CleanupPolicy::Preserve),
            "remove" | "delete" => Ok(CleanupPolicy::Remove),
            other => Err(E2eError::Config(format!("unknown cleanup policy '{}'", other))),
        }
    }
}

/// Production (live system) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductionConfig {
    /// Base URL of the field-service application
    pub base_url: String,

    /// Bearer token for the API, if it requires one
    pub api_token: Option<String>,

    /// Marker every synthetic entity name carries
    pub test_marker: String,

    /// Locations that get a synthetic route each
    pub locations: Vec<String>,

    pub cleanup_policy: CleanupPolicy,

    /// Upper bound for one existence check or create call
    pub request_timeout_ms: u64,
}

impl Default for ProductionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            api_token: None,
            test_marker: DEFAULT_MARKER.to_string(),
            locations: vec!["Acme Acres".to_string(), "Toontown".to_string()],
            cleanup_policy: CleanupPolicy::Preserve,
            request_timeout_ms: 15_000,
        }
    }
}

impl ProductionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn naming(&self) -> NamingConvention {
        NamingConvention::new(self.test_marker.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryConfig {
    /// Policy using the default transient-error predicate
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Scenarios allowed in flight at once
    pub max_concurrent: usize,

    /// Output directory for results
    pub output_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            output_dir: PathBuf::from("test-results"),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> E2eResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> E2eResult<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overlay `FIELDOPS_*` environment variables
    pub fn apply_env(&mut self, env: &dyn EnvironmentView) -> E2eResult<()> {
        if let Some(dir) = env.non_empty(keys::ISOLATED_BACKUP_DIR) {
            self.isolated.fixtures_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env.non_empty(keys::ISOLATED_SCRATCH_DIR) {
            self.isolated.scratch_dir = Some(PathBuf::from(dir));
        }
        if let Some(ms) = parse_var(env, keys::ISOLATED_RESTORE_TIMEOUT_MS)? {
            self.isolated.restore_timeout_ms = ms;
        }

        if let Some(url) = env.non_empty(keys::PRODUCTION_BASE_URL) {
            self.production.base_url = url;
        }
        if let Some(token) = env.non_empty(keys::PRODUCTION_API_TOKEN) {
            self.production.api_token = Some(token);
        }
        if let Some(marker) = env.non_empty(keys::PRODUCTION_TEST_MARKER) {
            self.production.test_marker = marker;
        }
        if let Some(list) = env.non_empty(keys::PRODUCTION_LOCATIONS) {
            self.production.locations = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(policy) = parse_var(env, keys::PRODUCTION_CLEANUP_POLICY)? {
            self.production.cleanup_policy = policy;
        }

        if let Some(attempts) = parse_var(env, keys::RETRY_MAX_ATTEMPTS)? {
            self.retry.max_attempts = attempts;
        }
        if let Some(ms) = parse_var(env, keys::RETRY_BASE_DELAY_MS)? {
            self.retry.base_delay_ms = ms;
        }

        self.validate()
    }

    /// Reject values that would make the harness unsafe or inert
    pub fn validate(&self) -> E2eResult<()> {
        if self.production.test_marker.trim().is_empty() {
            return Err(E2eError::Config("production test marker must not be empty".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(E2eError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.runner.max_concurrent == 0 {
            return Err(E2eError::Config("runner.max_concurrent must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_var<T>(env: &dyn EnvironmentView, key: &str) -> E2eResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env.non_empty(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| E2eError::Config(format!("{}='{}': {}", key, raw, e))),
        None => Ok(None),
    }
}
