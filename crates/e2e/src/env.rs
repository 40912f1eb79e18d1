//! Injected view of process environment variables

use std::collections::HashMap;

/// Environment variable names read by the harness
pub mod keys {
    /// Explicit override, beats scenario tags
    pub const TEST_MODE: &str = "FIELDOPS_TEST_MODE";
    /// Ambient default used when a scenario has no mode tag
    pub const DEFAULT_TEST_MODE: &str = "FIELDOPS_DEFAULT_TEST_MODE";

    pub const ISOLATED_BACKUP_DIR: &str = "FIELDOPS_ISOLATED_BACKUP_DIR";
    pub const ISOLATED_SCRATCH_DIR: &str = "FIELDOPS_ISOLATED_SCRATCH_DIR";
    pub const ISOLATED_RESTORE_TIMEOUT_MS: &str = "FIELDOPS_ISOLATED_RESTORE_TIMEOUT_MS";

    pub const PRODUCTION_BASE_URL: &str = "FIELDOPS_PRODUCTION_BASE_URL";
    pub const PRODUCTION_API_TOKEN: &str = "FIELDOPS_PRODUCTION_API_TOKEN";
    pub const PRODUCTION_TEST_MARKER: &str = "FIELDOPS_PRODUCTION_TEST_MARKER";
    pub const PRODUCTION_LOCATIONS: &str = "FIELDOPS_PRODUCTION_LOCATIONS";
    pub const PRODUCTION_CLEANUP_POLICY: &str = "FIELDOPS_PRODUCTION_CLEANUP_POLICY";

    pub const RETRY_MAX_ATTEMPTS: &str = "FIELDOPS_RETRY_MAX_ATTEMPTS";
    pub const RETRY_BASE_DELAY_MS: &str = "FIELDOPS_RETRY_BASE_DELAY_MS";
}

/// Read-only access to environment variables.
///
/// Mode detection and configuration take this instead of calling
/// `std::env` so tests can supply a fixed environment.
pub trait EnvironmentView: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;

    /// Value with surrounding whitespace removed; blank counts as unset
    fn non_empty(&self, key: &str) -> Option<String> {
        self.var(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

/// The real process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvironmentView for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Fixed in-memory environment
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapEnv {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl EnvironmentView for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}
