//! Chokepoint that keeps production-mode mutations on synthetic entities

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

use fieldops_common::{ConnectionInfo, ExecutionMode, NamingConvention};

use crate::error::{E2eError, E2eResult};

/// A mutating action about to run against an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutatingOperation {
    /// Verb for reports: "create", "edit", "delete", "assign", ...
    pub action: String,
    pub target_kind: String,
    pub target_name: String,
}

impl MutatingOperation {
    pub fn new(
        action: impl Into<String>,
        target_kind: impl Into<String>,
        target_name: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            target_kind: target_kind.into(),
            target_name: target_name.into(),
        }
    }
}

#[derive(Debug, Default)]
struct GuardCounters {
    allowed: AtomicU64,
    refused: AtomicU64,
}

/// Validates every mutation's target before it executes.
///
/// Isolated contexts pass everything through. Production contexts require
/// the target name to carry the naming marker and the connection to be
/// flagged as a test connection.
#[derive(Debug, Clone)]
pub struct ProductionSafetyGuard {
    mode: ExecutionMode,
    naming: NamingConvention,
    test_connection: bool,
    counters: Arc<GuardCounters>,
}

impl ProductionSafetyGuard {
    pub fn new(mode: ExecutionMode, naming: NamingConvention, connection: &ConnectionInfo) -> Self {
        Self {
            mode,
            naming,
            test_connection: connection.is_test_connection,
            counters: Arc::default(),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn naming(&self) -> &NamingConvention {
        &self.naming
    }

    /// Allow or refuse `operation`. A refusal is a [`E2eError::SafetyViolation`].
    pub fn validate(&self, operation: &MutatingOperation) -> E2eResult<()> {
        if self.mode.is_isolated() {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let reason = if !self.test_connection {
            Some("connection is not flagged as a test connection".to_string())
        } else if !self.naming.is_compliant(&operation.target_name) {
            Some(format!("name lacks marker '{}'", self.naming.marker()))
        } else {
            None
        };

        match reason {
            None => {
                self.counters.allowed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    action = %operation.action,
                    target_kind = %operation.target_kind,
                    target = %operation.target_name,
                    "Mutation allowed"
                );
                Ok(())
            }
            Some(reason) => {
                self.counters.refused.fetch_add(1, Ordering::Relaxed);
                error!(
                    mode = %self.mode,
                    action = %operation.action,
                    target_kind = %operation.target_kind,
                    target = %operation.target_name,
                    %reason,
                    "Refused mutation of a non-test entity"
                );
                Err(E2eError::SafetyViolation {
                    mode: self.mode.into(),
                    operation: operation.action.clone(),
                    target_kind: operation.target_kind.clone(),
                    target_name: operation.target_name.clone(),
                    reason,
                })
            }
        }
    }

    /// Validate, then run `action` only if allowed
    pub async fn guarded<T, F, Fut>(&self, operation: &MutatingOperation, action: F) -> E2eResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = E2eResult<T>>,
    {
        self.validate(operation)?;
        action().await
    }

    /// Mutations allowed so far
    pub fn allowed_count(&self) -> u64 {
        self.counters.allowed.load(Ordering::Relaxed)
    }

    /// Mutations refused so far
    pub fn refused_count(&self) -> u64 {
        self.counters.refused.load(Ordering::Relaxed)
    }
}
