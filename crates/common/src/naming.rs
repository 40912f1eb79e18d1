//! Naming convention that marks synthetic entities in a live system
//!
//! Every entity the harness creates in production carries a reserved marker
//! in its display name and identifiers. The marker is the only thing that
//! separates safe-to-mutate test data from real customers.

use serde::{Deserialize, Serialize};

use crate::types::EntityRecord;

/// Marker used when none is configured
pub const DEFAULT_MARKER: &str = "looneyTunesTest";

/// Why a record failed the naming check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamingViolation {
    MissingMarker { name: String },
    NotFlaggedAsTestData { name: String },
}

impl std::fmt::Display for NamingViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NamingViolation::MissingMarker { name } => {
                write!(f, "'{}' does not contain the test marker", name)
            }
            NamingViolation::NotFlaggedAsTestData { name } => {
                write!(f, "'{}' is not flagged as test data", name)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingConvention {
    marker: String,
}

impl Default for NamingConvention {
    fn default() -> Self {
        Self::new(DEFAULT_MARKER)
    }
}

impl NamingConvention {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// True if `value` carries the marker. An empty marker matches nothing.
    pub fn is_compliant(&self, value: &str) -> bool {
        !self.marker.is_empty() && value.contains(&self.marker)
    }

    /// Display name for a synthetic entity: `"<base> - <marker>"`.
    ///
    /// Names that already carry the marker are returned unchanged.
    pub fn apply(&self, base: &str) -> String {
        if self.is_compliant(base) {
            base.to_string()
        } else {
            format!("{} - {}", base.trim(), self.marker)
        }
    }

    /// Email for a synthetic entity, tagged through plus-addressing
    pub fn apply_email(&self, local: &str, domain: &str) -> String {
        if self.is_compliant(local) {
            format!("{}@{}", local, domain)
        } else {
            format!("{}+{}@{}", local, self.marker, domain)
        }
    }

    /// Production invariant for a record: flagged as test data and named
    /// with the marker.
    pub fn check_record(&self, record: &EntityRecord) -> Result<(), NamingViolation> {
        if !self.is_compliant(&record.name) {
            return Err(NamingViolation::MissingMarker {
                name: record.name.clone(),
            });
        }
        if !record.is_test_data {
            return Err(NamingViolation::NotFlaggedAsTestData {
                name: record.name.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compliance_requires_marker_substring() {
        let naming = NamingConvention::default();
        assert!(naming.is_compliant("Bugs Bunny - looneyTunesTest"));
        assert!(naming.is_compliant("route-looneyTunesTest-7"));
        assert!(!naming.is_compliant("John Smith"));
        assert!(!naming.is_compliant("looneytunestest"));
    }

    #[test]
    fn test_empty_marker_matches_nothing() {
        let naming = NamingConvention::new("");
        assert!(!naming.is_compliant("anything"));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let naming = NamingConvention::default();
        let once = naming.apply("Bugs Bunny");
        assert_eq!(once, "Bugs Bunny - looneyTunesTest");
        assert_eq!(naming.apply(&once), once);
    }

    #[test]
    fn test_apply_email_tags_local_part() {
        let naming = NamingConvention::default();
        assert_eq!(
            naming.apply_email("bugs.bunny", "example.com"),
            "bugs.bunny+looneyTunesTest@example.com"
        );
    }

    #[test]
    fn test_check_record() {
        let naming = NamingConvention::default();
        let ok = EntityRecord::new("1", "Porky Pig - looneyTunesTest", true);
        assert!(naming.check_record(&ok).is_ok());

        let unflagged = EntityRecord::new("2", "Porky Pig - looneyTunesTest", false);
        assert!(matches!(
            naming.check_record(&unflagged),
            Err(NamingViolation::NotFlaggedAsTestData { .. })
        ));

        let real = EntityRecord::new("3", "John Smith", true);
        assert!(matches!(
            naming.check_record(&real),
            Err(NamingViolation::MissingMarker { .. })
        ));
    }
}
