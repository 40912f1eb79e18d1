//! Core types for the FieldOps harness

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::Error;

/// Mode a scenario declares itself compatible with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    Isolated,
    Production,
    /// Valid under both modes; resolved to an [`ExecutionMode`] before any
    /// data is built.
    Dual,
}

impl TestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestMode::Isolated => "isolated",
            TestMode::Production => "production",
            TestMode::Dual => "dual",
        }
    }

    /// The concrete mode, if this is not a dual declaration
    pub fn concrete(&self) -> Option<ExecutionMode> {
        match self {
            TestMode::Isolated => Some(ExecutionMode::Isolated),
            TestMode::Production => Some(ExecutionMode::Production),
            TestMode::Dual => None,
        }
    }
}

impl std::fmt::Display for TestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "isolated" => Ok(TestMode::Isolated),
            "production" => Ok(TestMode::Production),
            "dual" => Ok(TestMode::Dual),
            other => Err(Error::UnknownMode(other.to_string())),
        }
    }
}

/// Mode a data context actually executes in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Isolated,
    Production,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Isolated => "isolated",
            ExecutionMode::Production => "production",
        }
    }

    pub fn is_isolated(&self) -> bool {
        matches!(self, ExecutionMode::Isolated)
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExecutionMode> for TestMode {
    fn from(mode: ExecutionMode) -> Self {
        match mode {
            ExecutionMode::Isolated => TestMode::Isolated,
            ExecutionMode::Production => TestMode::Production,
        }
    }
}

/// Entity categories exposed by the field-service application
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityCategory {
    Customers,
    Routes,
    Tickets,
    Locations,
    Technicians,
}

impl EntityCategory {
    pub const ALL: [EntityCategory; 5] = [
        EntityCategory::Customers,
        EntityCategory::Routes,
        EntityCategory::Tickets,
        EntityCategory::Locations,
        EntityCategory::Technicians,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityCategory::Customers => "customers",
            EntityCategory::Routes => "routes",
            EntityCategory::Tickets => "tickets",
            EntityCategory::Locations => "locations",
            EntityCategory::Technicians => "technicians",
        }
    }

    /// Singular noun used in safety reports ("customer", "route", ...)
    pub fn kind(&self) -> &'static str {
        match self {
            EntityCategory::Customers => "customer",
            EntityCategory::Routes => "route",
            EntityCategory::Tickets => "ticket",
            EntityCategory::Locations => "location",
            EntityCategory::Technicians => "technician",
        }
    }
}

impl std::fmt::Display for EntityCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        EntityCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted || c.kind() == wanted)
            .ok_or_else(|| Error::UnknownCategory(s.to_string()))
    }
}

/// A single entity as seen by a test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub name: String,
    #[serde(default, alias = "isTestData")]
    pub is_test_data: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl EntityRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, is_test_data: bool) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_test_data,
            email: None,
            location: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Entities available to a scenario, grouped by category
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestDataSet {
    categories: BTreeMap<EntityCategory, Vec<EntityRecord>>,
}

impl TestDataSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record, keeping insertion order within the category
    pub fn push(&mut self, category: EntityCategory, record: EntityRecord) {
        self.categories.entry(category).or_default().push(record);
    }

    pub fn insert(&mut self, category: EntityCategory, records: Vec<EntityRecord>) {
        self.categories.insert(category, records);
    }

    /// Records of a category; empty if the category was never loaded
    pub fn get(&self, category: EntityCategory) -> &[EntityRecord] {
        self.categories
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn find_by_name(&self, category: EntityCategory, name: &str) -> Option<&EntityRecord> {
        self.get(category).iter().find(|r| r.name == name)
    }

    pub fn categories(&self) -> impl Iterator<Item = EntityCategory> + '_ {
        self.categories.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityCategory, &EntityRecord)> {
        self.categories
            .iter()
            .flat_map(|(c, records)| records.iter().map(move |r| (*c, r)))
    }

    pub fn len(&self) -> usize {
        self.categories.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Correlation data recorded when a context is built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMetadata {
    pub created_at: DateTime<Utc>,
    pub mode: ExecutionMode,
    pub version: String,
    pub test_run_id: Uuid,
}

impl TestMetadata {
    pub fn new(mode: ExecutionMode, test_run_id: Uuid) -> Self {
        Self {
            created_at: Utc::now(),
            mode,
            version: crate::VERSION.to_string(),
            test_run_id,
        }
    }
}

/// Where a context's data lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub database: String,
    /// Safety marker checked by the production guard. It does not isolate
    /// anything by itself.
    pub is_test_connection: bool,
}

impl std::fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.host, self.database)
    }
}
