//! Access to the live field-service system used in production mode

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use fieldops_common::{ConnectionInfo, EntityCategory, EntityRecord};

use crate::config::ProductionConfig;
use crate::error::{E2eError, E2eResult};

/// Payload for creating a synthetic entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntity {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub is_test_data: bool,
}

/// Operations the production provider needs from the live system
#[async_trait]
pub trait LiveSystem: Send + Sync {
    /// Entities whose name matches `name` exactly
    async fn find_by_name(&self, category: EntityCategory, name: &str) -> E2eResult<Vec<EntityRecord>>;

    /// Create an entity. A name collision is [`E2eError::Duplicate`].
    async fn create(&self, category: EntityCategory, entity: &NewEntity) -> E2eResult<EntityRecord>;

    /// Delete an entity by id; deleting something already gone succeeds
    async fn delete(&self, category: EntityCategory, id: &str) -> E2eResult<()>;

    fn connection_info(&self) -> ConnectionInfo;
}

/// REST client for the field-service API
pub struct HttpLiveSystem {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpLiveSystem {
    pub fn new(config: &ProductionConfig) -> E2eResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }

    fn url(&self, category: EntityCategory) -> String {
        format!("{}/api/{}", self.base_url, category.as_str())
    }

    /// Single-entity URL; the id is percent-encoded as one path segment
    fn entity_url(&self, category: EntityCategory, id: &str) -> E2eResult<reqwest::Url> {
        let base = self.url(category);
        let mut url = reqwest::Url::parse(&base)
            .map_err(|e| E2eError::Config(format!("invalid live system url '{}': {}", base, e)))?;
        url.path_segments_mut()
            .map_err(|_| E2eError::Config(format!("live system url '{}' cannot take a path", base)))?
            .push(id);
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn status_error(url: String, resp: reqwest::Response) -> E2eError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        E2eError::LiveApi { status, url, body }
    }
}

#[async_trait]
impl LiveSystem for HttpLiveSystem {
    async fn find_by_name(&self, category: EntityCategory, name: &str) -> E2eResult<Vec<EntityRecord>> {
        let url = self.url(category);
        let resp = self
            .request(reqwest::Method::GET, &url)
            .query(&[("name", name)])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::status_error(url, resp).await);
        }

        let records: Vec<EntityRecord> = resp.json().await?;
        // The API may match loosely; existence is by exact name.
        Ok(records.into_iter().filter(|r| r.name == name).collect())
    }

    async fn create(&self, category: EntityCategory, entity: &NewEntity) -> E2eResult<EntityRecord> {
        let url = self.url(category);
        let resp = self
            .request(reqwest::Method::POST, &url)
            .json(entity)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Err(E2eError::Duplicate {
                target_kind: category.kind().to_string(),
                name: entity.name.clone(),
            });
        }
        if !resp.status().is_success() {
            return Err(Self::status_error(url, resp).await);
        }

        debug!(category = %category, name = %entity.name, "Created live entity");
        Ok(resp.json().await?)
    }

    async fn delete(&self, category: EntityCategory, id: &str) -> E2eResult<()> {
        let url = self.entity_url(category, id)?;
        let resp = self.request(reqwest::Method::DELETE, url.as_str()).send().await?;

        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Self::status_error(url.to_string(), resp).await)
        }
    }

    fn connection_info(&self) -> ConnectionInfo {
        let host = reqwest::Url::parse(&self.base_url)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .unwrap_or_else(|| self.base_url.clone());
        ConnectionInfo {
            host,
            database: "production".to_string(),
            is_test_connection: true,
        }
    }
}

/// In-process live system with call counters and failure injection
#[derive(Default)]
pub struct MemoryLiveSystem {
    entities: Mutex<HashMap<EntityCategory, Vec<EntityRecord>>>,
    pending_failures: Mutex<u32>,
    lose_create_race: Mutex<bool>,
    rejected: Mutex<Vec<String>>,
    read_only: bool,
    finds: AtomicU64,
    creates: AtomicU64,
    deletes: AtomicU64,
    next_id: AtomicU64,
}

impl MemoryLiveSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// A system whose connection is not flagged for tests
    pub fn unflagged() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    /// Insert an entity as if someone else had created it
    pub fn seed(&self, category: EntityCategory, record: EntityRecord) {
        self.entities.lock().entry(category).or_default().push(record);
    }

    /// Fail the next `n` calls with a timeout
    pub fn fail_next(&self, n: u32) {
        *self.pending_failures.lock() = n;
    }

    /// Make the next create lose a race: the entity appears, but the call
    /// reports a duplicate
    pub fn lose_next_create_race(&self) {
        *self.lose_create_race.lock() = true;
    }

    /// Refuse every create of `name` with a 400 response
    pub fn reject_create(&self, name: impl Into<String>) {
        self.rejected.lock().push(name.into());
    }

    pub fn count_named(&self, category: EntityCategory, name: &str) -> usize {
        self.entities
            .lock()
            .get(&category)
            .map(|v| v.iter().filter(|r| r.name == name).count())
            .unwrap_or(0)
    }

    pub fn all(&self, category: EntityCategory) -> Vec<EntityRecord> {
        self.entities.lock().get(&category).cloned().unwrap_or_default()
    }

    pub fn find_calls(&self) -> u64 {
        self.finds.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    fn injected_failure(&self, operation: &str) -> E2eResult<()> {
        let mut pending = self.pending_failures.lock();
        if *pending > 0 {
            *pending -= 1;
            return Err(E2eError::Timeout {
                operation: operation.to_string(),
                millis: 0,
            });
        }
        Ok(())
    }

    fn record_from(&self, entity: &NewEntity) -> EntityRecord {
        EntityRecord {
            id: format!("mem-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
            name: entity.name.clone(),
            is_test_data: entity.is_test_data,
            email: entity.email.clone(),
            location: entity.location.clone(),
            attributes: entity.attributes.clone(),
        }
    }
}

#[async_trait]
impl LiveSystem for MemoryLiveSystem {
    async fn find_by_name(&self, category: EntityCategory, name: &str) -> E2eResult<Vec<EntityRecord>> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        self.injected_failure("find")?;
        Ok(self
            .entities
            .lock()
            .get(&category)
            .map(|v| v.iter().filter(|r| r.name == name).cloned().collect())
            .unwrap_or_default())
    }

    async fn create(&self, category: EntityCategory, entity: &NewEntity) -> E2eResult<EntityRecord> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.injected_failure("create")?;
        if self.rejected.lock().iter().any(|n| *n == entity.name) {
            return Err(E2eError::LiveApi {
                status: 400,
                url: format!("memory://{}", category.as_str()),
                body: "rejected".to_string(),
            });
        }

        let lost_race = std::mem::take(&mut *self.lose_create_race.lock());
        let mut entities = self.entities.lock();
        let records = entities.entry(category).or_default();
        if lost_race {
            records.push(self.record_from(entity));
        }
        if records.iter().any(|r| r.name == entity.name) {
            return Err(E2eError::Duplicate {
                target_kind: category.kind().to_string(),
                name: entity.name.clone(),
            });
        }
        let record = self.record_from(entity);
        records.push(record.clone());
        Ok(record)
    }

    async fn delete(&self, category: EntityCategory, id: &str) -> E2eResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.injected_failure("delete")?;
        if let Some(records) = self.entities.lock().get_mut(&category) {
            records.retain(|r| r.id != id);
        }
        Ok(())
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: "memory".to_string(),
            database: "live".to_string(),
            is_test_connection: !self.read_only,
        }
    }
}
