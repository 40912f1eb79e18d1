//! Page-object side of the data context
//!
//! Page objects never reach the browser for a mutating action without
//! passing the target through the context's safety guard first.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use fieldops_common::{EntityCategory, TestMode};

use crate::context::DataContext;
use crate::error::{E2eError, E2eResult};
use crate::safety::MutatingOperation;

const DEFAULT_WAIT: Duration = Duration::from_secs(10);

/// Browser automation the page objects drive
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn is_visible(&self, selector: &str) -> E2eResult<bool>;
    async fn click(&self, selector: &str) -> E2eResult<()>;
    async fn fill(&self, selector: &str, value: &str) -> E2eResult<()>;
    async fn text(&self, selector: &str) -> E2eResult<String>;
    async fn wait_for(&self, selector: &str, timeout: Duration) -> E2eResult<()>;
}

/// A page object that a scenario's [`DataContext`] can be attached to
pub trait ContextAware {
    fn set_data_context(&mut self, ctx: DataContext);

    fn data_context(&self) -> Option<&DataContext>;

    /// Mode of the attached context
    fn test_mode(&self) -> Option<TestMode> {
        self.data_context().map(DataContext::test_mode)
    }

    /// Mode-appropriate sanity check for this page
    fn validate_context(&self) -> bool;

    /// `base` unless the attached mode needs a different affordance for `key`
    fn mode_specific_selector(&self, base: &str, key: &str) -> String;
}

/// Context holder shared by page objects
#[derive(Debug, Clone, Default)]
pub struct PageContext {
    ctx: Option<DataContext>,
    production_selectors: HashMap<String, String>,
}

impl PageContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selector used for `key` when running in production
    pub fn with_production_selector(mut self, key: impl Into<String>, selector: impl Into<String>) -> Self {
        self.production_selectors.insert(key.into(), selector.into());
        self
    }

    pub fn attach(&mut self, ctx: DataContext) {
        self.ctx = Some(ctx);
    }

    pub fn get(&self) -> Option<&DataContext> {
        self.ctx.as_ref()
    }

    pub fn require(&self) -> E2eResult<&DataContext> {
        self.ctx
            .as_ref()
            .ok_or_else(|| E2eError::Step("no data context attached to page".into()))
    }

    pub fn validate(&self, category: EntityCategory) -> bool {
        self.ctx.as_ref().is_some_and(|ctx| ctx.validate_for(category))
    }

    pub fn selector(&self, base: &str, key: &str) -> String {
        match &self.ctx {
            Some(ctx) if !ctx.mode().is_isolated() => self
                .production_selectors
                .get(key)
                .cloned()
                .unwrap_or_else(|| base.to_string()),
            _ => base.to_string(),
        }
    }

    /// Guard chokepoint for every mutating page action
    pub fn guard(&self, action: &str, target_kind: &str, target_name: &str) -> E2eResult<()> {
        self.require()?
            .guard_mutation(&MutatingOperation::new(action, target_kind, target_name))
    }
}

/// List page for one entity category (customers, routes, ...)
pub struct EntityListPage {
    driver: Arc<dyn BrowserDriver>,
    category: EntityCategory,
    page: PageContext,
}

impl std::fmt::Debug for EntityListPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityListPage")
            .field("category", &self.category)
            .field("page", &self.page)
            .finish_non_exhaustive()
    }
}

impl EntityListPage {
    pub fn new(driver: Arc<dyn BrowserDriver>, category: EntityCategory) -> Self {
        Self {
            driver,
            category,
            page: PageContext::new(),
        }
    }

    /// Customers list. Production search-filters instead of paging through
    /// real customers.
    pub fn customers(driver: Arc<dyn BrowserDriver>) -> Self {
        let mut page = Self::new(driver, EntityCategory::Customers);
        page.page = page
            .page
            .with_production_selector("list", "[data-testid='customers-search-results']");
        page
    }

    pub fn routes(driver: Arc<dyn BrowserDriver>) -> Self {
        Self::new(driver, EntityCategory::Routes)
    }

    pub fn category(&self) -> EntityCategory {
        self.category
    }

    fn testid(&self, element: &str) -> String {
        format!("[data-testid='{}-{}']", self.category.as_str(), element)
    }

    fn row(&self, name: &str) -> String {
        format!(
            "{} [data-name='{}']",
            self.mode_specific_selector(&self.testid("list"), "list"),
            name
        )
    }

    /// Name a new entity should get in the current mode
    pub fn entity_name(&self, base: &str) -> E2eResult<String> {
        let ctx = self.page.require()?;
        Ok(if ctx.mode().is_isolated() {
            base.to_string()
        } else {
            ctx.naming().apply(base)
        })
    }

    pub async fn open(&self) -> E2eResult<()> {
        self.driver.click(&self.testid("nav")).await?;
        let list = self.mode_specific_selector(&self.testid("list"), "list");
        self.driver.wait_for(&list, DEFAULT_WAIT).await
    }

    pub async fn is_listed(&self, name: &str) -> E2eResult<bool> {
        self.driver.is_visible(&self.row(name)).await
    }

    pub async fn display_name(&self, name: &str) -> E2eResult<String> {
        self.driver.text(&self.row(name)).await
    }

    /// Create an entity from `base`; returns the name actually used
    pub async fn create(&self, base: &str) -> E2eResult<String> {
        let name = self.entity_name(base)?;
        self.page.guard("create", self.category.kind(), &name)?;

        self.driver.click(&self.testid("new")).await?;
        self.driver.fill(&self.testid("name-input"), &name).await?;
        self.driver.click(&self.testid("save")).await?;
        debug!(category = %self.category, %name, "Created through UI");
        Ok(name)
    }

    pub async fn rename(&self, name: &str, new_name: &str) -> E2eResult<()> {
        let kind = self.category.kind();
        self.page.guard("edit", kind, name)?;
        self.page.guard("rename to", kind, new_name)?;

        self.driver.click(&format!("{} [data-action='edit']", self.row(name))).await?;
        self.driver.fill(&self.testid("name-input"), new_name).await?;
        self.driver.click(&self.testid("save")).await
    }

    pub async fn delete(&self, name: &str) -> E2eResult<()> {
        self.page.guard("delete", self.category.kind(), name)?;

        self.driver.click(&format!("{} [data-action='delete']", self.row(name))).await?;
        self.driver.click(&self.testid("confirm-delete")).await
    }
}

impl ContextAware for EntityListPage {
    fn set_data_context(&mut self, ctx: DataContext) {
        self.page.attach(ctx);
    }

    fn data_context(&self) -> Option<&DataContext> {
        self.page.get()
    }

    fn validate_context(&self) -> bool {
        self.page.validate(self.category)
    }

    fn mode_specific_selector(&self, base: &str, key: &str) -> String {
        self.page.selector(base, key)
    }
}

/// Driver that records actions instead of driving a browser
#[derive(Debug, Default)]
pub struct RecordingDriver {
    actions: parking_lot::Mutex<Vec<String>>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().clone()
    }

    fn record(&self, action: String) {
        self.actions.lock().push(action);
    }
}

#[async_trait]
impl BrowserDriver for RecordingDriver {
    async fn is_visible(&self, selector: &str) -> E2eResult<bool> {
        self.record(format!("visible {}", selector));
        Ok(true)
    }

    async fn click(&self, selector: &str) -> E2eResult<()> {
        self.record(format!("click {}", selector));
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> E2eResult<()> {
        self.record(format!("fill {} = {}", selector, value));
        Ok(())
    }

    async fn text(&self, selector: &str) -> E2eResult<String> {
        self.record(format!("text {}", selector));
        Ok(String::new())
    }

    async fn wait_for(&self, selector: &str, _timeout: Duration) -> E2eResult<()> {
        self.record(format!("wait {}", selector));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextSource;
    use fieldops_common::{ConnectionInfo, EntityRecord, ExecutionMode, TestDataSet};

    fn context(mode: ExecutionMode) -> DataContext {
        let mut data = TestDataSet::new();
        data.push(
            EntityCategory::Customers,
            EntityRecord::new("c1", "Bugs Bunny - looneyTunesTest", true),
        );
        DataContext::builder(
            mode,
            ContextSource::Catalog {
                name: "default".into(),
                created: 0,
            },
        )
        .test_data(data)
        .connection(ConnectionInfo {
            host: "fieldops.example.com".into(),
            database: "production".into(),
            is_test_connection: true,
        })
        .build()
    }

    fn page(mode: ExecutionMode) -> (Arc<RecordingDriver>, EntityListPage) {
        let driver = Arc::new(RecordingDriver::new());
        let mut page = EntityListPage::customers(driver.clone());
        page.set_data_context(context(mode));
        (driver, page)
    }

    #[tokio::test]
    async fn test_production_delete_of_real_customer_never_reaches_driver() {
        let (driver, page) = page(ExecutionMode::Production);
        let err = page.delete("John Smith").await.unwrap_err();
        assert_eq!(err.kind(), "safety_violation");
        assert!(driver.actions().is_empty());
        assert_eq!(page.data_context().unwrap().safety_guard().refused_count(), 1);
    }

    #[tokio::test]
    async fn test_production_create_applies_marker() {
        let (driver, page) = page(ExecutionMode::Production);
        let name = page.create("Road Runner").await.unwrap();
        assert_eq!(name, "Road Runner - looneyTunesTest");
        assert!(driver
            .actions()
            .contains(&"fill [data-testid='customers-name-input'] = Road Runner - looneyTunesTest".to_string()));
    }

    #[tokio::test]
    async fn test_rename_checks_both_names() {
        let (driver, page) = page(ExecutionMode::Production);
        let err = page
            .rename("Bugs Bunny - looneyTunesTest", "Bugs Bunny")
            .await
            .unwrap_err();
        assert!(matches!(err, E2eError::SafetyViolation { ref target_name, .. } if target_name == "Bugs Bunny"));
        assert!(driver.actions().is_empty());
    }

    #[tokio::test]
    async fn test_isolated_mutations_pass_through() {
        let (driver, page) = page(ExecutionMode::Isolated);
        page.delete("John Smith").await.unwrap();
        assert_eq!(driver.actions().len(), 2);
        assert_eq!(page.entity_name("Acme").unwrap(), "Acme");
    }

    #[test]
    fn test_mode_specific_selector() {
        let (_, production) = page(ExecutionMode::Production);
        let (_, isolated) = page(ExecutionMode::Isolated);
        let base = "[data-testid='customers-list']";
        assert_eq!(
            production.mode_specific_selector(base, "list"),
            "[data-testid='customers-search-results']"
        );
        assert_eq!(isolated.mode_specific_selector(base, "list"), base);
        assert_eq!(production.mode_specific_selector("#save", "save"), "#save");
    }

    #[test]
    fn test_validate_context() {
        let (_, production) = page(ExecutionMode::Production);
        assert!(production.validate_context());
        assert_eq!(production.test_mode(), Some(TestMode::Production));

        let detached = EntityListPage::routes(Arc::new(RecordingDriver::new()));
        assert!(!detached.validate_context());
        assert_eq!(detached.test_mode(), None);

        let mut routes = EntityListPage::routes(Arc::new(RecordingDriver::new()));
        routes.set_data_context(context(ExecutionMode::Production));
        assert!(!routes.validate_context());
    }

    #[tokio::test]
    async fn test_page_without_context_refuses_mutation() {
        let driver = Arc::new(RecordingDriver::new());
        let page = EntityListPage::customers(driver.clone());
        assert!(page.delete("Bugs Bunny - looneyTunesTest").await.is_err());
        assert!(driver.actions().is_empty());
    }
}
