//! Builder pattern for ValidationEngine

use crate::config::EngineConfig;
use crate::error::Result;
use crate::validation_engine::ValidationEngine;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use trialcheck_core::FieldCatalog;
use trialcheck_repository::{
    FieldCatalogProvider, MemoryRuleStore, RecordProvider, RuleStore, StaticCatalogProvider,
};
use trialcheck_runtime::{
    DataSource, InMemoryDataSource, MemoryRunStore, MemoryViolationStore, QcEngine, RunStore,
    ViolationStore,
};

/// Builder for ValidationEngine
///
/// Every component has an in-memory default, so a bare builder produces a
/// working engine with no rules and an empty catalog.
///
/// # Example
///
/// ```rust,ignore
/// use trialcheck_sdk::ValidationEngineBuilder;
/// use trialcheck_repository::{FileSystemCatalogProvider, FileSystemRuleStore};
///
/// let engine = ValidationEngineBuilder::new()
///     .with_config_file("trialcheck.yaml")?
///     .with_rule_store(Arc::new(FileSystemRuleStore::new("rules")?))
///     .with_catalog_provider(Arc::new(FileSystemCatalogProvider::new("catalog.yaml")?))
///     .with_data_source(Arc::new(source))
///     .build()
///     .await?;
/// ```
pub struct ValidationEngineBuilder {
    config: EngineConfig,
    rules: Option<Arc<dyn RuleStore>>,
    catalog: Option<Arc<dyn FieldCatalogProvider>>,
    records: Option<Arc<dyn RecordProvider>>,
    source: Option<Arc<dyn DataSource>>,
    violations: Option<Arc<dyn ViolationStore>>,
    runs: Option<Arc<dyn RunStore>>,
    #[cfg(feature = "sqlx")]
    pool: Option<sqlx::PgPool>,
}

impl ValidationEngineBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            config: EngineConfig::new(),
            rules: None,
            catalog: None,
            records: None,
            source: None,
            violations: None,
            runs: None,
            #[cfg(feature = "sqlx")]
            pool: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Load configuration from a YAML file
    pub fn with_config_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.config = EngineConfig::from_yaml_file(path)?;
        Ok(self)
    }

    pub fn with_rule_store(mut self, store: Arc<dyn RuleStore>) -> Self {
        self.rules = Some(store);
        self
    }

    pub fn with_catalog_provider(mut self, provider: Arc<dyn FieldCatalogProvider>) -> Self {
        self.catalog = Some(provider);
        self
    }

    /// Use a fixed catalog
    pub fn with_catalog(self, catalog: FieldCatalog) -> Self {
        self.with_catalog_provider(Arc::new(StaticCatalogProvider::new(catalog)))
    }

    /// Source of current form values for `validate_form`
    pub fn with_record_provider(mut self, provider: Arc<dyn RecordProvider>) -> Self {
        self.records = Some(provider);
        self
    }

    /// Clinical data the batch rules run against
    pub fn with_data_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_violation_store(mut self, store: Arc<dyn ViolationStore>) -> Self {
        self.violations = Some(store);
        self
    }

    pub fn with_run_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.runs = Some(store);
        self
    }

    /// Run batch rules against PostgreSQL and persist violations and runs
    /// there. The QC tables are created on build if missing.
    #[cfg(feature = "sqlx")]
    pub fn with_postgres(mut self, pool: sqlx::PgPool) -> Self {
        use trialcheck_runtime::{PostgresDataSource, PostgresRunStore, PostgresViolationStore};
        self.source = Some(Arc::new(PostgresDataSource::new(pool.clone())));
        self.violations = Some(Arc::new(PostgresViolationStore::new(pool.clone())));
        self.runs = Some(Arc::new(PostgresRunStore::new(pool.clone())));
        self.pool = Some(pool);
        self
    }

    /// Build the validation engine, loading and compiling every active rule
    pub async fn build(self) -> Result<ValidationEngine> {
        #[cfg(feature = "sqlx")]
        if let Some(pool) = &self.pool {
            trialcheck_runtime::ensure_schema(pool).await?;
            info!("✓ QC schema ready");
        }

        let rules = self
            .rules
            .unwrap_or_else(|| Arc::new(MemoryRuleStore::new()));
        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(StaticCatalogProvider::new(FieldCatalog::default())));
        let source = self
            .source
            .unwrap_or_else(|| Arc::new(InMemoryDataSource::new()));
        let violations = self
            .violations
            .unwrap_or_else(|| Arc::new(MemoryViolationStore::new()));
        let runs = self.runs.unwrap_or_else(|| Arc::new(MemoryRunStore::new()));

        let qc = QcEngine::new(source, violations, runs).with_config(self.config.qc.clone());
        let engine = ValidationEngine::new(self.config, rules, catalog, self.records, qc).await?;

        info!("✓ Validation engine ready");
        Ok(engine)
    }
}

impl Default for ValidationEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
