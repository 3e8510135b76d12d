//! In-memory implementations of the store traits

use crate::traits::{FieldCatalogProvider, RecordProvider, RuleStore};
use crate::{RepositoryError, RepositoryResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use trialcheck_core::ir::Record;
use trialcheck_core::{FieldCatalog, Rule, Value};

/// Rule store backed by a map
#[derive(Default)]
pub struct MemoryRuleStore {
    rules: RwLock<BTreeMap<String, Rule>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: impl IntoIterator<Item = Rule>) -> Self {
        Self {
            rules: RwLock::new(rules.into_iter().map(|r| (r.id.clone(), r)).collect()),
        }
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn get(&self, id: &str) -> RepositoryResult<Rule> {
        self.rules
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound { id: id.to_string() })
    }

    async fn list(&self) -> RepositoryResult<Vec<Rule>> {
        Ok(self.rules.read().await.values().cloned().collect())
    }

    async fn save(&self, rule: &Rule) -> RepositoryResult<()> {
        self.rules
            .write()
            .await
            .insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> RepositoryResult<bool> {
        Ok(self.rules.write().await.remove(id).is_some())
    }
}

/// Catalog provider holding a replaceable catalog
pub struct StaticCatalogProvider {
    catalog: RwLock<FieldCatalog>,
}

impl StaticCatalogProvider {
    pub fn new(catalog: FieldCatalog) -> Self {
        Self {
            catalog: RwLock::new(catalog),
        }
    }

    /// Swap in a new catalog, e.g. after a form change
    pub async fn set_catalog(&self, catalog: FieldCatalog) {
        *self.catalog.write().await = catalog;
    }
}

#[async_trait]
impl FieldCatalogProvider for StaticCatalogProvider {
    async fn catalog(&self) -> RepositoryResult<FieldCatalog> {
        Ok(self.catalog.read().await.clone())
    }
}

/// Record provider over in-memory forms
#[derive(Default)]
pub struct MemoryRecordProvider {
    forms: RwLock<HashMap<String, Record>>,
}

impl MemoryRecordProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_record(&self, form_id: impl Into<String>, record: Record) {
        self.forms.write().await.insert(form_id.into(), record);
    }

    /// Set one field on a form, creating the form if needed
    pub async fn set_value(&self, form_id: &str, field: impl Into<String>, value: Value) {
        self.forms
            .write()
            .await
            .entry(form_id.to_string())
            .or_default()
            .insert(field.into(), value);
    }
}

#[async_trait]
impl RecordProvider for MemoryRecordProvider {
    async fn get_current_values(&self, form_id: &str) -> RepositoryResult<Record> {
        self.forms
            .read()
            .await
            .get(form_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound {
                id: form_id.to_string(),
            })
    }
}
