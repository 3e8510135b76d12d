//! Store traits consumed by the validation engine
//!
//! - [`RuleStore`]: CRUD for authored rules
//! - [`FieldCatalogProvider`]: the current field catalog
//! - [`RecordProvider`]: current form values for real-time checks

use crate::RepositoryResult;
use async_trait::async_trait;
use trialcheck_core::ir::Record;
use trialcheck_core::{FieldCatalog, Rule};

/// Rule persistence
///
/// Rules are keyed by id. Saving an existing id replaces the rule.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn get(&self, id: &str) -> RepositoryResult<Rule>;

    /// All rules, ordered by id
    async fn list(&self) -> RepositoryResult<Vec<Rule>>;

    async fn save(&self, rule: &Rule) -> RepositoryResult<()>;

    /// Returns true if the rule existed
    async fn delete(&self, id: &str) -> RepositoryResult<bool>;

    async fn exists(&self, id: &str) -> RepositoryResult<bool> {
        match self.get(id).await {
            Ok(_) => Ok(true),
            Err(crate::RepositoryError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Active rules only
    async fn list_active(&self) -> RepositoryResult<Vec<Rule>> {
        Ok(self.list().await?.into_iter().filter(|r| r.active).collect())
    }
}

/// Source of the field catalog rules are validated against
#[async_trait]
pub trait FieldCatalogProvider: Send + Sync {
    async fn catalog(&self) -> RepositoryResult<FieldCatalog>;
}

/// Source of current form values
#[async_trait]
pub trait RecordProvider: Send + Sync {
    async fn get_current_values(&self, form_id: &str) -> RepositoryResult<Record>;
}
