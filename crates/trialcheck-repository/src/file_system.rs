//! File system stores
//!
//! `FileSystemRuleStore` keeps one YAML document per rule under a root
//! directory, named `<rule id>.yaml`:
//!
//! ```yaml
//! version: "0.1"
//! rule:
//!   id: bp_range
//!   field: systolic_bp
//!   text: between 60 and 220
//!   severity: error
//! ```
//!
//! `FileSystemCatalogProvider` reads the field catalog from a single YAML
//! file on every call so edits on disk are picked up.

use crate::traits::{FieldCatalogProvider, RuleStore};
use crate::{RepositoryError, RepositoryResult};
use async_trait::async_trait;
use path_absolutize::Absolutize;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use trialcheck_core::{FieldCatalog, Rule};

const DOCUMENT_VERSION: &str = "0.1";

#[derive(Debug, Serialize, Deserialize)]
struct RuleDocument {
    #[serde(default = "default_version")]
    version: String,
    rule: Rule,
}

fn default_version() -> String {
    DOCUMENT_VERSION.to_string()
}

/// Rule ids become file names, so only a conservative character set is
/// accepted
fn check_id(id: &str) -> RepositoryResult<()> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(RepositoryError::InvalidId(id.to_string()))
    }
}

fn absolute(path: &Path) -> RepositoryResult<PathBuf> {
    Ok(path.absolutize()?.to_path_buf())
}

/// One-YAML-file-per-rule store
pub struct FileSystemRuleStore {
    root_path: PathBuf,
}

impl FileSystemRuleStore {
    /// Open a store rooted at an existing directory
    pub fn new<P: AsRef<Path>>(root_path: P) -> RepositoryResult<Self> {
        let path = root_path.as_ref();
        if !path.is_dir() {
            return Err(RepositoryError::InvalidPath {
                path: path.to_path_buf(),
            });
        }
        Ok(Self {
            root_path: absolute(path)?,
        })
    }

    /// Open a store, creating the directory if needed
    pub async fn create<P: AsRef<Path>>(root_path: P) -> RepositoryResult<Self> {
        fs::create_dir_all(root_path.as_ref()).await?;
        Self::new(root_path)
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn rule_path(&self, id: &str) -> RepositoryResult<PathBuf> {
        check_id(id)?;
        Ok(self.root_path.join(format!("{}.yaml", id)))
    }

    async fn read_rule(path: &Path) -> RepositoryResult<Rule> {
        let content = fs::read_to_string(path).await?;
        let document: RuleDocument = serde_yaml::from_str(&content)?;
        Ok(document.rule)
    }
}

#[async_trait]
impl RuleStore for FileSystemRuleStore {
    async fn get(&self, id: &str) -> RepositoryResult<Rule> {
        let path = self.rule_path(id)?;
        if !fs::try_exists(&path).await? {
            return Err(RepositoryError::NotFound { id: id.to_string() });
        }
        Self::read_rule(&path).await
    }

    async fn list(&self) -> RepositoryResult<Vec<Rule>> {
        let mut rules = Vec::new();
        let mut entries = fs::read_dir(&self.root_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_yaml = matches!(
                path.extension().and_then(|s| s.to_str()),
                Some("yaml") | Some("yml")
            );
            if is_yaml && path.is_file() {
                rules.push(Self::read_rule(&path).await?);
            }
        }

        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }

    async fn save(&self, rule: &Rule) -> RepositoryResult<()> {
        let path = self.rule_path(&rule.id)?;
        let document = RuleDocument {
            version: default_version(),
            rule: rule.clone(),
        };
        let content = serde_yaml::to_string(&document)?;

        // Write beside the target and rename so readers never see a partial file
        let tmp = path.with_extension("yaml.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;

        debug!("Saved rule '{}' to {}", rule.id, path.display());
        Ok(())
    }

    async fn delete(&self, id: &str) -> RepositoryResult<bool> {
        let path = self.rule_path(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Catalog provider reading a YAML catalog file
pub struct FileSystemCatalogProvider {
    path: PathBuf,
}

impl FileSystemCatalogProvider {
    pub fn new<P: AsRef<Path>>(path: P) -> RepositoryResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(RepositoryError::InvalidPath {
                path: path.to_path_buf(),
            });
        }
        Ok(Self {
            path: absolute(path)?,
        })
    }
}

#[async_trait]
impl FieldCatalogProvider for FileSystemCatalogProvider {
    async fn catalog(&self) -> RepositoryResult<FieldCatalog> {
        let content = fs::read_to_string(&self.path).await?;
        FieldCatalog::from_yaml_str(&content)
            .map_err(|e| RepositoryError::InvalidCatalog(e.to_string()))
    }
}
