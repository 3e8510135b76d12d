//! Field catalog definitions
//!
//! The catalog declares every field a rule may reference: its type, the
//! tokens that mean "missing" on the eCRF, and the table that stores it for
//! batch queries.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Default relational table holding form values
pub const DEFAULT_TABLE: &str = "observations";

/// Declared type of a catalog field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Free text or coded values
    Text,
    /// Integer or decimal measurements
    Numeric,
    /// Calendar date
    Date,
    /// Yes/no
    Logical,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Text => "text",
            FieldType::Numeric => "numeric",
            FieldType::Date => "date",
            FieldType::Logical => "logical",
        };
        f.write_str(name)
    }
}

/// A field in the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Field name as referenced in rule text
    pub name: String,

    /// Declared type
    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Values that mean "not collected" (e.g. "NA", "UNK")
    #[serde(default)]
    pub missing_tokens: Vec<String>,

    /// Table holding this field for batch queries
    #[serde(default = "default_table")]
    pub table: String,

    /// Optional display label
    #[serde(default)]
    pub label: Option<String>,
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

impl FieldDefinition {
    /// Create a new field in the default table
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            missing_tokens: Vec::new(),
            table: default_table(),
            label: None,
        }
    }

    /// Set recognized missing-value tokens
    pub fn with_missing_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.missing_tokens = tokens.into_iter().map(Into::into).collect();
        self
    }

    /// Set the table holding this field
    pub fn in_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Set the display label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Check whether a textual value is one of the missing tokens
    pub fn is_missing_token(&self, text: &str) -> bool {
        let text = text.trim();
        self.missing_tokens.iter().any(|t| t.eq_ignore_ascii_case(text))
    }
}

/// Field catalog
///
/// The version increments on every change so compiled artifacts can tell
/// when the catalog they were checked against has moved on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldCatalog {
    #[serde(default)]
    version: u64,

    fields: HashMap<String, FieldDefinition>,
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    version: u64,
    fields: Vec<FieldDefinition>,
}

impl FieldCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field (builder style)
    pub fn with_field(mut self, field: FieldDefinition) -> Self {
        self.insert(field);
        self
    }

    /// Insert or replace a field, bumping the version
    pub fn insert(&mut self, field: FieldDefinition) {
        self.fields.insert(field.name.clone(), field);
        self.version += 1;
    }

    /// Remove a field, bumping the version
    pub fn remove(&mut self, name: &str) -> Option<FieldDefinition> {
        let removed = self.fields.remove(name);
        if removed.is_some() {
            self.version += 1;
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.values()
    }

    /// Parse a catalog from YAML
    ///
    /// ```yaml
    /// version: 3
    /// fields:
    ///   - name: systolic_bp
    ///     type: numeric
    ///     missing_tokens: ["ND"]
    ///     table: vitals
    /// ```
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(content)
            .map_err(|e| CoreError::InvalidCatalog(e.to_string()))?;

        let mut catalog = FieldCatalog::new();
        for field in file.fields {
            if catalog.contains(&field.name) {
                return Err(CoreError::InvalidCatalog(format!(
                    "duplicate field '{}'",
                    field.name
                )));
            }
            catalog.fields.insert(field.name.clone(), field);
        }
        catalog.version = file.version;
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_version_bumps() {
        let mut catalog = FieldCatalog::new();
        assert_eq!(catalog.version(), 0);
        catalog.insert(FieldDefinition::new("age", FieldType::Numeric));
        assert_eq!(catalog.version(), 1);
        catalog.remove("age");
        assert_eq!(catalog.version(), 2);
        assert!(catalog.remove("age").is_none());
        assert_eq!(catalog.version(), 2);
    }

    #[test]
    fn test_missing_tokens_case_insensitive() {
        let field =
            FieldDefinition::new("weight", FieldType::Numeric).with_missing_tokens(["NA", "UNK"]);
        assert!(field.is_missing_token("na"));
        assert!(field.is_missing_token(" UNK "));
        assert!(!field.is_missing_token("72"));
    }

    #[test]
    fn test_catalog_from_yaml() {
        let yaml = r#"
version: 7
fields:
  - name: systolic_bp
    type: numeric
    missing_tokens: ["ND"]
    table: vitals
  - name: visit_date
    type: date
"#;
        let catalog = FieldCatalog::from_yaml_str(yaml).unwrap();
        assert_eq!(catalog.version(), 7);
        assert_eq!(catalog.len(), 2);
        let bp = catalog.get("systolic_bp").unwrap();
        assert_eq!(bp.field_type, FieldType::Numeric);
        assert_eq!(bp.table, "vitals");
        assert_eq!(catalog.get("visit_date").unwrap().table, DEFAULT_TABLE);
    }

    #[test]
    fn test_catalog_rejects_duplicates() {
        let yaml = r#"
fields:
  - { name: age, type: numeric }
  - { name: age, type: text }
"#;
        assert!(FieldCatalog::from_yaml_str(yaml).is_err());
    }
}
