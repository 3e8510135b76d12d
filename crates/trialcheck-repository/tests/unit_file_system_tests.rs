//! Unit tests for the file system stores

use tempfile::TempDir;
use tokio::fs;
use trialcheck_core::{Rule, RuleScope, Schedule, Severity};
use trialcheck_repository::{
    FieldCatalogProvider, FileSystemCatalogProvider, FileSystemRuleStore, RepositoryError,
    RuleStore,
};

async fn create_store() -> (TempDir, FileSystemRuleStore) {
    let temp_dir = TempDir::new().unwrap();
    let store = FileSystemRuleStore::create(temp_dir.path().join("rules"))
        .await
        .unwrap();
    (temp_dir, store)
}

#[tokio::test]
async fn test_save_and_load_rule() {
    let (_dir, store) = create_store().await;
    let rule = Rule::new("wt_change", "weight", "within 10% of visit(\"baseline\").weight")
        .batch(RuleScope::CrossVisit)
        .with_severity(Severity::Warning)
        .with_schedule(Schedule::Daily { hour: 2 });

    store.save(&rule).await.unwrap();

    let path = store.root_path().join("wt_change.yaml");
    assert!(path.exists());
    let content = fs::read_to_string(&path).await.unwrap();
    assert!(content.contains("version:"));
    assert!(content.contains("wt_change"));

    assert_eq!(store.get("wt_change").await.unwrap(), rule);
}

#[tokio::test]
async fn test_hand_written_rule_file() {
    let (_dir, store) = create_store().await;
    let yaml = r#"version: "0.1"

rule:
  id: bp_range
  field: systolic_bp
  text: between 60 and 220
"#;
    fs::write(store.root_path().join("bp_range.yaml"), yaml)
        .await
        .unwrap();

    let rule = store.get("bp_range").await.unwrap();
    assert_eq!(rule.field, "systolic_bp");
    assert!(rule.active);
    assert_eq!(rule.severity, Severity::Error);
}

#[tokio::test]
async fn test_list_is_sorted_and_skips_other_files() {
    let (_dir, store) = create_store().await;
    for id in ["c_rule", "a_rule", "b_rule"] {
        store
            .save(&Rule::new(id, "age", "between 18 and 99"))
            .await
            .unwrap();
    }
    fs::write(store.root_path().join("README.txt"), "not a rule")
        .await
        .unwrap();

    let ids: Vec<String> = store
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec!["a_rule", "b_rule", "c_rule"]);
}

#[tokio::test]
async fn test_delete_and_missing() {
    let (_dir, store) = create_store().await;
    store
        .save(&Rule::new("age_range", "age", "between 18 and 99"))
        .await
        .unwrap();

    assert!(store.delete("age_range").await.unwrap());
    assert!(!store.delete("age_range").await.unwrap());
    assert!(!store.exists("age_range").await.unwrap());
    assert!(matches!(
        store.get("age_range").await,
        Err(RepositoryError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_path_traversal_rejected() {
    let (_dir, store) = create_store().await;
    let rule = Rule::new("../escape", "age", "required");
    assert!(matches!(
        store.save(&rule).await,
        Err(RepositoryError::InvalidId(_))
    ));
}

#[tokio::test]
async fn test_corrupt_file_is_a_yaml_error() {
    let (_dir, store) = create_store().await;
    fs::write(store.root_path().join("broken.yaml"), "rule: [unclosed")
        .await
        .unwrap();
    assert!(matches!(
        store.get("broken").await,
        Err(RepositoryError::YamlParse(_))
    ));
}

#[test]
fn test_missing_root_is_invalid_path() {
    let result = FileSystemRuleStore::new("/definitely/not/here");
    assert!(matches!(result, Err(RepositoryError::InvalidPath { .. })));
}

#[tokio::test]
async fn test_catalog_file_reloads() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("catalog.yaml");
    fs::write(
        &path,
        "version: 1\nfields:\n  - name: age\n    type: numeric\n",
    )
    .await
    .unwrap();

    let provider = FileSystemCatalogProvider::new(&path).unwrap();
    let catalog = provider.catalog().await.unwrap();
    assert_eq!(catalog.version(), 1);
    assert!(catalog.contains("age"));

    fs::write(
        &path,
        "version: 2\nfields:\n  - name: age\n    type: numeric\n  - name: sex\n    type: text\n",
    )
    .await
    .unwrap();
    let catalog = provider.catalog().await.unwrap();
    assert_eq!(catalog.version(), 2);
    assert_eq!(catalog.len(), 2);
}

#[tokio::test]
async fn test_duplicate_catalog_field_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("catalog.yaml");
    fs::write(
        &path,
        "fields:\n  - name: age\n    type: numeric\n  - name: age\n    type: text\n",
    )
    .await
    .unwrap();

    let provider = FileSystemCatalogProvider::new(&path).unwrap();
    assert!(matches!(
        provider.catalog().await,
        Err(RepositoryError::InvalidCatalog(_))
    ));
}
