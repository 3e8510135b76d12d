//! End-to-end tests for ValidationEngine
//!
//! Rules go in through `save_rule` exactly as an authoring UI would submit
//! them; batch runs execute against an in-memory study database.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;
use trialcheck_compiler::{Compiler, SemanticErrorKind};
use trialcheck_repository::{
    FileSystemRuleStore, MemoryRecordProvider, MemoryRuleStore, RuleStore, StaticCatalogProvider,
};
use trialcheck_runtime::{InMemoryDataSource, SqlRenderer, Table};
use trialcheck_sdk::{
    init_tracing, EvalContext, EvaluationStatus, FieldCatalog, FieldDefinition, FieldType, QcConfig, Record,
    Rule, RuleContext, RuleFailureKind, RuleScope, RunStatus, RunTrigger, Schedule, SdkError,
    ValidationEngine, ValidationEngineBuilder, Value, ViolationFilter, ViolationStatus,
};

// =============================================================================
// Fixtures
// =============================================================================

fn catalog() -> FieldCatalog {
    FieldCatalog::new()
        .with_field(FieldDefinition::new("systolic_bp", FieldType::Numeric).in_table("vitals"))
        .with_field(FieldDefinition::new("bp", FieldType::Numeric).in_table("vitals"))
        .with_field(FieldDefinition::new("age", FieldType::Numeric).in_table("vitals"))
        .with_field(
            FieldDefinition::new("weight", FieldType::Numeric)
                .in_table("vitals")
                .with_missing_tokens(["UNK"]),
        )
        .with_field(FieldDefinition::new("initials", FieldType::Text).in_table("vitals"))
        .with_field(FieldDefinition::new("alt", FieldType::Numeric).in_table("labs"))
}

fn row(subject: &str, visit: &str, values: &[(&str, Value)]) -> Vec<(String, Value)> {
    let mut row = vec![
        ("subject_id".to_string(), Value::from(subject)),
        ("visit".to_string(), Value::from(visit)),
    ];
    row.extend(values.iter().map(|(k, v)| (k.to_string(), v.clone())));
    row
}

fn study_data() -> Arc<InMemoryDataSource> {
    let vitals = Table::new(["subject_id", "visit", "weight", "systolic_bp", "initials"])
        .with_row(row(
            "S001",
            "baseline",
            &[("weight", 70.0.into()), ("systolic_bp", 120.0.into()), ("initials", "AB".into())],
        ))
        .with_row(row(
            "S001",
            "week4",
            &[("weight", 85.0.into()), ("systolic_bp", 250.0.into()), ("initials", "AB".into())],
        ))
        .with_row(row(
            "S002",
            "baseline",
            &[("weight", 60.0.into()), ("systolic_bp", 130.0.into()), ("initials", "CD".into())],
        ))
        .with_row(row(
            "S002",
            "week4",
            &[("weight", 62.0.into()), ("systolic_bp", 128.0.into()), ("initials", "CD".into())],
        ));
    let labs = Table::new(["subject_id", "visit", "alt"])
        .with_row(row("S001", "baseline", &[("alt", 35.0.into())]))
        .with_row(row("S002", "baseline", &[("alt", 450.0.into())]));

    Arc::new(
        InMemoryDataSource::new()
            .with_table("vitals", vitals)
            .with_table("labs", labs),
    )
}

fn record(values: &[(&str, Value)]) -> Record {
    values
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect::<HashMap<_, _>>()
}

fn ctx() -> EvalContext {
    EvalContext::new(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap())
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
}

fn weight_rule() -> Rule {
    Rule::new("wt_change", "weight", "within 10% of visit(\"baseline\").weight")
        .batch(RuleScope::CrossVisit)
        .with_schedule(Schedule::Interval { minutes: 60 })
}

fn bp_batch_rule() -> Rule {
    Rule::new("bp_sweep", "systolic_bp", "between 60 and 220")
        .batch(RuleScope::Field)
        .with_schedule(Schedule::Daily { hour: 2 })
}

fn alt_rule() -> Rule {
    Rule::new("alt_range", "alt", "between 0 and 200")
        .batch(RuleScope::Field)
        .with_schedule(Schedule::Interval { minutes: 60 })
}

async fn engine_with(source: Arc<InMemoryDataSource>) -> ValidationEngine {
    init_tracing();
    ValidationEngineBuilder::new()
        .with_catalog(catalog())
        .with_data_source(source)
        .build()
        .await
        .unwrap()
}

async fn engine() -> ValidationEngine {
    engine_with(study_data()).await
}

// =============================================================================
// Real-time validation
// =============================================================================

#[tokio::test]
async fn test_range_rule_rejects_low_reading() {
    let engine = engine().await;
    let result = engine
        .save_rule(Rule::new("bp_range", "systolic_bp", "between 40 and 200"))
        .await
        .unwrap();
    assert!(result.success);

    let check = engine
        .validate_field_with("bp_range", &record(&[("systolic_bp", 35.0.into())]), &ctx())
        .unwrap();
    assert!(!check.valid);
    assert_eq!(check.status, EvaluationStatus::Failed);
    let message = check.message.unwrap();
    assert!(message.contains("40"));
    assert!(message.contains("200"));
}

#[tokio::test]
async fn test_age_dependent_bp_rule() {
    let engine = engine().await;
    engine
        .save_rule(Rule::new(
            "bp_by_age",
            "bp",
            "if age >= 65 then between 90 and 180 else between 110 and 200 endif",
        ))
        .await
        .unwrap();

    let senior = record(&[("age", 70.0.into()), ("bp", 150.0.into())]);
    assert!(engine.validate_field_with("bp_by_age", &senior, &ctx()).unwrap().valid);

    let adult = record(&[("age", 40.0.into()), ("bp", 250.0.into())]);
    assert!(!engine.validate_field_with("bp_by_age", &adult, &ctx()).unwrap().valid);
}

#[tokio::test]
async fn test_validator_compiled_once_and_cached() {
    let engine = ValidationEngineBuilder::new()
        .with_catalog(catalog())
        .with_rule_store(Arc::new(MemoryRuleStore::with_rules([Rule::new(
            "bp_range",
            "systolic_bp",
            "between 40 and 200",
        )])))
        .build()
        .await
        .unwrap();

    // Loaded rules are compiled lazily on first use
    assert!(!engine.is_cached("bp_range"));

    let reading = record(&[("systolic_bp", 120.0.into())]);
    for _ in 0..3 {
        assert!(engine.validate_field("bp_range", &reading).unwrap().valid);
    }
    assert!(engine.is_cached("bp_range"));
    let stats = engine.cache_stats();
    assert_eq!(stats.compilations, 1);
    assert_eq!(stats.hits, 2);
}

#[tokio::test]
async fn test_save_rule_replaces_cached_validator() {
    let engine = engine().await;
    let reading = record(&[("systolic_bp", 35.0.into())]);

    engine
        .save_rule(Rule::new("bp_range", "systolic_bp", "between 40 and 200"))
        .await
        .unwrap();
    assert!(!engine.validate_field_with("bp_range", &reading, &ctx()).unwrap().valid);

    engine
        .save_rule(Rule::new("bp_range", "systolic_bp", "between 30 and 200"))
        .await
        .unwrap();
    assert!(engine.validate_field_with("bp_range", &reading, &ctx()).unwrap().valid);
}

#[tokio::test]
async fn test_validate_form_runs_every_rule_on_the_field() {
    let records = Arc::new(MemoryRecordProvider::new());
    records
        .put_record(
            "form-17",
            record(&[("systolic_bp", 210.0.into()), ("age", 50.0.into())]),
        )
        .await;

    let engine = ValidationEngineBuilder::new()
        .with_catalog(catalog())
        .with_record_provider(records.clone())
        .build()
        .await
        .unwrap();
    engine
        .save_rule(Rule::new("bp_hard", "systolic_bp", "between 40 and 250"))
        .await
        .unwrap();
    engine
        .save_rule(Rule::new("bp_soft", "systolic_bp", "between 40 and 200"))
        .await
        .unwrap();
    engine
        .save_rule(Rule::new("age_range", "age", "between 18 and 99"))
        .await
        .unwrap();

    let results = engine.validate_form("form-17", "systolic_bp").await.unwrap();
    let outcome: Vec<(&str, bool)> = results
        .iter()
        .map(|r| (r.rule_id.as_str(), r.valid))
        .collect();
    assert_eq!(outcome, vec![("bp_hard", true), ("bp_soft", false)]);

    records.set_value("form-17", "systolic_bp", 180.0.into()).await;
    let results = engine.validate_form("form-17", "systolic_bp").await.unwrap();
    assert!(results.iter().all(|r| r.valid));
}

#[tokio::test]
async fn test_validate_form_needs_record_provider() {
    let engine = engine().await;
    assert!(matches!(
        engine.validate_form("form-1", "systolic_bp").await,
        Err(SdkError::NotConfigured(_))
    ));
}

#[tokio::test]
async fn test_validate_field_rejects_batch_and_unknown_rules() {
    let engine = engine().await;
    engine.save_rule(weight_rule()).await.unwrap();

    let reading = record(&[("weight", 70.0.into())]);
    assert!(matches!(
        engine.validate_field("wt_change", &reading),
        Err(SdkError::WrongContext { context: RuleContext::Batch, .. })
    ));
    assert!(matches!(
        engine.validate_field("nope", &reading),
        Err(SdkError::RuleNotFound(_))
    ));
}

// =============================================================================
// Authoring
// =============================================================================

#[tokio::test]
async fn test_unknown_field_never_activates() {
    let rules = Arc::new(MemoryRuleStore::new());
    let engine = ValidationEngineBuilder::new()
        .with_catalog(catalog())
        .with_rule_store(rules.clone())
        .build()
        .await
        .unwrap();

    let result = engine
        .save_rule(
            Rule::new("bad_ref", "weight", "foo_bar > 3")
                .batch(RuleScope::Field)
                .with_schedule(Schedule::Interval { minutes: 5 }),
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result
        .semantic_errors
        .iter()
        .any(|e| e.kind == SemanticErrorKind::UnknownField && e.message.contains("foo_bar")));

    assert!(!rules.get("bad_ref").await.unwrap().active);
    assert!(!engine.active_rule_ids().contains(&"bad_ref".to_string()));
    assert!(!engine.is_cached("bad_ref"));
    assert!(!engine.is_scheduled("bad_ref"));

    let record = engine.run_due_rules(now()).await.unwrap();
    assert_eq!(record.rules_run, 0);
}

#[tokio::test]
async fn test_failed_save_evicts_previous_version() {
    let engine = engine().await;
    engine
        .save_rule(Rule::new("bp_range", "systolic_bp", "between 40 and 200"))
        .await
        .unwrap();
    engine
        .validate_field_with("bp_range", &record(&[("systolic_bp", 120.0.into())]), &ctx())
        .unwrap();
    assert!(engine.is_cached("bp_range"));

    let result = engine
        .save_rule(Rule::new("bp_range", "systolic_bp", "between 40 200"))
        .await
        .unwrap();
    assert!(!result.success);
    assert!(result.syntax_error.is_some());
    assert!(!engine.is_cached("bp_range"));
    assert!(matches!(
        engine.validate_field("bp_range", &record(&[])),
        Err(SdkError::RuleNotFound(_))
    ));
}

#[tokio::test]
async fn test_compile_text_gives_author_feedback() {
    let engine = engine().await;

    let ok = engine.compile_text("systolic_bp", "between 40 and 200", RuleContext::RealTime);
    assert!(ok.success);
    assert_eq!(ok.description.as_deref(), Some("between 40 and 200"));

    let text = "exec(initials)";
    let bad = engine.compile_text("initials", text, RuleContext::RealTime);
    assert!(!bad.success);
    assert!(bad
        .semantic_errors
        .iter()
        .any(|e| e.kind == SemanticErrorKind::UnknownFunction));
    assert!(!bad.messages(text).is_empty());

    // Author feedback is serializable for the editor UI
    let json = serde_json::to_value(&bad).unwrap();
    assert_eq!(json["success"], serde_json::json!(false));
    assert!(engine.active_rule_ids().is_empty());
}

// =============================================================================
// Batch QC
// =============================================================================

#[tokio::test]
async fn test_cross_visit_weight_change() {
    let engine = engine().await;
    engine.save_rule(weight_rule()).await.unwrap();

    let record = engine.run_due_rules(now()).await.unwrap();
    assert_eq!(record.status, RunStatus::Success);
    assert_eq!(record.trigger, RunTrigger::Scheduled);
    assert_eq!(record.violations_found, 1);

    let found = engine
        .get_violations(&ViolationFilter::new().with_rule("wt_change"))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].subject_id, "S001");
    assert_eq!(found[0].visit.as_deref(), Some("week4"));
    assert_eq!(found[0].field, "weight");
}

#[tokio::test]
async fn test_dropped_column_gives_partial_run() {
    let source = study_data();
    let engine = engine_with(source.clone()).await;
    for rule in [alt_rule(), bp_batch_rule(), weight_rule()] {
        assert!(engine.save_rule(rule).await.unwrap().success);
    }
    source.drop_column("labs", "alt").unwrap();

    let record = engine.run_due_rules(now()).await.unwrap();
    assert_eq!(record.status, RunStatus::Partial);
    assert_eq!(record.failed_rules(), vec!["alt_range"]);
    assert_eq!(record.rule_failures[0].kind, RuleFailureKind::Query);

    let stored = engine.get_violations(&ViolationFilter::new()).await.unwrap();
    let mut rules: Vec<&str> = stored.iter().map(|v| v.rule_id.as_str()).collect();
    rules.sort();
    assert_eq!(rules, vec!["bp_sweep", "wt_change"]);

    let runs = engine.recent_runs(5).await.unwrap();
    assert_eq!(runs[0].id, record.id);
    assert_eq!(runs[0].status, RunStatus::Partial);
}

#[tokio::test]
async fn test_due_rules_respect_schedule() {
    let engine = engine().await;
    engine.save_rule(weight_rule()).await.unwrap();

    let first = engine.run_due_rules(now()).await.unwrap();
    assert_eq!(first.rules_run, 1);

    // Interval of one hour: not due again ten minutes later
    let soon = now() + chrono::Duration::minutes(10);
    let second = engine.run_due_rules(soon).await.unwrap();
    assert_eq!(second.rules_run, 0);

    let later = now() + chrono::Duration::minutes(61);
    let third = engine.run_due_rules(later).await.unwrap();
    assert_eq!(third.rules_run, 1);
    assert_eq!(third.violations_found, 0);

    let all = engine.get_violations(&ViolationFilter::new()).await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_manual_rules_only_run_on_demand() {
    let engine = engine().await;
    engine
        .save_rule(Rule::new("bp_manual", "systolic_bp", "between 60 and 220").batch(RuleScope::Field))
        .await
        .unwrap();
    assert!(!engine.is_scheduled("bp_manual"));

    let scheduled = engine.run_due_rules(now()).await.unwrap();
    assert_eq!(scheduled.rules_run, 0);

    let manual = engine
        .run_qc_now(Some(&["bp_manual".to_string()]))
        .await
        .unwrap();
    assert_eq!(manual.trigger, RunTrigger::Manual);
    assert_eq!(manual.rules_run, 1);
    assert_eq!(manual.violations_found, 1);
}

#[tokio::test]
async fn test_run_qc_now_rejects_unknown_and_realtime_ids() {
    let engine = engine().await;
    engine
        .save_rule(Rule::new("bp_range", "systolic_bp", "between 40 and 200"))
        .await
        .unwrap();

    assert!(matches!(
        engine.run_qc_now(Some(&["ghost".to_string()])).await,
        Err(SdkError::RuleNotFound(_))
    ));
    assert!(matches!(
        engine.run_qc_now(Some(&["bp_range".to_string()])).await,
        Err(SdkError::WrongContext { context: RuleContext::RealTime, .. })
    ));
    assert!(!engine.cancel_qc_run());
}

#[tokio::test]
async fn test_deactivate_keeps_violations() {
    let engine = engine().await;
    engine.save_rule(weight_rule()).await.unwrap();
    engine.run_qc_now(None).await.unwrap();

    engine.deactivate_rule("wt_change").await.unwrap();
    assert!(engine.active_rule_ids().is_empty());

    let kept = engine
        .get_violations(&ViolationFilter::new().with_rule("wt_change"))
        .await
        .unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].status, ViolationStatus::Open);

    let record = engine.run_qc_now(None).await.unwrap();
    assert_eq!(record.rules_run, 0);
}

#[tokio::test]
async fn test_review_workflow() {
    let engine = engine().await;
    engine.save_rule(weight_rule()).await.unwrap();
    engine.run_due_rules(now()).await.unwrap();

    let found = engine.get_violations(&ViolationFilter::new()).await.unwrap();
    let id = found[0].id;

    let reviewed = engine
        .update_violation_status(id, ViolationStatus::FalsePositive)
        .await
        .unwrap();
    assert_eq!(reviewed.status, ViolationStatus::FalsePositive);

    // Still present in the data, but already reviewed
    let later = now() + chrono::Duration::hours(2);
    let record = engine.run_due_rules(later).await.unwrap();
    assert_eq!(record.violations_found, 0);

    let open = engine
        .get_violations(&ViolationFilter::new().with_status(ViolationStatus::Open))
        .await
        .unwrap();
    assert!(open.is_empty());
}

#[tokio::test]
async fn test_catalog_change_marks_batch_rule_broken() {
    let provider = Arc::new(StaticCatalogProvider::new(catalog()));
    let rules = Arc::new(MemoryRuleStore::new());
    let engine = ValidationEngineBuilder::new()
        .with_catalog_provider(provider.clone())
        .with_rule_store(rules.clone())
        .with_data_source(study_data())
        .build()
        .await
        .unwrap();
    engine.save_rule(alt_rule()).await.unwrap();
    engine.save_rule(bp_batch_rule()).await.unwrap();

    let mut shrunk = catalog();
    shrunk.remove("alt");
    provider.set_catalog(shrunk).await;
    engine.reload().await.unwrap();

    let record = engine.run_qc_now(None).await.unwrap();
    assert_eq!(record.status, RunStatus::Partial);
    assert_eq!(record.failed_rules(), vec!["alt_range"]);
    assert_eq!(record.rule_failures[0].kind, RuleFailureKind::Compile);

    // Still active so an author can see and fix it
    assert!(rules.get("alt_range").await.unwrap().active);
}

#[tokio::test]
async fn test_auto_resolve_from_config() {
    let source = study_data();
    let engine = ValidationEngineBuilder::new()
        .with_config(
            trialcheck_sdk::EngineConfig::new()
                .with_qc(QcConfig::default().with_auto_resolve(true)),
        )
        .with_catalog(catalog())
        .with_data_source(source.clone())
        .build()
        .await
        .unwrap();
    engine.save_rule(bp_batch_rule()).await.unwrap();
    engine.run_qc_now(None).await.unwrap();

    // S001 week4 reading corrected at the source
    let corrected = Table::new(["subject_id", "visit", "systolic_bp"])
        .with_row(row("S001", "baseline", &[("systolic_bp", 120.0.into())]))
        .with_row(row("S001", "week4", &[("systolic_bp", 150.0.into())]));
    source.put_table("vitals", corrected);

    let record = engine.run_qc_now(None).await.unwrap();
    assert_eq!(record.violations_resolved, 1);
    let resolved = engine
        .get_violations(&ViolationFilter::new().with_status(ViolationStatus::Resolved))
        .await
        .unwrap();
    assert_eq!(resolved.len(), 1);
    assert!(resolved[0].resolved_at.is_some());
}

// =============================================================================
// Persistence and safety
// =============================================================================

#[tokio::test]
async fn test_rules_survive_restart_on_disk() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let root = dir.path().join("rules");

    {
        let store = Arc::new(FileSystemRuleStore::create(&root).await?);
        let engine = ValidationEngineBuilder::new()
            .with_catalog(catalog())
            .with_rule_store(store)
            .build()
            .await?;
        engine
            .save_rule(Rule::new("bp_range", "systolic_bp", "between 40 and 200"))
            .await?;
        engine
            .save_rule(Rule::new("typo", "systolic_bp", "betwen 40 and 200"))
            .await?;
    }

    let store = Arc::new(FileSystemRuleStore::new(&root)?);
    let engine = ValidationEngineBuilder::new()
        .with_catalog(catalog())
        .with_rule_store(store.clone())
        .build()
        .await?;

    assert_eq!(engine.active_rule_ids(), vec!["bp_range".to_string()]);
    assert!(!store.get("typo").await?.active);
    let check = engine.validate_field("bp_range", &record(&[("systolic_bp", 35.0.into())]))?;
    assert!(!check.valid);
    Ok(())
}

#[tokio::test]
async fn test_sql_looking_literal_stays_data() -> anyhow::Result<()> {
    let text = "initials != \"AB'; DROP TABLE vitals; --\"";
    let rule = Rule::new("initials_check", "initials", text).batch(RuleScope::Field);

    let plan = Compiler::new()
        .compile(&rule, &catalog())?
        .batch
        .ok_or_else(|| anyhow::anyhow!("batch rule produced no plan"))?;
    let today = NaiveDate::from_ymd_opt(2024, 6, 1).ok_or_else(|| anyhow::anyhow!("bad date"))?;
    let statement = SqlRenderer::render(&plan, today)?;
    assert!(!statement.sql.contains("DROP TABLE"));
    assert!(statement
        .params
        .contains(&Value::from("AB'; DROP TABLE vitals; --")));

    let engine = engine().await;
    assert!(engine.save_rule(rule).await?.success);
    let record = engine.run_qc_now(None).await?;
    assert_eq!(record.status, RunStatus::Success);
    assert_eq!(record.violations_found, 0);
    Ok(())
}
