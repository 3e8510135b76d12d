//! Unit tests for semantic validation and both code generators
//!
//! Covers the author-facing compile path, real-time validator behaviour on
//! realistic form records, and the shape of generated batch plans.

use chrono::NaiveDate;
use trialcheck_compiler::*;
use trialcheck_core::ast::*;
use trialcheck_core::ir::primitive::Primitive;
use trialcheck_core::ir::*;
use trialcheck_core::types::{FieldCatalog, FieldDefinition, FieldType};
use trialcheck_core::Value;

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
        .with_field(FieldDefinition::new("sex", FieldType::Text).in_table("vitals"))
        .with_field(FieldDefinition::new("initials", FieldType::Text).in_table("vitals"))
        .with_field(FieldDefinition::new("consent_date", FieldType::Date).in_table("vitals"))
        .with_field(FieldDefinition::new("visit_date", FieldType::Date).in_table("vitals"))
        .with_field(FieldDefinition::new("pregnant", FieldType::Logical).in_table("vitals"))
        .with_field(FieldDefinition::new("alt", FieldType::Numeric).in_table("labs"))
}

fn record(pairs: &[(&str, Value)]) -> Record {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn ctx() -> EvalContext {
    EvalContext::new(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap())
}

fn realtime(field: &str, text: &str) -> RealTimeValidator {
    let rule = Rule::new("r1", field, text);
    Compiler::new()
        .compile(&rule, &catalog())
        .unwrap()
        .realtime
        .unwrap()
}

fn batch(field: &str, text: &str, scope: RuleScope) -> BatchQuery {
    let rule = Rule::new("b1", field, text).batch(scope);
    Compiler::new()
        .compile(&rule, &catalog())
        .unwrap()
        .batch
        .unwrap()
}

// =============================================================================
// Real-time Validators
// =============================================================================

#[test]
fn test_range_rule_cites_bounds() {
    let v = realtime("systolic_bp", "between 40 and 200");
    let result = v.evaluate(&record(&[("systolic_bp", Value::Number(35.0))]), &ctx());

    assert!(!result.valid);
    assert_eq!(result.status, EvaluationStatus::Failed);
    let message = result.message.unwrap();
    assert!(message.contains("40"));
    assert!(message.contains("200"));

    let ok = v.evaluate(&record(&[("systolic_bp", Value::Number(40.0))]), &ctx());
    assert!(ok.valid);
    assert_eq!(ok.status, EvaluationStatus::Passed);
}

#[test]
fn test_age_dependent_conditional() {
    let v = realtime(
        "bp",
        "if age >= 65 then between 90 and 180 else between 110 and 200 endif",
    );

    let senior = record(&[("age", Value::Number(70.0)), ("bp", Value::Number(150.0))]);
    assert!(v.evaluate(&senior, &ctx()).valid);

    let adult = record(&[("age", Value::Number(40.0)), ("bp", Value::Number(250.0))]);
    let result = v.evaluate(&adult, &ctx());
    assert!(!result.valid);
    assert_eq!(result.status, EvaluationStatus::Failed);
}

#[test]
fn test_untaken_branch_does_not_skip() {
    let v = realtime(
        "pregnant",
        "if sex = \"F\" then pregnant in (true, false) else true endif",
    );
    let male = record(&[("sex", Value::from("M"))]);
    assert_eq!(v.evaluate(&male, &ctx()).status, EvaluationStatus::Passed);
}

#[test]
fn test_missing_field_skips() {
    let v = realtime("systolic_bp", "between 40 and 200");
    let result = v.evaluate(&record(&[]), &ctx());
    assert!(result.valid);
    assert_eq!(result.status, EvaluationStatus::Skipped);
}

#[test]
fn test_allow_missing_passes() {
    let v = realtime("weight", "> 30 allow missing");
    assert_eq!(
        v.evaluate(&record(&[("weight", Value::from("UNK"))]), &ctx()).status,
        EvaluationStatus::Passed
    );
    assert_eq!(
        v.evaluate(&record(&[("weight", Value::Number(12.0))]), &ctx()).status,
        EvaluationStatus::Failed
    );
}

#[test]
fn test_allow_tokens() {
    let v = realtime("weight", "> 30 allow \"ND\"");
    assert_eq!(
        v.evaluate(&record(&[("weight", Value::from("nd"))]), &ctx()).status,
        EvaluationStatus::Passed
    );
    assert_eq!(
        v.evaluate(&record(&[("weight", Value::from("UNK"))]), &ctx()).status,
        EvaluationStatus::Skipped
    );
}

#[test]
fn test_required_and_is_blank() {
    let v = realtime("initials", "required");
    assert!(!v.evaluate(&record(&[("initials", Value::from(" "))]), &ctx()).valid);
    assert!(v.evaluate(&record(&[("initials", Value::from("ABC"))]), &ctx()).valid);

    let v = realtime("initials", "is_blank(initials) or length(initials) between 2 and 3");
    assert_eq!(
        v.evaluate(&record(&[]), &ctx()).status,
        EvaluationStatus::Passed
    );
    assert_eq!(
        v.evaluate(&record(&[("initials", Value::from("ABCD"))]), &ctx()).status,
        EvaluationStatus::Failed
    );
}

#[test]
fn test_date_window_and_today() {
    let v = realtime("visit_date", "within 3 days of consent_date + 28 days");
    let consent = Value::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    let on_time = record(&[
        ("consent_date", consent.clone()),
        ("visit_date", Value::from("2024-02-01")),
    ]);
    assert!(v.evaluate(&on_time, &ctx()).valid);

    let late = record(&[
        ("consent_date", consent),
        ("visit_date", Value::from("2024-02-03")),
    ]);
    assert!(!v.evaluate(&late, &ctx()).valid);

    let v = realtime("visit_date", "<= today");
    let future = record(&[("visit_date", Value::from("2024-06-02"))]);
    assert!(!v.evaluate(&future, &ctx()).valid);
}

#[test]
fn test_far_date_shift_rejected_before_evaluation() {
    for text in [
        "<= today + 200000000000000 days",
        "within 2000000000000000000 weeks of consent_date",
    ] {
        let rule = Rule::new("r1", "visit_date", text);
        let result = Compiler::new().compile(&rule, &catalog());
        assert!(CompileResult::from(&result).syntax_error.is_some(), "{}", text);
    }

    let v = realtime("visit_date", "<= today + 3650000 days");
    let result = v.evaluate(&record(&[("visit_date", Value::from("2024-06-02"))]), &ctx());
    assert_eq!(result.status, EvaluationStatus::Passed);
}

#[test]
fn test_division_by_zero_fails_open() {
    let v = realtime("systolic_bp", "systolic_bp / (age - age) > 1");
    let result = v.evaluate(
        &record(&[("systolic_bp", Value::Number(120.0)), ("age", Value::Number(50.0))]),
        &ctx(),
    );
    assert!(result.valid);
    assert_eq!(result.status, EvaluationStatus::Error);
}

#[test]
fn test_identical_text_compiles_to_identical_behaviour() {
    let text = "if age >= 65 then between 90 and 180 else between 110 and 200 endif";
    let a = realtime("bp", text);
    let b = realtime("bp", text);
    assert_eq!(a.content_hash(), b.content_hash());
    assert_eq!(a.call_graph(), b.call_graph());

    for (age, bp) in [(70.0, 150.0), (40.0, 250.0), (65.0, 90.0), (64.0, 109.0)] {
        let r = record(&[("age", Value::Number(age)), ("bp", Value::Number(bp))]);
        assert_eq!(a.evaluate(&r, &ctx()), b.evaluate(&r, &ctx()));
    }
}

#[test]
fn test_call_graph_only_whitelisted_primitives() {
    let v = realtime(
        "visit_date",
        "if pregnant then date_diff(visit_date, consent_date) between 0 and 280 \
         else abs(age - 40) < 100 and not (sex in (\"X\")) endif",
    );
    assert!(!v.call_graph().is_empty());
    for p in v.call_graph() {
        assert!(Primitive::ALL.contains(p), "unexpected primitive {:?}", p);
    }
    assert_eq!(v.call_counts().get(&Primitive::Select), Some(&1));
}

// =============================================================================
// Semantic Validation
// =============================================================================

#[test]
fn test_unknown_field_rejected() {
    let rule = Rule::new("r1", "systolic_bp", "foo_bar > 3");
    let err = Compiler::new().compile(&rule, &catalog()).unwrap_err();
    let errors = err.semantic_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, SemanticErrorKind::UnknownField);
    assert!(errors[0].message.contains("foo_bar"));
    assert!(err.is_author_error());
}

#[test]
fn test_all_errors_reported_in_one_pass() {
    let rule = Rule::new("r1", "systolic_bp", "foo > 1 and bar > 2 and eval(\"x\")");
    let err = Compiler::new().compile(&rule, &catalog()).unwrap_err();
    let kinds: Vec<_> = err.semantic_errors().iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            SemanticErrorKind::UnknownField,
            SemanticErrorKind::UnknownField,
            SemanticErrorKind::UnknownFunction,
        ]
    );
}

#[test]
fn test_unknown_function_rejected() {
    let rule = Rule::new("r1", "initials", "exec(initials)");
    let err = Compiler::new().compile(&rule, &catalog()).unwrap_err();
    assert!(err
        .semantic_errors()
        .iter()
        .any(|e| e.kind == SemanticErrorKind::UnknownFunction));
}

#[test]
fn test_cross_patient_in_realtime_rejected() {
    let rule = Rule::new("r1", "weight", "weight < mean(weight) + 3 * sd(weight)")
        .with_scope(RuleScope::CrossPatient);
    let err = Compiler::new().compile(&rule, &catalog()).unwrap_err();
    assert!(err
        .semantic_errors()
        .iter()
        .any(|e| e.kind == SemanticErrorKind::IllegalScope));
}

#[test]
fn test_visit_reference_in_realtime_rejected() {
    let rule = Rule::new("r1", "weight", "within 10% of visit(\"baseline\").weight");
    let err = Compiler::new().compile(&rule, &catalog()).unwrap_err();
    assert_eq!(err.semantic_errors()[0].kind, SemanticErrorKind::IllegalScope);
}

#[test]
fn test_type_mismatch() {
    let rule = Rule::new("r1", "sex", "sex > 3");
    let err = Compiler::new().compile(&rule, &catalog()).unwrap_err();
    assert_eq!(err.semantic_errors()[0].kind, SemanticErrorKind::TypeMismatch);

    let rule = Rule::new("r1", "age", "age + 1");
    let err = Compiler::new().compile(&rule, &catalog()).unwrap_err();
    assert_eq!(err.semantic_errors()[0].kind, SemanticErrorKind::NotBoolean);
}

#[test]
fn test_cross_table_reference_in_batch() {
    let rule = Rule::new("b1", "weight", "alt < 100").batch(RuleScope::CrossField);
    let err = Compiler::new().compile(&rule, &catalog()).unwrap_err();
    assert_eq!(
        err.semantic_errors()[0].kind,
        SemanticErrorKind::CrossTableReference
    );
}

#[test]
fn test_syntax_error_surfaces_in_compile_result() {
    let rule = Rule::new("r1", "systolic_bp", "between 40 200");
    let result = Compiler::new().compile(&rule, &catalog());
    let feedback = CompileResult::from(&result);
    assert!(!feedback.success);
    assert!(feedback.syntax_error.is_some());
    assert_eq!(feedback.messages(&rule.text).len(), 1);
}

#[test]
fn test_compile_result_success() {
    let rule = Rule::new("r1", "systolic_bp", "between 40 and 200");
    let result = Compiler::new().compile(&rule, &catalog());
    let feedback = CompileResult::from(&result);
    assert!(feedback.success);
    assert_eq!(feedback.description.as_deref(), Some("between 40 and 200"));
    assert!(feedback.messages(&rule.text).is_empty());
}

// =============================================================================
// Batch Plans
// =============================================================================

#[test]
fn test_field_scope_batch_is_plain_projection() {
    let plan = batch("systolic_bp", "between 40 and 200", RuleScope::Field);
    assert_eq!(plan.shape, QueryShape::Projection);
    assert!(!plan.is_cross_record());
    assert_eq!(plan.table, "vitals");
    assert_eq!(
        plan.parameters(),
        vec![Value::Number(40.0), Value::Number(200.0)]
    );
}

#[test]
fn test_cross_visit_plan() {
    let plan = batch(
        "weight",
        "within 10% of visit(\"baseline\").weight",
        RuleScope::CrossVisit,
    );
    assert_eq!(
        plan.shape,
        QueryShape::PriorVisitJoin {
            visits: vec!["baseline".to_string()]
        }
    );
    let relations: Vec<_> = plan.ok.columns().iter().map(|c| c.relation.clone()).collect();
    assert!(relations.contains(&Relation::Current));
    assert!(relations.contains(&Relation::Visit("baseline".to_string())));
}

#[test]
fn test_cross_patient_plan() {
    let plan = batch(
        "weight",
        "abs(weight - mean(weight)) <= 3 * sd(weight)",
        RuleScope::CrossPatient,
    );
    match &plan.shape {
        QueryShape::PopulationAggregate { aggregates } => {
            let funcs: Vec<_> = aggregates.iter().map(|(f, _)| *f).collect();
            assert_eq!(funcs, vec![AggregateFn::Mean, AggregateFn::Sd]);
        }
        other => panic!("unexpected shape {:?}", other),
    }
}

#[test]
fn test_cross_patient_without_aggregate_rejected() {
    let rule = Rule::new("b1", "weight", "> 30").batch(RuleScope::CrossPatient);
    let err = Compiler::new().compile(&rule, &catalog()).unwrap_err();
    assert_eq!(err.semantic_errors()[0].kind, SemanticErrorKind::ScopeUnused);
}

#[test]
fn test_dataset_plan_uses_expected_table() {
    let rule = Rule::new("b1", "visit_date", "required").batch(RuleScope::Dataset);
    let compiler = Compiler::with_options(
        CompilerOptions::default().with_expected_visits_table("protocol_visits"),
    );
    let plan = compiler.compile(&rule, &catalog()).unwrap().batch.unwrap();
    assert_eq!(
        plan.shape,
        QueryShape::Completeness {
            expected_table: "protocol_visits".to_string()
        }
    );
}

#[test]
fn test_allow_clause_compiled_into_ok_expression() {
    let plan = batch("weight", "> 30 allow \"ND\"", RuleScope::Field);
    match &plan.ok {
        RowExpr::Or(left, _) => assert!(matches!(**left, RowExpr::HasToken { .. })),
        other => panic!("unexpected ok expression {:?}", other),
    }
    assert!(plan.target.is_missing_token("nd"));
    assert!(plan.target.is_missing_token("UNK"));
}

#[test]
fn test_realtime_rule_has_no_batch_plan() {
    let rule = Rule::new("r1", "systolic_bp", "between 40 and 200");
    let compiled = Compiler::new().compile(&rule, &catalog()).unwrap();
    assert!(compiled.realtime.is_some());
    assert!(compiled.batch.is_none());
    assert_eq!(compiled.rule_id(), "r1");
}
