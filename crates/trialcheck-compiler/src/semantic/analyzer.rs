//! Semantic analyzer
//!
//! Validates a parsed rule against the field catalog and the rule's
//! context and scope, producing the `TypedRule` both code generators
//! consume. Every problem found is reported, not just the first.

use super::type_checker::TypeChecker;
use crate::error::{SemanticError, SemanticErrorKind};
use trialcheck_core::ast::{RuleAst, RuleContext, RuleScope, TypedRule};
use trialcheck_core::types::{FieldCatalog, FieldType};
use trialcheck_core::Rule;

/// Semantic analyzer
#[derive(Debug, Default, Clone)]
pub struct SemanticAnalyzer;

impl SemanticAnalyzer {
    /// Create a new semantic analyzer
    pub fn new() -> Self {
        Self
    }

    /// Validate a parsed rule
    pub fn analyze(
        &self,
        ast: &RuleAst,
        catalog: &FieldCatalog,
        rule: &Rule,
    ) -> std::result::Result<TypedRule, Vec<SemanticError>> {
        let mut checker = TypeChecker::new(catalog, rule);
        let mut errors = Vec::new();

        // 1. Scope beyond a single field needs the batch context
        if rule.scope.requires_batch() && rule.context == RuleContext::RealTime {
            errors.push(SemanticError::new(
                SemanticErrorKind::IllegalScope,
                ast.span,
                format!(
                    "scope '{}' needs context 'batch', rule is '{}'",
                    rule.scope, rule.context
                ),
            ));
        }

        // 2. Target field must exist
        if checker.target().is_none() {
            errors.push(SemanticError::new(
                SemanticErrorKind::UnknownField,
                ast.span,
                format!("target field '{}' is not in the catalog", rule.field),
            ));
        }

        // 3. Type-check the body
        let body = checker.check(&ast.body);

        // 4. The body must be a logical expression
        if let Some(body) = &body {
            if body.ty != FieldType::Logical {
                errors.push(SemanticError::new(
                    SemanticErrorKind::NotBoolean,
                    body.span,
                    format!("rule body must be logical, found {}", body.ty),
                ));
            }
        }

        // 5. Declared cross-record scope must be used
        if rule.context == RuleContext::Batch {
            match rule.scope {
                RuleScope::CrossVisit if checker.prior_visits.is_empty() => {
                    errors.push(SemanticError::new(
                        SemanticErrorKind::ScopeUnused,
                        ast.span,
                        "cross_visit rule has no visit(\"...\") reference",
                    ));
                }
                RuleScope::CrossPatient if checker.aggregates.is_empty() => {
                    errors.push(SemanticError::new(
                        SemanticErrorKind::ScopeUnused,
                        ast.span,
                        "cross_patient rule uses neither mean() nor sd()",
                    ));
                }
                _ => {}
            }
        }

        let target = checker.target().cloned();
        let table = checker.target_table().map(str::to_string);
        let prior_visits = std::mem::take(&mut checker.prior_visits);
        let aggregates = std::mem::take(&mut checker.aggregates);
        let fields = std::mem::take(&mut checker.fields);

        // Checker errors come first, in source order
        let mut all = checker.into_errors();
        all.extend(errors);
        all.sort_by_key(|e| (e.span.start, e.span.end));
        all.dedup();

        match (body, target, table) {
            (Some(body), Some(target), Some(table)) if all.is_empty() => Ok(TypedRule {
                rule: rule.clone(),
                description: ast.body.to_string(),
                body,
                allow: ast.allow.as_ref().map(|a| a.kind.clone()),
                target,
                table,
                fields,
                prior_visits,
                aggregates,
                content_hash: rule.content_hash(catalog.version()),
            }),
            _ => {
                if all.is_empty() {
                    // A child failed without recording why; never let it through
                    all.push(SemanticError::new(
                        SemanticErrorKind::TypeMismatch,
                        ast.span,
                        "rule body could not be typed",
                    ));
                }
                Err(all)
            }
        }
    }
}
