//! Typed AST
//!
//! Output of semantic validation. Every field reference is resolved against
//! the catalog, every call against the builtin whitelist, and every node
//! carries its result type. Both code generators consume this tree.

use super::operator::{AggregateFn, ArithOp, CompareOp, LogicalOp, Tolerance};
use super::rule::{Rule, RuleScope};
use super::rule_ast::AllowKind;
use super::span::Span;
use crate::types::{FieldDefinition, FieldType, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A catalog field resolved for evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRef {
    pub name: String,
    pub field_type: FieldType,
    /// Catalog missing tokens for this field
    pub missing_tokens: Vec<String>,
}

impl FieldRef {
    pub fn from_definition(def: &FieldDefinition) -> Self {
        Self {
            name: def.name.clone(),
            field_type: def.field_type,
            missing_tokens: def.missing_tokens.clone(),
        }
    }

    pub fn is_missing_token(&self, text: &str) -> bool {
        let text = text.trim();
        self.missing_tokens.iter().any(|t| t.eq_ignore_ascii_case(text))
    }
}

/// Whitelisted scalar functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Builtin {
    /// `length(text) -> numeric`
    Length,
    /// `is_blank(any) -> logical`
    IsBlank,
    /// `date_diff(date, date) -> numeric`, days, first minus second
    DateDiff,
    /// `abs(numeric) -> numeric`
    Abs,
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "length" => Some(Builtin::Length),
            "is_blank" => Some(Builtin::IsBlank),
            "date_diff" => Some(Builtin::DateDiff),
            "abs" => Some(Builtin::Abs),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Length => "length",
            Builtin::IsBlank => "is_blank",
            Builtin::DateDiff => "date_diff",
            Builtin::Abs => "abs",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Builtin::DateDiff => 2,
            _ => 1,
        }
    }

    pub fn return_type(&self) -> FieldType {
        match self {
            Builtin::IsBlank => FieldType::Logical,
            Builtin::Length | Builtin::DateDiff | Builtin::Abs => FieldType::Numeric,
        }
    }
}

/// Typed expression node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedExpr {
    pub kind: TypedKind,
    pub ty: FieldType,
    pub span: Span,
}

/// Typed node kinds
///
/// The implicit subject is resolved to a `Field` of the target; date
/// arithmetic is normalised to a signed day offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypedKind {
    Literal(Value),
    Field(FieldRef),
    Today,
    /// Presence check on the target field
    Required(FieldRef),
    Compare {
        left: Box<TypedExpr>,
        op: CompareOp,
        right: Box<TypedExpr>,
    },
    Arithmetic {
        left: Box<TypedExpr>,
        op: ArithOp,
        right: Box<TypedExpr>,
    },
    Between {
        value: Box<TypedExpr>,
        low: Box<TypedExpr>,
        high: Box<TypedExpr>,
    },
    InList {
        value: Box<TypedExpr>,
        items: Vec<Value>,
        negated: bool,
    },
    Logical {
        op: LogicalOp,
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    Not(Box<TypedExpr>),
    Negate(Box<TypedExpr>),
    /// A missing else branch passes
    Conditional {
        condition: Box<TypedExpr>,
        then_branch: Box<TypedExpr>,
        else_branch: Option<Box<TypedExpr>>,
    },
    DateShift {
        base: Box<TypedExpr>,
        days: i64,
    },
    Within {
        value: Box<TypedExpr>,
        reference: Box<TypedExpr>,
        tolerance: Tolerance,
    },
    Builtin {
        func: Builtin,
        args: Vec<TypedExpr>,
    },
    VisitRef {
        visit: String,
        field: FieldRef,
    },
    Aggregate {
        func: AggregateFn,
        field: FieldRef,
    },
}

impl TypedExpr {
    pub fn new(kind: TypedKind, ty: FieldType, span: Span) -> Self {
        Self { kind, ty, span }
    }

    /// Visit every node in pre-order
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a TypedExpr)) {
        visit(self);
        match &self.kind {
            TypedKind::Literal(_)
            | TypedKind::Field(_)
            | TypedKind::Today
            | TypedKind::Required(_)
            | TypedKind::VisitRef { .. }
            | TypedKind::Aggregate { .. } => {}
            TypedKind::Compare { left, right, .. }
            | TypedKind::Arithmetic { left, right, .. }
            | TypedKind::Logical { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            TypedKind::Between { value, low, high } => {
                value.walk(visit);
                low.walk(visit);
                high.walk(visit);
            }
            TypedKind::InList { value, .. } => value.walk(visit),
            TypedKind::Not(inner) | TypedKind::Negate(inner) => inner.walk(visit),
            TypedKind::Conditional {
                condition,
                then_branch,
                else_branch,
            } => {
                condition.walk(visit);
                then_branch.walk(visit);
                if let Some(e) = else_branch {
                    e.walk(visit);
                }
            }
            TypedKind::DateShift { base, .. } => base.walk(visit),
            TypedKind::Within {
                value, reference, ..
            } => {
                value.walk(visit);
                reference.walk(visit);
            }
            TypedKind::Builtin { args, .. } => {
                for arg in args {
                    arg.walk(visit);
                }
            }
        }
    }
}

/// A semantically validated rule, ready for code generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedRule {
    /// Rule metadata as authored
    pub rule: Rule,

    /// Typed body, always logical
    pub body: TypedExpr,

    /// Resolved allow clause
    pub allow: Option<AllowKind>,

    /// Target field
    pub target: FieldRef,

    /// Table holding the target field
    pub table: String,

    /// Fields of the current record the body reads
    pub fields: BTreeSet<String>,

    /// Visits named by `visit("...")` references
    pub prior_visits: BTreeSet<String>,

    /// Aggregated columns
    pub aggregates: BTreeSet<(AggregateFn, String)>,

    /// Content hash of the rule against the catalog version it was checked with
    pub content_hash: String,

    /// Human-readable expected constraint
    pub description: String,
}

impl TypedRule {
    pub fn id(&self) -> &str {
        &self.rule.id
    }

    pub fn scope(&self) -> RuleScope {
        self.rule.scope
    }

    /// True if evaluation needs rows other than the current record
    pub fn requires_cross_record(&self) -> bool {
        !self.prior_visits.is_empty()
            || !self.aggregates.is_empty()
            || self.rule.scope == RuleScope::Dataset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_whitelist() {
        assert_eq!(Builtin::from_name("DATE_DIFF"), Some(Builtin::DateDiff));
        assert_eq!(Builtin::DateDiff.arity(), 2);
        assert_eq!(Builtin::IsBlank.return_type(), FieldType::Logical);
        assert_eq!(Builtin::from_name("eval"), None);
        assert_eq!(Builtin::from_name("exec"), None);
    }

    #[test]
    fn test_field_ref_missing_token() {
        let def = FieldDefinition::new("weight", FieldType::Numeric).with_missing_tokens(["ND"]);
        let field = FieldRef::from_definition(&def);
        assert!(field.is_missing_token("nd"));
        assert!(!field.is_missing_token("70"));
    }
}
