//! Batch code generator
//!
//! Lowers a `TypedRule` into a `BatchQuery`: a row-level "ok" expression
//! plus the join/aggregation shape the rule's scope calls for.

use crate::error::{CompileError, Result};
use trialcheck_core::ast::{
    AggregateFn, AllowKind, Builtin, FieldRef, LogicalOp, RuleScope, TypedExpr, TypedKind, TypedRule,
};
use trialcheck_core::ir::{BatchQuery, Column, QueryShape, RowExpr, TableLayout};
use trialcheck_core::Value;

/// Batch code generation options
#[derive(Debug, Clone)]
pub struct BatchCodegenOptions {
    /// Table listing the (subject, visit) pairs the protocol expects
    pub expected_table: String,
    /// Shared column names of observation tables
    pub layout: TableLayout,
}

impl Default for BatchCodegenOptions {
    fn default() -> Self {
        Self {
            expected_table: "expected_visits".to_string(),
            layout: TableLayout::default(),
        }
    }
}

/// Batch code generator
pub struct BatchCodegen<'a> {
    options: &'a BatchCodegenOptions,
    allow_tokens: Vec<String>,
}

impl<'a> BatchCodegen<'a> {
    pub fn new(options: &'a BatchCodegenOptions) -> Self {
        Self {
            options,
            allow_tokens: Vec::new(),
        }
    }

    /// Compile a typed rule into a query plan
    pub fn compile(mut self, typed: &TypedRule) -> Result<BatchQuery> {
        if let Some(AllowKind::Tokens(tokens)) = &typed.allow {
            self.allow_tokens = tokens.clone();
        }

        let target = self.column_field(&typed.target);
        let body = self.lower(&typed.body)?;

        let ok = match &typed.allow {
            None => body,
            Some(AllowKind::Missing) => RowExpr::Or(
                RowExpr::IsNull(RowExpr::Column(Column::current(target.clone())).boxed()).boxed(),
                body.boxed(),
            ),
            Some(AllowKind::Tokens(tokens)) => RowExpr::Or(
                RowExpr::HasToken {
                    column: Column::current(typed.target.clone()),
                    tokens: tokens.clone(),
                }
                .boxed(),
                body.boxed(),
            ),
        };

        let shape = match typed.scope() {
            RuleScope::Field | RuleScope::CrossField => QueryShape::Projection,
            RuleScope::CrossVisit => QueryShape::PriorVisitJoin {
                visits: typed.prior_visits.iter().cloned().collect(),
            },
            RuleScope::CrossPatient => {
                let mut aggregates = Vec::new();
                ok.walk(&mut |node| {
                    if let RowExpr::Aggregate { func, field } = node {
                        if !aggregates.iter().any(|(f, c): &(AggregateFn, FieldRef)| {
                            f == func && c.name == field.name
                        }) {
                            aggregates.push((*func, field.clone()));
                        }
                    }
                });
                QueryShape::PopulationAggregate { aggregates }
            }
            RuleScope::Dataset => QueryShape::Completeness {
                expected_table: self.options.expected_table.clone(),
            },
        };

        Ok(BatchQuery {
            rule_id: typed.rule.id.clone(),
            content_hash: typed.content_hash.clone(),
            scope: typed.scope(),
            severity: typed.rule.severity,
            table: typed.table.clone(),
            target,
            shape,
            ok,
            description: typed.description.clone(),
            layout: self.options.layout.clone(),
        })
    }

    /// Field reference with the rule's allow tokens folded into its
    /// missing tokens, so allowed values read as NULL
    fn column_field(&self, field: &FieldRef) -> FieldRef {
        let mut field = field.clone();
        for token in &self.allow_tokens {
            if !field.is_missing_token(token) {
                field.missing_tokens.push(token.clone());
            }
        }
        field
    }

    fn lower(&self, expr: &TypedExpr) -> Result<RowExpr> {
        Ok(match &expr.kind {
            TypedKind::Literal(value) => RowExpr::Const(value.clone()),

            TypedKind::Field(field) => RowExpr::Column(Column::current(self.column_field(field))),

            TypedKind::Today => RowExpr::Today,

            TypedKind::Required(field) => RowExpr::Not(
                RowExpr::IsNull(
                    RowExpr::Column(Column::current(self.column_field(field))).boxed(),
                )
                .boxed(),
            ),

            TypedKind::Compare { left, op, right } => RowExpr::Compare {
                left: self.lower(left)?.boxed(),
                op: *op,
                right: self.lower(right)?.boxed(),
            },

            TypedKind::Arithmetic { left, op, right } => RowExpr::Arith {
                left: self.lower(left)?.boxed(),
                op: *op,
                right: self.lower(right)?.boxed(),
            },

            TypedKind::Between { value, low, high } => RowExpr::Between {
                value: self.lower(value)?.boxed(),
                low: self.lower(low)?.boxed(),
                high: self.lower(high)?.boxed(),
            },

            TypedKind::InList {
                value,
                items,
                negated,
            } => RowExpr::InList {
                value: self.lower(value)?.boxed(),
                items: items.clone(),
                negated: *negated,
            },

            TypedKind::Logical { op, left, right } => {
                let l = self.lower(left)?.boxed();
                let r = self.lower(right)?.boxed();
                match op {
                    LogicalOp::And => RowExpr::And(l, r),
                    LogicalOp::Or => RowExpr::Or(l, r),
                }
            }

            TypedKind::Not(inner) => RowExpr::Not(self.lower(inner)?.boxed()),

            TypedKind::Negate(inner) => RowExpr::Negate(self.lower(inner)?.boxed()),

            TypedKind::Conditional {
                condition,
                then_branch,
                else_branch,
            } => RowExpr::Case {
                condition: self.lower(condition)?.boxed(),
                then_branch: self.lower(then_branch)?.boxed(),
                else_branch: match else_branch {
                    Some(e) => self.lower(e)?.boxed(),
                    None => RowExpr::Const(Value::Bool(true)).boxed(),
                },
            },

            TypedKind::DateShift { base, days } => RowExpr::DateShift {
                base: self.lower(base)?.boxed(),
                days: *days,
            },

            TypedKind::Within {
                value,
                reference,
                tolerance,
            } => RowExpr::Within {
                value: self.lower(value)?.boxed(),
                reference: self.lower(reference)?.boxed(),
                tolerance: *tolerance,
            },

            TypedKind::Builtin { func, args } => {
                if args.len() != func.arity() {
                    return Err(CompileError::Internal(format!(
                        "{}() compiled with {} arguments",
                        func.name(),
                        args.len()
                    )));
                }
                match func {
                    Builtin::Length => RowExpr::Length(self.lower(&args[0])?.boxed()),
                    Builtin::IsBlank => RowExpr::IsNull(self.lower(&args[0])?.boxed()),
                    Builtin::DateDiff => RowExpr::DateDiff(
                        self.lower(&args[0])?.boxed(),
                        self.lower(&args[1])?.boxed(),
                    ),
                    Builtin::Abs => RowExpr::Abs(self.lower(&args[0])?.boxed()),
                }
            }

            TypedKind::VisitRef { visit, field } => {
                RowExpr::Column(Column::at_visit(visit.clone(), self.column_field(field)))
            }

            TypedKind::Aggregate { func, field } => RowExpr::Aggregate {
                func: *func,
                field: self.column_field(field),
            },
        })
    }
}
