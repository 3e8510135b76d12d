//! Type checker
//!
//! Resolves every field and function reference in a rule body and infers
//! node types, producing a `TypedExpr`. Problems are collected rather than
//! returned on first sight so authors see every error in one pass.

use crate::error::{SemanticError, SemanticErrorKind};
use std::collections::BTreeSet;
use trialcheck_core::ast::{
    AggregateFn, Builtin, ExprKind, Expression, FieldRef, LogicalOp, Rule, RuleContext,
    RuleScope, Span, Tolerance, TypedExpr, TypedKind,
};
use trialcheck_core::types::{FieldCatalog, FieldType};
use trialcheck_core::Value;

/// Declared type of a literal
pub fn literal_type(value: &Value) -> Option<FieldType> {
    match value {
        Value::Number(_) => Some(FieldType::Numeric),
        Value::String(_) => Some(FieldType::Text),
        Value::Date(_) => Some(FieldType::Date),
        Value::Bool(_) => Some(FieldType::Logical),
        Value::Null => None,
    }
}

/// Type checker for one rule body
pub struct TypeChecker<'a> {
    catalog: &'a FieldCatalog,
    rule: &'a Rule,
    /// Resolved target field, if it exists
    target: Option<FieldRef>,
    /// Table of the target field
    target_table: Option<String>,
    errors: Vec<SemanticError>,
    /// Current-record fields read by the body
    pub fields: BTreeSet<String>,
    /// Visits named by scoped references
    pub prior_visits: BTreeSet<String>,
    /// Aggregated columns
    pub aggregates: BTreeSet<(AggregateFn, String)>,
}

impl<'a> TypeChecker<'a> {
    /// Create a checker for a rule against a catalog
    pub fn new(catalog: &'a FieldCatalog, rule: &'a Rule) -> Self {
        let def = catalog.get(&rule.field);
        Self {
            catalog,
            rule,
            target: def.map(FieldRef::from_definition),
            target_table: def.map(|d| d.table.clone()),
            errors: Vec::new(),
            fields: BTreeSet::new(),
            prior_visits: BTreeSet::new(),
            aggregates: BTreeSet::new(),
        }
    }

    pub fn target(&self) -> Option<&FieldRef> {
        self.target.as_ref()
    }

    pub fn target_table(&self) -> Option<&str> {
        self.target_table.as_deref()
    }

    /// Errors collected so far
    pub fn into_errors(self) -> Vec<SemanticError> {
        self.errors
    }

    pub fn errors(&self) -> &[SemanticError] {
        &self.errors
    }

    fn error(&mut self, kind: SemanticErrorKind, span: Span, message: impl Into<String>) {
        self.errors.push(SemanticError::new(kind, span, message));
    }

    fn is_batch(&self) -> bool {
        self.rule.context == RuleContext::Batch
    }

    /// Look a field up in the catalog and, for batch rules, check it lives
    /// in the target's table
    fn resolve_field(&mut self, name: &str, span: Span) -> Option<FieldRef> {
        let catalog = self.catalog;
        let Some(def) = catalog.get(name) else {
            self.error(
                SemanticErrorKind::UnknownField,
                span,
                format!("field '{}' is not in the catalog", name),
            );
            return None;
        };

        if self.is_batch() {
            let foreign = self
                .target_table
                .as_ref()
                .filter(|table| **table != def.table)
                .cloned();
            if let Some(table) = foreign {
                let message = format!(
                    "field '{}' is stored in table '{}' but the rule target lives in '{}'",
                    name, def.table, table
                );
                self.error(SemanticErrorKind::CrossTableReference, span, message);
            }
        }

        Some(FieldRef::from_definition(def))
    }

    fn mismatch(&mut self, span: Span, message: impl Into<String>) {
        self.error(SemanticErrorKind::TypeMismatch, span, message);
    }

    fn expect_type(&mut self, expr: &TypedExpr, expected: FieldType, role: &str) -> bool {
        if expr.ty == expected {
            true
        } else {
            self.mismatch(
                expr.span,
                format!("{} must be {}, found {}", role, expected, expr.ty),
            );
            false
        }
    }

    /// Type-check an expression. Returns `None` if it (or a child) is ill-typed;
    /// the error has been recorded.
    pub fn check(&mut self, expr: &Expression) -> Option<TypedExpr> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Literal(value) => {
                let ty = literal_type(value)?;
                Some(TypedExpr::new(TypedKind::Literal(value.clone()), ty, span))
            }

            ExprKind::Field(name) => {
                let field = self.resolve_field(name, span)?;
                self.fields.insert(field.name.clone());
                let ty = field.field_type;
                Some(TypedExpr::new(TypedKind::Field(field), ty, span))
            }

            ExprKind::Subject => {
                // An unknown target is reported once by the analyzer
                let field = self.target.clone()?;
                self.fields.insert(field.name.clone());
                let ty = field.field_type;
                Some(TypedExpr::new(TypedKind::Field(field), ty, span))
            }

            ExprKind::Today => Some(TypedExpr::new(TypedKind::Today, FieldType::Date, span)),

            ExprKind::Required => {
                let field = self.target.clone()?;
                self.fields.insert(field.name.clone());
                Some(TypedExpr::new(
                    TypedKind::Required(field),
                    FieldType::Logical,
                    span,
                ))
            }

            ExprKind::Compare { left, op, right } => {
                let l = self.check(left);
                let r = self.check(right);
                let (l, r) = (l?, r?);
                if l.ty != r.ty {
                    self.mismatch(
                        span,
                        format!("cannot compare {} with {}", l.ty, r.ty),
                    );
                    return None;
                }
                if op.is_ordering() && !matches!(l.ty, FieldType::Numeric | FieldType::Date) {
                    self.mismatch(
                        span,
                        format!("'{}' needs numeric or date operands, found {}", op.symbol(), l.ty),
                    );
                    return None;
                }
                Some(TypedExpr::new(
                    TypedKind::Compare {
                        left: Box::new(l),
                        op: *op,
                        right: Box::new(r),
                    },
                    FieldType::Logical,
                    span,
                ))
            }

            ExprKind::Arithmetic { left, op, right } => {
                let l = self.check(left);
                let r = self.check(right);
                let (l, r) = (l?, r?);
                let ok_l = self.expect_type(&l, FieldType::Numeric, "arithmetic operand");
                let ok_r = self.expect_type(&r, FieldType::Numeric, "arithmetic operand");
                if !(ok_l && ok_r) {
                    return None;
                }
                Some(TypedExpr::new(
                    TypedKind::Arithmetic {
                        left: Box::new(l),
                        op: *op,
                        right: Box::new(r),
                    },
                    FieldType::Numeric,
                    span,
                ))
            }

            ExprKind::Between { value, low, high } => {
                let v = self.check(value);
                let lo = self.check(low);
                let hi = self.check(high);
                let (v, lo, hi) = (v?, lo?, hi?);
                if !matches!(v.ty, FieldType::Numeric | FieldType::Date) {
                    self.mismatch(
                        v.span,
                        format!("'between' needs a numeric or date value, found {}", v.ty),
                    );
                    return None;
                }
                if lo.ty != v.ty || hi.ty != v.ty {
                    self.mismatch(
                        span,
                        format!(
                            "'between' bounds must be {}, found {} and {}",
                            v.ty, lo.ty, hi.ty
                        ),
                    );
                    return None;
                }
                Some(TypedExpr::new(
                    TypedKind::Between {
                        value: Box::new(v),
                        low: Box::new(lo),
                        high: Box::new(hi),
                    },
                    FieldType::Logical,
                    span,
                ))
            }

            ExprKind::InList {
                value,
                items,
                negated,
            } => {
                let v = self.check(value)?;
                let mut values = Vec::with_capacity(items.len());
                let mut ok = true;
                for item in items {
                    match &item.kind {
                        ExprKind::Literal(lit) if literal_type(lit) == Some(v.ty) => {
                            values.push(lit.clone())
                        }
                        ExprKind::Literal(lit) => {
                            self.mismatch(
                                item.span,
                                format!(
                                    "list item must be {}, found {}",
                                    v.ty,
                                    lit.type_name()
                                ),
                            );
                            ok = false;
                        }
                        _ => {
                            self.mismatch(item.span, "list items must be literals");
                            ok = false;
                        }
                    }
                }
                if !ok {
                    return None;
                }
                Some(TypedExpr::new(
                    TypedKind::InList {
                        value: Box::new(v),
                        items: values,
                        negated: *negated,
                    },
                    FieldType::Logical,
                    span,
                ))
            }

            ExprKind::Logical { left, op, right } => {
                let l = self.check(left);
                let r = self.check(right);
                let (l, r) = (l?, r?);
                let role = match op {
                    LogicalOp::And => "'and' operand",
                    LogicalOp::Or => "'or' operand",
                };
                let ok_l = self.expect_type(&l, FieldType::Logical, role);
                let ok_r = self.expect_type(&r, FieldType::Logical, role);
                if !(ok_l && ok_r) {
                    return None;
                }
                Some(TypedExpr::new(
                    TypedKind::Logical {
                        op: *op,
                        left: Box::new(l),
                        right: Box::new(r),
                    },
                    FieldType::Logical,
                    span,
                ))
            }

            ExprKind::Not(inner) => {
                let inner = self.check(inner)?;
                if !self.expect_type(&inner, FieldType::Logical, "'not' operand") {
                    return None;
                }
                Some(TypedExpr::new(
                    TypedKind::Not(Box::new(inner)),
                    FieldType::Logical,
                    span,
                ))
            }

            ExprKind::Negate(inner) => {
                let inner = self.check(inner)?;
                if !self.expect_type(&inner, FieldType::Numeric, "negated value") {
                    return None;
                }
                Some(TypedExpr::new(
                    TypedKind::Negate(Box::new(inner)),
                    FieldType::Numeric,
                    span,
                ))
            }

            ExprKind::Conditional {
                condition,
                then_branch,
                else_branch,
            } => {
                let c = self.check(condition);
                let t = self.check(then_branch);
                let e = else_branch.as_ref().map(|e| self.check(e));
                let (c, t) = (c?, t?);
                let e = match e {
                    Some(e) => Some(e?),
                    None => None,
                };

                let mut ok = self.expect_type(&c, FieldType::Logical, "condition");
                match &e {
                    Some(e) if e.ty != t.ty => {
                        self.mismatch(
                            span,
                            format!("branches differ: then is {}, else is {}", t.ty, e.ty),
                        );
                        ok = false;
                    }
                    None => {
                        ok &= self.expect_type(
                            &t,
                            FieldType::Logical,
                            "conditional without 'else'",
                        );
                    }
                    _ => {}
                }
                if !ok {
                    return None;
                }
                let ty = t.ty;
                Some(TypedExpr::new(
                    TypedKind::Conditional {
                        condition: Box::new(c),
                        then_branch: Box::new(t),
                        else_branch: e.map(Box::new),
                    },
                    ty,
                    span,
                ))
            }

            ExprKind::DateShift { base, amount, unit } => {
                let base = self.check(base)?;
                if !self.expect_type(&base, FieldType::Date, "date arithmetic base") {
                    return None;
                }
                let Some(days) = unit.to_days(*amount) else {
                    self.mismatch(
                        span,
                        format!("date shift of {} {} is out of range", amount, unit.keyword()),
                    );
                    return None;
                };
                Some(TypedExpr::new(
                    TypedKind::DateShift {
                        base: Box::new(base),
                        days,
                    },
                    FieldType::Date,
                    span,
                ))
            }

            ExprKind::Within {
                value,
                reference,
                tolerance,
            } => {
                let v = self.check(value);
                let r = self.check(reference);
                let (v, r) = (v?, r?);
                let expected = match tolerance {
                    Tolerance::Percent(_) | Tolerance::Absolute(_) => FieldType::Numeric,
                    Tolerance::Days(_) => FieldType::Date,
                };
                let ok_v = self.expect_type(&v, expected, "'within' value");
                let ok_r = self.expect_type(&r, expected, "'within' reference");
                if !(ok_v && ok_r) {
                    return None;
                }
                Some(TypedExpr::new(
                    TypedKind::Within {
                        value: Box::new(v),
                        reference: Box::new(r),
                        tolerance: *tolerance,
                    },
                    FieldType::Logical,
                    span,
                ))
            }

            ExprKind::Call { name, args } => self.check_call(name, args, span),

            ExprKind::VisitRef { visit, field } => {
                let legal = self.is_batch() && self.rule.scope == RuleScope::CrossVisit;
                if !legal {
                    self.error(
                        SemanticErrorKind::IllegalScope,
                        span,
                        format!(
                            "visit(\"{}\") references need a batch rule with cross_visit scope",
                            visit
                        ),
                    );
                }
                let field = self.resolve_field(field, span)?;
                if !legal {
                    return None;
                }
                self.prior_visits.insert(visit.clone());
                let ty = field.field_type;
                Some(TypedExpr::new(
                    TypedKind::VisitRef {
                        visit: visit.clone(),
                        field,
                    },
                    ty,
                    span,
                ))
            }

            ExprKind::Aggregate { func, field } => self.check_aggregate(*func, field, span),
        }
    }

    fn check_aggregate(&mut self, func: AggregateFn, name: &str, span: Span) -> Option<TypedExpr> {
        let legal = self.is_batch() && self.rule.scope == RuleScope::CrossPatient;
        if !legal {
            self.error(
                SemanticErrorKind::IllegalScope,
                span,
                format!(
                    "{}() needs a batch rule with cross_patient scope",
                    func.name()
                ),
            );
        }
        let field = self.resolve_field(name, span)?;
        if field.field_type != FieldType::Numeric {
            self.mismatch(
                span,
                format!(
                    "{}() needs a numeric field, '{}' is {}",
                    func.name(),
                    field.name,
                    field.field_type
                ),
            );
            return None;
        }
        if !legal {
            return None;
        }
        self.aggregates.insert((func, field.name.clone()));
        Some(TypedExpr::new(
            TypedKind::Aggregate { func, field },
            FieldType::Numeric,
            span,
        ))
    }

    fn check_call(&mut self, name: &str, args: &[Expression], span: Span) -> Option<TypedExpr> {
        // Aggregates reach here only when the argument is not a bare field
        if let Some(func) = AggregateFn::from_name(name) {
            if args.len() != 1 {
                self.error(
                    SemanticErrorKind::ArityMismatch,
                    span,
                    format!("{}() takes 1 argument, found {}", func.name(), args.len()),
                );
            } else {
                self.mismatch(
                    args[0].span,
                    format!("{}() takes a field name", func.name()),
                );
            }
            return None;
        }

        let Some(builtin) = Builtin::from_name(name) else {
            self.error(
                SemanticErrorKind::UnknownFunction,
                span,
                format!("function '{}' is not available", name),
            );
            // Still check arguments for further problems
            for arg in args {
                self.check(arg);
            }
            return None;
        };

        let typed: Vec<Option<TypedExpr>> = args.iter().map(|a| self.check(a)).collect();

        if args.len() != builtin.arity() {
            self.error(
                SemanticErrorKind::ArityMismatch,
                span,
                format!(
                    "{}() takes {} argument{}, found {}",
                    builtin.name(),
                    builtin.arity(),
                    if builtin.arity() == 1 { "" } else { "s" },
                    args.len()
                ),
            );
            return None;
        }

        let typed: Vec<TypedExpr> = typed.into_iter().collect::<Option<Vec<_>>>()?;

        let role = format!("{}() argument", builtin.name());
        let ok = match builtin {
            Builtin::Length => self.expect_type(&typed[0], FieldType::Text, &role),
            Builtin::IsBlank => true,
            Builtin::Abs => self.expect_type(&typed[0], FieldType::Numeric, &role),
            Builtin::DateDiff => {
                let a = self.expect_type(&typed[0], FieldType::Date, &role);
                let b = self.expect_type(&typed[1], FieldType::Date, &role);
                a && b
            }
        };
        if !ok {
            return None;
        }

        Some(TypedExpr::new(
            TypedKind::Builtin {
                func: builtin,
                args: typed,
            },
            builtin.return_type(),
            span,
        ))
    }
}
