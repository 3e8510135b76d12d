//! Expression AST nodes

use super::operator::{AggregateFn, ArithOp, CompareOp, DateUnit, LogicalOp, Tolerance};
use super::span::Span;
use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Expression AST node with its source span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expression {
    pub kind: ExprKind,
    pub span: Span,
}

/// Expression node kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    /// Number, string, logical or date literal
    Literal(Value),

    /// Reference to a field of the current record (e.g. `systolic_bp`)
    Field(String),

    /// The rule's own target field, implied by a bare predicate such as
    /// `between 40 and 200`
    Subject,

    /// Current date
    Today,

    /// `required`: the target field must be present
    Required,

    /// Binary comparison (`=`, `!=`, `<`, `<=`, `>`, `>=`)
    Compare {
        left: Box<Expression>,
        op: CompareOp,
        right: Box<Expression>,
    },

    /// Numeric arithmetic
    Arithmetic {
        left: Box<Expression>,
        op: ArithOp,
        right: Box<Expression>,
    },

    /// Inclusive range: `value between low and high`
    Between {
        value: Box<Expression>,
        low: Box<Expression>,
        high: Box<Expression>,
    },

    /// List membership: `value in ("A", "B")` / `value not in (...)`
    InList {
        value: Box<Expression>,
        items: Vec<Expression>,
        negated: bool,
    },

    /// Boolean combinator
    Logical {
        left: Box<Expression>,
        op: LogicalOp,
        right: Box<Expression>,
    },

    /// Logical negation
    Not(Box<Expression>),

    /// Arithmetic negation
    Negate(Box<Expression>),

    /// `if c then a [else b] endif`
    Conditional {
        condition: Box<Expression>,
        then_branch: Box<Expression>,
        else_branch: Option<Box<Expression>>,
    },

    /// Date arithmetic: `base + 7 days`, `today - 2 weeks`
    DateShift {
        base: Box<Expression>,
        amount: i64,
        unit: DateUnit,
    },

    /// Tolerance check: `value within 10% of reference`
    Within {
        value: Box<Expression>,
        reference: Box<Expression>,
        tolerance: Tolerance,
    },

    /// Function call (resolved against the builtin whitelist later)
    Call { name: String, args: Vec<Expression> },

    /// Scoped cross-record reference to the same subject's value at
    /// another visit: `visit("baseline").weight`
    VisitRef { visit: String, field: String },

    /// Population aggregate over all subjects: `mean(weight)`, `sd(weight)`
    Aggregate { func: AggregateFn, field: String },
}

impl Expression {
    /// Create an expression node
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn literal(value: Value, span: Span) -> Self {
        Self::new(ExprKind::Literal(value), span)
    }

    pub fn field(name: impl Into<String>, span: Span) -> Self {
        Self::new(ExprKind::Field(name.into()), span)
    }

    pub fn compare(left: Expression, op: CompareOp, right: Expression) -> Self {
        let span = left.span.merge(right.span);
        Self::new(
            ExprKind::Compare {
                left: Box::new(left),
                op,
                right: Box::new(right),
            },
            span,
        )
    }

    pub fn logical(left: Expression, op: LogicalOp, right: Expression) -> Self {
        let span = left.span.merge(right.span);
        Self::new(
            ExprKind::Logical {
                left: Box::new(left),
                op,
                right: Box::new(right),
            },
            span,
        )
    }

    pub fn arithmetic(left: Expression, op: ArithOp, right: Expression) -> Self {
        let span = left.span.merge(right.span);
        Self::new(
            ExprKind::Arithmetic {
                left: Box::new(left),
                op,
                right: Box::new(right),
            },
            span,
        )
    }

    /// Visit every node in pre-order
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Expression)) {
        visit(self);
        match &self.kind {
            ExprKind::Literal(_)
            | ExprKind::Field(_)
            | ExprKind::Subject
            | ExprKind::Today
            | ExprKind::Required
            | ExprKind::VisitRef { .. }
            | ExprKind::Aggregate { .. } => {}
            ExprKind::Compare { left, right, .. }
            | ExprKind::Arithmetic { left, right, .. }
            | ExprKind::Logical { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            ExprKind::Between { value, low, high } => {
                value.walk(visit);
                low.walk(visit);
                high.walk(visit);
            }
            ExprKind::InList { value, items, .. } => {
                value.walk(visit);
                for item in items {
                    item.walk(visit);
                }
            }
            ExprKind::Not(inner) | ExprKind::Negate(inner) => inner.walk(visit),
            ExprKind::Conditional {
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
            ExprKind::DateShift { base, .. } => base.walk(visit),
            ExprKind::Within {
                value, reference, ..
            } => {
                value.walk(visit);
                reference.walk(visit);
            }
            ExprKind::Call { args, .. } => {
                for arg in args {
                    arg.walk(visit);
                }
            }
        }
    }
}

fn write_literal(f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
    match value {
        Value::String(s) => write!(f, "\"{}\"", s.replace('"', "\\\"")),
        Value::Date(d) => write!(f, "@{}", d.format("%Y-%m-%d")),
        other => write!(f, "{}", other),
    }
}

/// Writes `value ` before a suffix predicate unless the value is the
/// implicit subject.
fn write_subject(f: &mut fmt::Formatter<'_>, value: &Expression) -> fmt::Result {
    if matches!(value.kind, ExprKind::Subject) {
        Ok(())
    } else {
        write!(f, "{} ", value)
    }
}

/// Canonical rule text. Used as the "expected constraint" description in
/// messages and violations.
impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Literal(v) => write_literal(f, v),
            ExprKind::Field(name) => write!(f, "{}", name),
            ExprKind::Subject => Ok(()),
            ExprKind::Today => write!(f, "today"),
            ExprKind::Required => write!(f, "required"),
            ExprKind::Compare { left, op, right } => {
                write_subject(f, left)?;
                write!(f, "{} {}", op.symbol(), right)
            }
            ExprKind::Arithmetic { left, op, right } => {
                write!(f, "{} {} {}", left, op.symbol(), right)
            }
            ExprKind::Between { value, low, high } => {
                write_subject(f, value)?;
                write!(f, "between {} and {}", low, high)
            }
            ExprKind::InList {
                value,
                items,
                negated,
            } => {
                write_subject(f, value)?;
                if *negated {
                    write!(f, "not ")?;
                }
                write!(f, "in (")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            ExprKind::Logical { left, op, right } => {
                write!(f, "{} {} {}", left, op.keyword(), right)
            }
            ExprKind::Not(inner) => write!(f, "not ({})", inner),
            ExprKind::Negate(inner) => write!(f, "-{}", inner),
            ExprKind::Conditional {
                condition,
                then_branch,
                else_branch,
            } => {
                write!(f, "if {} then {}", condition, then_branch)?;
                if let Some(e) = else_branch {
                    write!(f, " else {}", e)?;
                }
                write!(f, " endif")
            }
            ExprKind::DateShift { base, amount, unit } => {
                let sign = if *amount < 0 { "-" } else { "+" };
                write!(f, "{} {} {} {}", base, sign, amount.abs(), unit.keyword())
            }
            ExprKind::Within {
                value,
                reference,
                tolerance,
            } => {
                write_subject(f, value)?;
                write!(f, "within {} of {}", tolerance, reference)
            }
            ExprKind::Call { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            ExprKind::VisitRef { visit, field } => write!(f, "visit(\"{}\").{}", visit, field),
            ExprKind::Aggregate { func, field } => write!(f, "{}({})", func.name(), field),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> Expression {
        Expression::literal(Value::Number(n), Span::default())
    }

    fn subject() -> Expression {
        Expression::new(ExprKind::Subject, Span::default())
    }

    #[test]
    fn test_display_implicit_between() {
        let expr = Expression::new(
            ExprKind::Between {
                value: Box::new(subject()),
                low: Box::new(num(40.0)),
                high: Box::new(num(200.0)),
            },
            Span::default(),
        );
        assert_eq!(expr.to_string(), "between 40 and 200");
    }

    #[test]
    fn test_display_explicit_compare() {
        let expr = Expression::compare(
            Expression::field("age", Span::new(0, 3)),
            CompareOp::Ge,
            num(65.0),
        );
        assert_eq!(expr.to_string(), "age >= 65");
    }

    #[test]
    fn test_display_visit_ref_within() {
        let expr = Expression::new(
            ExprKind::Within {
                value: Box::new(subject()),
                reference: Box::new(Expression::new(
                    ExprKind::VisitRef {
                        visit: "baseline".to_string(),
                        field: "weight".to_string(),
                    },
                    Span::default(),
                )),
                tolerance: Tolerance::Percent(10.0),
            },
            Span::default(),
        );
        assert_eq!(expr.to_string(), "within 10% of visit(\"baseline\").weight");
    }

    #[test]
    fn test_compare_span_covers_operands() {
        let expr = Expression::compare(
            Expression::field("age", Span::new(0, 3)),
            CompareOp::Gt,
            Expression::literal(Value::Number(1.0), Span::new(6, 7)),
        );
        assert_eq!(expr.span, Span::new(0, 7));
    }

    #[test]
    fn test_walk_visits_all_nodes() {
        let expr = Expression::logical(
            Expression::compare(Expression::field("a", Span::default()), CompareOp::Gt, num(1.0)),
            LogicalOp::And,
            Expression::field("b", Span::default()),
        );
        let mut fields = Vec::new();
        expr.walk(&mut |e| {
            if let ExprKind::Field(name) = &e.kind {
                fields.push(name.clone());
            }
        });
        assert_eq!(fields, vec!["a".to_string(), "b".to_string()]);
    }
}
