//! Abstract Syntax Tree (AST) definitions for TrialCheck
//!
//! This module contains:
//! - Source spans
//! - Expressions and operators
//! - The parsed rule (`RuleAst`) and its `allow` clause
//! - The authored `Rule` model with context, scope and schedule
//! - The typed tree produced by semantic validation

pub mod expression;
pub mod operator;
pub mod rule;
pub mod rule_ast;
pub mod span;
pub mod typed;

pub use expression::{ExprKind, Expression};
pub use operator::{
    AggregateFn, ArithOp, CompareOp, DateUnit, LogicalOp, Tolerance, MAX_DAY_SPAN,
};
pub use rule::{Rule, RuleContext, RuleScope, Schedule, Severity};
pub use rule_ast::{AllowClause, AllowKind, RuleAst};
pub use span::Span;
pub use typed::{Builtin, FieldRef, TypedExpr, TypedKind, TypedRule};
