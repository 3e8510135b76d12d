//! Compiled batch query plan
//!
//! A `BatchQuery` is an object graph describing a set-oriented check over
//! a relational table. Data sources either execute it directly (in-memory)
//! or render it to parameterized SQL. Rule text never reaches this layer.
//!
//! Row expressions use three-valued logic: a column holding a missing value
//! reads as NULL, NULL propagates through every operator, and a row is a
//! violation candidate only when the `ok` expression is definitively false.

use crate::ast::{
    AggregateFn, ArithOp, CompareOp, FieldRef, RuleScope, Severity, Tolerance,
};
use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Column names every observation table shares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLayout {
    /// Subject identifier column
    pub subject_column: String,
    /// Visit name column
    pub visit_column: String,
}

impl Default for TableLayout {
    fn default() -> Self {
        Self {
            subject_column: "subject_id".to_string(),
            visit_column: "visit".to_string(),
        }
    }
}

/// Which row a column is read from
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Relation {
    /// The row being checked
    Current,
    /// The same subject's row at the named visit
    Visit(String),
}

/// A typed column reference; missing values read as NULL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub relation: Relation,
    pub field: FieldRef,
}

impl Column {
    pub fn current(field: FieldRef) -> Self {
        Self {
            relation: Relation::Current,
            field,
        }
    }

    pub fn at_visit(visit: impl Into<String>, field: FieldRef) -> Self {
        Self {
            relation: Relation::Visit(visit.into()),
            field,
        }
    }

    pub fn name(&self) -> &str {
        &self.field.name
    }
}

/// Row-level expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowExpr {
    /// User literal; rendered as a bind parameter
    Const(Value),
    Column(Column),
    Today,
    /// Population statistic computed over the whole table
    Aggregate {
        func: AggregateFn,
        field: FieldRef,
    },
    Compare {
        left: Box<RowExpr>,
        op: CompareOp,
        right: Box<RowExpr>,
    },
    Arith {
        left: Box<RowExpr>,
        op: ArithOp,
        right: Box<RowExpr>,
    },
    Negate(Box<RowExpr>),
    Between {
        value: Box<RowExpr>,
        low: Box<RowExpr>,
        high: Box<RowExpr>,
    },
    InList {
        value: Box<RowExpr>,
        items: Vec<Value>,
        negated: bool,
    },
    And(Box<RowExpr>, Box<RowExpr>),
    Or(Box<RowExpr>, Box<RowExpr>),
    Not(Box<RowExpr>),
    /// NULL condition yields NULL; otherwise picks a branch
    Case {
        condition: Box<RowExpr>,
        then_branch: Box<RowExpr>,
        else_branch: Box<RowExpr>,
    },
    DateShift {
        base: Box<RowExpr>,
        days: i64,
    },
    /// Whole days, first minus second
    DateDiff(Box<RowExpr>, Box<RowExpr>),
    Within {
        value: Box<RowExpr>,
        reference: Box<RowExpr>,
        tolerance: Tolerance,
    },
    Length(Box<RowExpr>),
    Abs(Box<RowExpr>),
    /// Never NULL
    IsNull(Box<RowExpr>),
    /// Raw column text equals one of the tokens (case-insensitive). Never NULL.
    HasToken {
        column: Column,
        tokens: Vec<String>,
    },
}

impl RowExpr {
    pub fn boxed(self) -> Box<RowExpr> {
        Box::new(self)
    }

    /// Visit every node in pre-order
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a RowExpr)) {
        visit(self);
        match self {
            RowExpr::Const(_)
            | RowExpr::Column(_)
            | RowExpr::Today
            | RowExpr::Aggregate { .. }
            | RowExpr::HasToken { .. } => {}
            RowExpr::Compare { left, right, .. } | RowExpr::Arith { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            RowExpr::And(a, b) | RowExpr::Or(a, b) | RowExpr::DateDiff(a, b) => {
                a.walk(visit);
                b.walk(visit);
            }
            RowExpr::Negate(inner)
            | RowExpr::Not(inner)
            | RowExpr::Length(inner)
            | RowExpr::Abs(inner)
            | RowExpr::IsNull(inner) => inner.walk(visit),
            RowExpr::Between { value, low, high } => {
                value.walk(visit);
                low.walk(visit);
                high.walk(visit);
            }
            RowExpr::InList { value, .. } => value.walk(visit),
            RowExpr::Case {
                condition,
                then_branch,
                else_branch,
            } => {
                condition.walk(visit);
                then_branch.walk(visit);
                else_branch.walk(visit);
            }
            RowExpr::DateShift { base, .. } => base.walk(visit),
            RowExpr::Within {
                value, reference, ..
            } => {
                value.walk(visit);
                reference.walk(visit);
            }
        }
    }

    /// Columns read by this expression
    pub fn columns(&self) -> Vec<&Column> {
        let mut columns = Vec::new();
        self.walk(&mut |node| match node {
            RowExpr::Column(c) => columns.push(c),
            RowExpr::HasToken { column, .. } => columns.push(column),
            _ => {}
        });
        columns
    }

    /// User literals in evaluation order
    pub fn literals(&self) -> Vec<&Value> {
        let mut values = Vec::new();
        self.walk(&mut |node| match node {
            RowExpr::Const(v) => values.push(v),
            RowExpr::InList { items, .. } => values.extend(items.iter()),
            _ => {}
        });
        values
    }
}

/// Join/aggregation structure of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum QueryShape {
    /// Filter over the target table
    Projection,
    /// Self-join of each row to the same subject's row at each named visit.
    /// Rows at those visits are not themselves checked.
    PriorVisitJoin { visits: Vec<String> },
    /// One aggregate pass joined back to every row
    PopulationAggregate {
        aggregates: Vec<(AggregateFn, FieldRef)>,
    },
    /// Anti-join against the expected-visit table, plus a projection over
    /// existing rows
    Completeness { expected_table: String },
}

impl QueryShape {
    pub fn name(&self) -> &'static str {
        match self {
            QueryShape::Projection => "projection",
            QueryShape::PriorVisitJoin { .. } => "prior_visit_join",
            QueryShape::PopulationAggregate { .. } => "population_aggregate",
            QueryShape::Completeness { .. } => "completeness",
        }
    }
}

/// Compiled batch plan for one rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchQuery {
    pub rule_id: String,
    pub content_hash: String,
    pub scope: RuleScope,
    pub severity: Severity,
    /// Table holding every referenced field
    pub table: String,
    /// Target column reported on each candidate
    pub target: FieldRef,
    pub shape: QueryShape,
    /// Row passes when true; violation when false; skipped when NULL
    pub ok: RowExpr,
    /// Expected-constraint description copied onto candidates
    pub description: String,
    pub layout: TableLayout,
}

impl BatchQuery {
    /// Names of every data column the plan reads from the target table
    pub fn referenced_columns(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self
            .ok
            .columns()
            .into_iter()
            .map(|c| c.name().to_string())
            .collect();
        names.insert(self.target.name.clone());
        if let QueryShape::PopulationAggregate { aggregates } = &self.shape {
            names.extend(aggregates.iter().map(|(_, f)| f.name.clone()));
        }
        names
    }

    /// Parameters bound by the plan, in order of appearance
    pub fn parameters(&self) -> Vec<Value> {
        self.ok.literals().into_iter().cloned().collect()
    }

    /// True if the plan reads rows other than the one being checked
    pub fn is_cross_record(&self) -> bool {
        !matches!(self.shape, QueryShape::Projection)
    }
}

/// A row the plan flagged
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViolationCandidate {
    pub rule_id: String,
    pub subject_id: String,
    pub visit: Option<String>,
    pub field: String,
    pub observed_value: Option<String>,
    pub expected: String,
}

impl ViolationCandidate {
    /// Deduplication key: (rule, subject, visit, field)
    pub fn key(&self) -> (String, String, Option<String>, String) {
        (
            self.rule_id.clone(),
            self.subject_id.clone(),
            self.visit.clone(),
            self.field.clone(),
        )
    }
}
