//! In-memory data source
//!
//! Executes batch plans directly over in-memory tables. Every query works
//! on an `Arc` snapshot of the tables taken when it starts, so concurrent
//! writes never show up halfway through a rule.
//!
//! Row expressions follow SQL semantics: missing values are NULL, NULL
//! propagates, and `and`/`or` use three-valued (Kleene) logic.

use super::{DataSource, MISSING_RECORD_EXPECTATION};
use crate::error::{Result, RuntimeError};
use chrono::NaiveDate;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use trialcheck_core::ast::{AggregateFn, FieldRef};
use trialcheck_core::ir::primitive;
use trialcheck_core::ir::{
    BatchQuery, Column, QueryShape, Record, Relation, RowExpr, ViolationCandidate,
};
use trialcheck_core::Value;

/// An in-memory table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Record>,
}

impl Table {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row given as (column, value) pairs. Columns the table
    /// does not declare are ignored; undeclared columns read as NULL.
    pub fn with_row<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        self.push_row(values.into_iter().map(|(k, v)| (k.into(), v)).collect());
        self
    }

    fn push_row(&mut self, mut row: Record) {
        row.retain(|column, _| self.columns.iter().any(|c| c == column));
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

type Tables = Arc<HashMap<String, Arc<Table>>>;

/// In-memory relational data source
pub struct InMemoryDataSource {
    name: String,
    tables: RwLock<Tables>,
}

impl InMemoryDataSource {
    pub fn new() -> Self {
        Self {
            name: "memory".to_string(),
            tables: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn with_table(self, name: impl Into<String>, table: Table) -> Self {
        self.put_table(name, table);
        self
    }

    /// Create or replace a table
    pub fn put_table(&self, name: impl Into<String>, table: Table) {
        let mut tables = self.tables.write();
        let mut next = (**tables).clone();
        next.insert(name.into(), Arc::new(table));
        *tables = Arc::new(next);
    }

    /// Append a row to an existing table
    pub fn insert_row(&self, table: &str, row: Record) -> Result<()> {
        self.update(|tables| {
            let current = tables
                .get(table)
                .ok_or_else(|| RuntimeError::TableNotFound(table.to_string()))?;
            let mut next = (**current).clone();
            next.push_row(row);
            tables.insert(table.to_string(), Arc::new(next));
            Ok(())
        })
    }

    /// Remove a column and its data from a table
    pub fn drop_column(&self, table: &str, column: &str) -> Result<()> {
        self.update(|tables| {
            let current = tables
                .get(table)
                .ok_or_else(|| RuntimeError::TableNotFound(table.to_string()))?;
            if !current.has_column(column) {
                return Err(RuntimeError::ColumnNotFound {
                    table: table.to_string(),
                    column: column.to_string(),
                });
            }
            let mut next = (**current).clone();
            next.columns.retain(|c| c != column);
            for row in &mut next.rows {
                row.remove(column);
            }
            tables.insert(table.to_string(), Arc::new(next));
            Ok(())
        })
    }

    /// Consistent view of every table
    pub fn snapshot(&self) -> Tables {
        self.tables.read().clone()
    }

    fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut HashMap<String, Arc<Table>>) -> Result<()>,
    {
        let mut tables = self.tables.write();
        let mut next = (**tables).clone();
        change(&mut next)?;
        *tables = Arc::new(next);
        Ok(())
    }

    /// Execute a plan synchronously
    pub fn run(&self, plan: &BatchQuery, today: NaiveDate) -> Result<Vec<ViolationCandidate>> {
        let tables = self.snapshot();
        let table = tables
            .get(&plan.table)
            .ok_or_else(|| RuntimeError::TableNotFound(plan.table.clone()))?;

        let layout = &plan.layout;
        let mut required = plan.referenced_columns();
        required.insert(layout.subject_column.clone());
        required.insert(layout.visit_column.clone());
        for column in &required {
            if !table.has_column(column) {
                return Err(RuntimeError::ColumnNotFound {
                    table: plan.table.clone(),
                    column: column.clone(),
                });
            }
        }

        let exec = PlanExecution {
            plan,
            today,
            aggregates: BTreeMap::new(),
        };

        let mut candidates = match &plan.shape {
            QueryShape::Projection => exec.projection(table)?,
            QueryShape::PriorVisitJoin { visits } => exec.prior_visit_join(table, visits)?,
            QueryShape::PopulationAggregate { aggregates } => {
                let mut exec = exec;
                exec.compute_aggregates(table, aggregates);
                exec.projection(table)?
            }
            QueryShape::Completeness { expected_table } => {
                let expected = tables
                    .get(expected_table)
                    .ok_or_else(|| RuntimeError::TableNotFound(expected_table.clone()))?;
                for column in [&layout.subject_column, &layout.visit_column] {
                    if !expected.has_column(column) {
                        return Err(RuntimeError::ColumnNotFound {
                            table: expected_table.clone(),
                            column: column.clone(),
                        });
                    }
                }
                let mut missing = exec.missing_visits(table, expected);
                missing.extend(exec.projection(table)?);
                missing
            }
        };

        candidates.sort_by(|a, b| {
            (&a.subject_id, a.visit.is_none(), &a.visit).cmp(&(&b.subject_id, b.visit.is_none(), &b.visit))
        });
        debug!(
            "In-memory plan '{}' ({}) produced {} candidates",
            plan.rule_id,
            plan.shape.name(),
            candidates.len()
        );
        Ok(candidates)
    }
}

impl Default for InMemoryDataSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DataSource for InMemoryDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, plan: &BatchQuery, today: NaiveDate) -> Result<Vec<ViolationCandidate>> {
        self.run(plan, today)
    }
}

/// Text form of a stored value; NULL has none
fn value_text(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

/// Read a stored value as the field's type; missing values are NULL
fn normalize(raw: Option<&Value>, field: &FieldRef) -> Option<Value> {
    let raw = match raw {
        None | Some(Value::Null) => return None,
        Some(v) => v,
    };
    if let Value::String(text) = raw {
        if text.trim().is_empty() || field.is_missing_token(text) {
            return None;
        }
    }
    raw.coerce(field.field_type).filter(|v| *v != Value::Null)
}

fn truth(value: Option<Value>) -> Result<Option<bool>> {
    match value {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(b)),
        Some(other) => Err(RuntimeError::Evaluation(format!(
            "expected logical, found {}",
            other.type_name()
        ))),
    }
}

fn number(value: Value) -> Result<f64> {
    value.as_number().ok_or_else(|| {
        RuntimeError::Evaluation(format!("expected numeric, found {}", value.type_name()))
    })
}

fn date(value: Value) -> Result<NaiveDate> {
    value.as_date().ok_or_else(|| {
        RuntimeError::Evaluation(format!("expected date, found {}", value.type_name()))
    })
}

/// Rows visible to one evaluation
struct RowEnv<'a> {
    current: &'a Record,
    visits: HashMap<&'a str, &'a Record>,
}

impl<'a> RowEnv<'a> {
    fn raw(&self, column: &Column) -> Option<&'a Value> {
        match &column.relation {
            Relation::Current => self.current.get(column.name()),
            Relation::Visit(visit) => self
                .visits
                .get(visit.as_str())
                .copied()
                .and_then(|row| row.get(column.name())),
        }
    }
}

struct PlanExecution<'p> {
    plan: &'p BatchQuery,
    today: NaiveDate,
    aggregates: BTreeMap<(AggregateFn, String), f64>,
}

impl<'p> PlanExecution<'p> {
    fn candidate(&self, row: &Record) -> ViolationCandidate {
        let layout = &self.plan.layout;
        ViolationCandidate {
            rule_id: self.plan.rule_id.clone(),
            subject_id: value_text(row.get(&layout.subject_column)).unwrap_or_default(),
            visit: value_text(row.get(&layout.visit_column)),
            field: self.plan.target.name.clone(),
            observed_value: value_text(row.get(&self.plan.target.name)),
            expected: self.plan.description.clone(),
        }
    }

    fn check(&self, env: &RowEnv<'_>) -> Result<bool> {
        Ok(truth(self.eval(&self.plan.ok, env)?)? == Some(false))
    }

    fn projection(&self, table: &Table) -> Result<Vec<ViolationCandidate>> {
        let mut out = Vec::new();
        for row in table.rows() {
            let env = RowEnv {
                current: row,
                visits: HashMap::new(),
            };
            if self.check(&env)? {
                out.push(self.candidate(row));
            }
        }
        Ok(out)
    }

    fn prior_visit_join(&self, table: &Table, visits: &[String]) -> Result<Vec<ViolationCandidate>> {
        let layout = &self.plan.layout;
        let mut index: HashMap<(String, String), &Record> = HashMap::new();
        for row in table.rows() {
            if let (Some(subject), Some(visit)) = (
                value_text(row.get(&layout.subject_column)),
                value_text(row.get(&layout.visit_column)),
            ) {
                index.entry((subject, visit)).or_insert(row);
            }
        }

        let mut out = Vec::new();
        for row in table.rows() {
            let Some(visit) = value_text(row.get(&layout.visit_column)) else {
                continue;
            };
            if visits.contains(&visit) {
                continue;
            }
            let subject = value_text(row.get(&layout.subject_column));

            let mut env = RowEnv {
                current: row,
                visits: HashMap::new(),
            };
            if let Some(subject) = subject {
                for name in visits {
                    if let Some(prior) = index.get(&(subject.clone(), name.clone())) {
                        env.visits.insert(name.as_str(), *prior);
                    }
                }
            }
            if self.check(&env)? {
                out.push(self.candidate(row));
            }
        }
        Ok(out)
    }

    fn compute_aggregates(&mut self, table: &Table, aggregates: &[(AggregateFn, FieldRef)]) {
        for (func, field) in aggregates {
            let values: Vec<f64> = table
                .rows()
                .iter()
                .filter_map(|row| normalize(row.get(&field.name), field))
                .filter_map(|v| v.as_number())
                .collect();
            let stat = match func {
                AggregateFn::Mean => primitive::mean(&values),
                AggregateFn::Sd => primitive::sample_sd(&values),
            };
            if let Some(stat) = stat {
                self.aggregates.insert((*func, field.name.clone()), stat);
            }
        }
    }

    fn missing_visits(&self, table: &Table, expected: &Table) -> Vec<ViolationCandidate> {
        let layout = &self.plan.layout;
        let key = |row: &Record| {
            (
                value_text(row.get(&layout.subject_column)),
                value_text(row.get(&layout.visit_column)),
            )
        };
        let present: HashSet<(String, String)> = table
            .rows()
            .iter()
            .filter_map(|row| match key(row) {
                (Some(s), Some(v)) => Some((s, v)),
                _ => None,
            })
            .collect();

        expected
            .rows()
            .iter()
            .filter_map(|row| match key(row) {
                (Some(s), Some(v)) => Some((s, v)),
                _ => None,
            })
            .filter(|pair| !present.contains(pair))
            .map(|(subject, visit)| ViolationCandidate {
                rule_id: self.plan.rule_id.clone(),
                subject_id: subject,
                visit: Some(visit),
                field: self.plan.target.name.clone(),
                observed_value: None,
                expected: MISSING_RECORD_EXPECTATION.to_string(),
            })
            .collect()
    }

    fn eval(&self, expr: &RowExpr, env: &RowEnv<'_>) -> Result<Option<Value>> {
        Ok(match expr {
            RowExpr::Const(Value::Null) => None,
            RowExpr::Const(value) => Some(value.clone()),

            RowExpr::Column(column) => normalize(env.raw(column), &column.field),

            RowExpr::Today => Some(Value::Date(self.today)),

            RowExpr::Aggregate { func, field } => self
                .aggregates
                .get(&(*func, field.name.clone()))
                .map(|v| Value::Number(*v)),

            RowExpr::Compare { left, op, right } => {
                match (self.eval(left, env)?, self.eval(right, env)?) {
                    (Some(a), Some(b)) => Some(Value::Bool(
                        primitive::compare(&a, *op, &b).map_err(RuntimeError::Evaluation)?,
                    )),
                    _ => None,
                }
            }

            RowExpr::Arith { left, op, right } => {
                match (self.eval(left, env)?, self.eval(right, env)?) {
                    (Some(a), Some(b)) => Some(Value::Number(
                        primitive::arith(number(a)?, *op, number(b)?)
                            .map_err(RuntimeError::Evaluation)?,
                    )),
                    _ => None,
                }
            }

            RowExpr::Negate(inner) => match self.eval(inner, env)? {
                Some(v) => Some(Value::Number(-number(v)?)),
                None => None,
            },

            RowExpr::Between { value, low, high } => match (
                self.eval(value, env)?,
                self.eval(low, env)?,
                self.eval(high, env)?,
            ) {
                (Some(v), Some(lo), Some(hi)) => Some(Value::Bool(
                    primitive::between(&v, &lo, &hi).map_err(RuntimeError::Evaluation)?,
                )),
                _ => None,
            },

            RowExpr::InList {
                value,
                items,
                negated,
            } => self
                .eval(value, env)?
                .map(|v| Value::Bool(primitive::in_list(&v, items) != *negated)),

            RowExpr::And(a, b) => {
                let l = truth(self.eval(a, env)?)?;
                let r = truth(self.eval(b, env)?)?;
                match (l, r) {
                    (Some(false), _) | (_, Some(false)) => Some(Value::Bool(false)),
                    (Some(true), Some(true)) => Some(Value::Bool(true)),
                    _ => None,
                }
            }

            RowExpr::Or(a, b) => {
                let l = truth(self.eval(a, env)?)?;
                let r = truth(self.eval(b, env)?)?;
                match (l, r) {
                    (Some(true), _) | (_, Some(true)) => Some(Value::Bool(true)),
                    (Some(false), Some(false)) => Some(Value::Bool(false)),
                    _ => None,
                }
            }

            RowExpr::Not(inner) => truth(self.eval(inner, env)?)?.map(|b| Value::Bool(!b)),

            RowExpr::Case {
                condition,
                then_branch,
                else_branch,
            } => match truth(self.eval(condition, env)?)? {
                None => None,
                Some(true) => self.eval(then_branch, env)?,
                Some(false) => self.eval(else_branch, env)?,
            },

            RowExpr::DateShift { base, days } => match self.eval(base, env)? {
                Some(v) => Some(Value::Date(
                    primitive::date_shift(date(v)?, *days).map_err(RuntimeError::Evaluation)?,
                )),
                None => None,
            },

            RowExpr::DateDiff(a, b) => match (self.eval(a, env)?, self.eval(b, env)?) {
                (Some(x), Some(y)) => {
                    Some(Value::Number(primitive::date_diff(date(x)?, date(y)?) as f64))
                }
                _ => None,
            },

            RowExpr::Within {
                value,
                reference,
                tolerance,
            } => match (self.eval(value, env)?, self.eval(reference, env)?) {
                (Some(v), Some(r)) => Some(Value::Bool(
                    primitive::within(&v, &r, *tolerance).map_err(RuntimeError::Evaluation)?,
                )),
                _ => None,
            },

            RowExpr::Length(inner) => match self.eval(inner, env)? {
                Some(Value::String(s)) => Some(Value::Number(primitive::length(&s))),
                Some(other) => {
                    return Err(RuntimeError::Evaluation(format!(
                        "length() of {}",
                        other.type_name()
                    )))
                }
                None => None,
            },

            RowExpr::Abs(inner) => match self.eval(inner, env)? {
                Some(v) => Some(Value::Number(number(v)?.abs())),
                None => None,
            },

            RowExpr::IsNull(inner) => Some(Value::Bool(self.eval(inner, env)?.is_none())),

            RowExpr::HasToken { column, tokens } => {
                let held = match env.raw(column) {
                    Some(Value::String(text)) => {
                        let text = text.trim();
                        tokens.iter().any(|t| t.eq_ignore_ascii_case(text))
                    }
                    _ => false,
                };
                Some(Value::Bool(held))
            }
        })
    }
}
