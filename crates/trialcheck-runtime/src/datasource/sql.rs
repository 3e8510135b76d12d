//! SQL rendering for PostgreSQL
//!
//! Turns a `BatchQuery` into one parameterized statement. Every literal from
//! rule text is sent as a bind parameter; identifiers come from the field
//! catalog and are validated and quoted before they are spliced in.
//!
//! Every statement returns `(subject_id, visit, observed_value, absent)`.

use crate::error::{Result, RuntimeError};
use chrono::NaiveDate;
use std::collections::HashMap;
use trialcheck_core::ast::{AggregateFn, FieldRef, Tolerance};
use trialcheck_core::ir::{BatchQuery, Column, QueryShape, Relation, RowExpr};
use trialcheck_core::types::FieldType;
use trialcheck_core::Value;

/// A rendered statement and its parameters, `$1` first
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Check an identifier against `[A-Za-z_][A-Za-z0-9_]*`
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(RuntimeError::InvalidIdentifier(name.to_string()))
    }
}

/// Validate and double-quote an identifier
pub fn quote_identifier(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name))
}

fn sql_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Numeric => "numeric",
        FieldType::Date => "date",
        FieldType::Logical => "boolean",
        FieldType::Text => "text",
    }
}

fn aggregate_alias(func: AggregateFn, field: &FieldRef) -> Result<String> {
    validate_identifier(&field.name)?;
    quote_identifier(&format!("{}_{}", func.name(), field.name))
}

/// PostgreSQL renderer for batch plans
pub struct SqlRenderer<'p> {
    plan: &'p BatchQuery,
    today: NaiveDate,
    params: Vec<Value>,
    visit_aliases: HashMap<String, String>,
}

impl<'p> SqlRenderer<'p> {
    /// Render a plan. `today` is bound as a parameter, never read from the
    /// database clock.
    pub fn render(plan: &'p BatchQuery, today: NaiveDate) -> Result<SqlStatement> {
        let mut renderer = Self {
            plan,
            today,
            params: Vec::new(),
            visit_aliases: HashMap::new(),
        };
        let sql = renderer.statement()?;
        Ok(SqlStatement {
            sql,
            params: renderer.params,
        })
    }

    fn bind_as(&mut self, value: Value, cast: &str) -> String {
        self.params.push(value);
        format!("${}::{}", self.params.len(), cast)
    }

    fn bind(&mut self, value: Value) -> String {
        match &value {
            Value::Null => "NULL".to_string(),
            Value::Number(_) => self.bind_as(value, "numeric"),
            Value::Date(_) => self.bind_as(value, "date"),
            Value::Bool(_) => self.bind_as(value, "boolean"),
            Value::String(_) => self.bind_as(value, "text"),
        }
    }

    fn bind_list(&mut self, values: impl IntoIterator<Item = Value>) -> String {
        values
            .into_iter()
            .map(|v| self.bind(v))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn statement(&mut self) -> Result<String> {
        let layout = &self.plan.layout;
        let table = quote_identifier(&self.plan.table)?;
        let subject = quote_identifier(&layout.subject_column)?;
        let visit = quote_identifier(&layout.visit_column)?;
        let target = quote_identifier(&self.plan.target.name)?;

        let projection = format!(
            "SELECT c.{subject}::text AS subject_id, c.{visit}::text AS visit, \
             c.{target}::text AS observed_value, false AS absent FROM {table} AS c"
        );

        let sql = match &self.plan.shape {
            QueryShape::Projection => {
                let ok = self.expr(&self.plan.ok)?;
                format!("{projection} WHERE NOT ({ok})")
            }

            QueryShape::PriorVisitJoin { visits } => {
                let mut joins = String::new();
                for (i, name) in visits.iter().enumerate() {
                    let alias = format!("v{}", i);
                    let bound = self.bind(Value::String(name.clone()));
                    joins.push_str(&format!(
                        " LEFT JOIN {table} AS {alias} ON {alias}.{subject}::text = c.{subject}::text \
                         AND {alias}.{visit}::text = {bound}"
                    ));
                    self.visit_aliases.insert(name.clone(), alias);
                }
                let excluded = self.bind_list(visits.iter().cloned().map(Value::String));
                let ok = self.expr(&self.plan.ok)?;
                format!(
                    "{projection}{joins} WHERE c.{visit}::text NOT IN ({excluded}) AND NOT ({ok})"
                )
            }

            QueryShape::PopulationAggregate { aggregates } => {
                let mut stats = Vec::new();
                for (func, field) in aggregates {
                    let value = self.column_value("a", field)?;
                    let call = match func {
                        AggregateFn::Mean => "AVG",
                        AggregateFn::Sd => "STDDEV_SAMP",
                    };
                    stats.push(format!("{call}({value}) AS {}", aggregate_alias(*func, field)?));
                }
                let ok = self.expr(&self.plan.ok)?;
                format!(
                    "{projection} CROSS JOIN (SELECT {} FROM {table} AS a) AS agg WHERE NOT ({ok})",
                    stats.join(", ")
                )
            }

            QueryShape::Completeness { expected_table } => {
                let expected = quote_identifier(expected_table)?;
                let ok = self.expr(&self.plan.ok)?;
                format!(
                    "SELECT e.{subject}::text AS subject_id, e.{visit}::text AS visit, \
                     NULL::text AS observed_value, true AS absent FROM {expected} AS e \
                     WHERE NOT EXISTS (SELECT 1 FROM {table} AS c \
                     WHERE c.{subject}::text = e.{subject}::text AND c.{visit}::text = e.{visit}::text) \
                     UNION ALL {projection} WHERE NOT ({ok})"
                )
            }
        };

        Ok(format!("{sql} ORDER BY subject_id, visit"))
    }

    /// Normalized column value: missing values become NULL, the rest are
    /// cast to the field's declared type
    fn column_value(&mut self, alias: &str, field: &FieldRef) -> Result<String> {
        let column = format!("{}.{}", alias, quote_identifier(&field.name)?);
        let text = format!("{}::text", column);
        let mut missing = format!("{column} IS NULL OR btrim({text}) = ''");
        if !field.missing_tokens.is_empty() {
            let tokens = self.bind_list(
                field
                    .missing_tokens
                    .iter()
                    .map(|t| Value::String(t.trim().to_uppercase())),
            );
            missing.push_str(&format!(" OR upper(btrim({text})) IN ({tokens})"));
        }
        Ok(format!(
            "(CASE WHEN {missing} THEN NULL ELSE {text} END)::{}",
            sql_type(field.field_type)
        ))
    }

    fn alias(&self, column: &Column) -> Result<String> {
        match &column.relation {
            Relation::Current => Ok("c".to_string()),
            Relation::Visit(visit) => self.visit_aliases.get(visit).cloned().ok_or_else(|| {
                RuntimeError::Evaluation(format!("visit '{}' is not joined by this plan", visit))
            }),
        }
    }

    fn expr(&mut self, expr: &RowExpr) -> Result<String> {
        Ok(match expr {
            RowExpr::Const(value) => self.bind(value.clone()),

            RowExpr::Column(column) => {
                let alias = self.alias(column)?;
                self.column_value(&alias, &column.field)?
            }

            RowExpr::Today => self.bind(Value::Date(self.today)),

            RowExpr::Aggregate { func, field } => {
                format!("agg.{}", aggregate_alias(*func, field)?)
            }

            RowExpr::Compare { left, op, right } => {
                format!("({} {} {})", self.expr(left)?, op.symbol(), self.expr(right)?)
            }

            RowExpr::Arith { left, op, right } => {
                format!("({} {} {})", self.expr(left)?, op.symbol(), self.expr(right)?)
            }

            RowExpr::Negate(inner) => format!("(-{})", self.expr(inner)?),

            RowExpr::Between { value, low, high } => format!(
                "({} BETWEEN {} AND {})",
                self.expr(value)?,
                self.expr(low)?,
                self.expr(high)?
            ),

            RowExpr::InList {
                value,
                items,
                negated,
            } => {
                let value = self.expr(value)?;
                let items = self.bind_list(items.iter().cloned());
                let not = if *negated { "NOT " } else { "" };
                format!("({value} {not}IN ({items}))")
            }

            RowExpr::And(a, b) => format!("({} AND {})", self.expr(a)?, self.expr(b)?),
            RowExpr::Or(a, b) => format!("({} OR {})", self.expr(a)?, self.expr(b)?),
            RowExpr::Not(inner) => format!("(NOT {})", self.expr(inner)?),

            // Simple CASE: a NULL condition matches neither arm
            RowExpr::Case {
                condition,
                then_branch,
                else_branch,
            } => format!(
                "(CASE {} WHEN true THEN {} WHEN false THEN {} END)",
                self.expr(condition)?,
                self.expr(then_branch)?,
                self.expr(else_branch)?
            ),

            RowExpr::DateShift { base, days } => {
                let base = self.expr(base)?;
                let days = self.bind_as(Value::Number(*days as f64), "integer");
                format!("({base} + {days})")
            }

            RowExpr::DateDiff(a, b) => format!("({} - {})", self.expr(a)?, self.expr(b)?),

            RowExpr::Within {
                value,
                reference,
                tolerance,
            } => {
                let v = self.expr(value)?;
                let r = self.expr(reference)?;
                match tolerance {
                    Tolerance::Percent(pct) => {
                        let r_again = self.expr(reference)?;
                        let pct = self.bind(Value::Number(*pct));
                        format!("(abs({v} - {r}) <= {pct} * abs({r_again}) / 100)")
                    }
                    Tolerance::Absolute(n) => {
                        let n = self.bind(Value::Number(*n));
                        format!("(abs({v} - {r}) <= {n})")
                    }
                    Tolerance::Days(n) => {
                        let n = self.bind_as(Value::Number(*n as f64), "integer");
                        format!("(abs({v} - {r}) <= {n})")
                    }
                }
            }

            RowExpr::Length(inner) => format!("char_length({})", self.expr(inner)?),

            RowExpr::Abs(inner) => format!("abs({})", self.expr(inner)?),

            RowExpr::IsNull(inner) => format!("({} IS NULL)", self.expr(inner)?),

            RowExpr::HasToken { column, tokens } => {
                let alias = self.alias(column)?;
                let name = quote_identifier(column.name())?;
                let tokens =
                    self.bind_list(tokens.iter().map(|t| Value::String(t.trim().to_uppercase())));
                format!("COALESCE(upper(btrim({alias}.{name}::text)) IN ({tokens}), false)")
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trialcheck_core::ast::{CompareOp, RuleScope, Severity};
    use trialcheck_core::ir::TableLayout;

    fn weight() -> FieldRef {
        FieldRef {
            name: "weight".to_string(),
            field_type: FieldType::Numeric,
            missing_tokens: vec!["UNK".to_string()],
        }
    }

    fn plan(shape: QueryShape, ok: RowExpr) -> BatchQuery {
        BatchQuery {
            rule_id: "wt".to_string(),
            content_hash: "h".to_string(),
            scope: RuleScope::CrossVisit,
            severity: Severity::Warning,
            table: "vitals".to_string(),
            target: weight(),
            shape,
            ok,
            description: "within 10% of visit(\"baseline\").weight".to_string(),
            layout: TableLayout::default(),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("systolic_bp").is_ok());
        assert!(validate_identifier("_x1").is_ok());
        for bad in ["", "1abc", "weight; drop table vitals", "a\"b", "naïve"] {
            assert!(validate_identifier(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_literals_become_parameters() {
        let ok = RowExpr::Compare {
            left: RowExpr::Column(Column::current(weight())).boxed(),
            op: CompareOp::Gt,
            right: RowExpr::Const(Value::from("'; drop table vitals; --")).boxed(),
        };
        let stmt = SqlRenderer::render(&plan(QueryShape::Projection, ok), today()).unwrap();
        assert!(!stmt.sql.contains("drop table"));
        assert!(stmt.params.contains(&Value::from("'; drop table vitals; --")));
        assert!(stmt.sql.contains("WHERE NOT ("));
        assert!(stmt.sql.ends_with("ORDER BY subject_id, visit"));
    }

    #[test]
    fn test_prior_visit_join() {
        let ok = RowExpr::Within {
            value: RowExpr::Column(Column::current(weight())).boxed(),
            reference: RowExpr::Column(Column::at_visit("baseline", weight())).boxed(),
            tolerance: Tolerance::Percent(10.0),
        };
        let shape = QueryShape::PriorVisitJoin {
            visits: vec!["baseline".to_string()],
        };
        let stmt = SqlRenderer::render(&plan(shape, ok), today()).unwrap();
        assert!(stmt.sql.contains("LEFT JOIN \"vitals\" AS v0"));
        assert!(stmt.sql.contains("v0.\"weight\""));
        assert!(stmt.sql.contains("NOT IN ("));
        assert!(stmt.params.contains(&Value::from("baseline")));
        assert!(stmt.params.contains(&Value::Number(10.0)));
        // placeholders are numbered densely
        let last = format!("${}", stmt.params.len());
        assert!(stmt.sql.contains(&last));
    }

    #[test]
    fn test_bad_table_name_rejected() {
        let mut p = plan(QueryShape::Projection, RowExpr::Const(Value::Bool(true)));
        p.table = "vitals v; --".to_string();
        assert!(matches!(
            SqlRenderer::render(&p, today()),
            Err(RuntimeError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_completeness_anti_join() {
        let shape = QueryShape::Completeness {
            expected_table: "expected_visits".to_string(),
        };
        let stmt =
            SqlRenderer::render(&plan(shape, RowExpr::Const(Value::Bool(true))), today()).unwrap();
        assert!(stmt.sql.contains("NOT EXISTS"));
        assert!(stmt.sql.contains("UNION ALL"));
        assert!(stmt.sql.contains("true AS absent"));
    }

    #[test]
    fn test_population_aggregate() {
        let ok = RowExpr::Compare {
            left: RowExpr::Column(Column::current(weight())).boxed(),
            op: CompareOp::Le,
            right: RowExpr::Aggregate {
                func: AggregateFn::Mean,
                field: weight(),
            }
            .boxed(),
        };
        let shape = QueryShape::PopulationAggregate {
            aggregates: vec![(AggregateFn::Mean, weight())],
        };
        let stmt = SqlRenderer::render(&plan(shape, ok), today()).unwrap();
        assert!(stmt.sql.contains("CROSS JOIN (SELECT AVG("));
        assert!(stmt.sql.contains("agg.\"mean_weight\""));
    }
}
