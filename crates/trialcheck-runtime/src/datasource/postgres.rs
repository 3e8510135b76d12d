//! PostgreSQL data source
//!
//! Renders each plan with `SqlRenderer` and runs it inside a read-only,
//! repeatable-read transaction so every row of one query sees the same
//! snapshot.

use super::sql::{SqlRenderer, SqlStatement};
use super::{DataSource, MISSING_RECORD_EXPECTATION};
use crate::error::{Result, RuntimeError};
use chrono::NaiveDate;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tracing::debug;
use trialcheck_core::ir::{BatchQuery, ViolationCandidate};
use trialcheck_core::Value;

/// Batch data source backed by a PostgreSQL pool
pub struct PostgresDataSource {
    name: String,
    pool: PgPool,
}

impl PostgresDataSource {
    pub fn new(pool: PgPool) -> Self {
        Self {
            name: "postgres".to_string(),
            pool,
        }
    }

    /// Connect a new pool
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| RuntimeError::DataSource(format!("Failed to connect to PostgreSQL: {}", e)))?;
        tracing::info!("✓ Connected batch data source to PostgreSQL");
        Ok(Self::new(pool))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => query.bind(*n),
            Value::Date(d) => query.bind(*d),
            Value::String(s) => query.bind(s.as_str()),
        };
    }
    query
}

fn candidate(plan: &BatchQuery, row: &PgRow) -> Result<ViolationCandidate> {
    let read = |e: sqlx::Error| RuntimeError::DataSource(format!("Failed to read result row: {}", e));

    let subject_id: Option<String> = row.try_get("subject_id").map_err(read)?;
    let visit: Option<String> = row.try_get("visit").map_err(read)?;
    let observed_value: Option<String> = row.try_get("observed_value").map_err(read)?;
    let absent: bool = row.try_get("absent").map_err(read)?;

    Ok(ViolationCandidate {
        rule_id: plan.rule_id.clone(),
        subject_id: subject_id.unwrap_or_default(),
        visit,
        field: plan.target.name.clone(),
        observed_value,
        expected: if absent {
            MISSING_RECORD_EXPECTATION.to_string()
        } else {
            plan.description.clone()
        },
    })
}

#[async_trait::async_trait]
impl DataSource for PostgresDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, plan: &BatchQuery, today: NaiveDate) -> Result<Vec<ViolationCandidate>> {
        let SqlStatement { sql, params } = SqlRenderer::render(plan, today)?;
        debug!("Rule '{}' SQL: {} ({} params)", plan.rule_id, sql, params.len());

        let mut tx = self.pool.begin().await.map_err(|e| {
            RuntimeError::DataSource(format!("Failed to begin transaction: {}", e))
        })?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| RuntimeError::DataSource(format!("Failed to set isolation: {}", e)))?;

        let rows = bind_all(sqlx::query(&sql), &params)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| {
                RuntimeError::DataSource(format!("Query for rule '{}' failed: {}", plan.rule_id, e))
            })?;

        tx.commit()
            .await
            .map_err(|e| RuntimeError::DataSource(format!("Failed to end transaction: {}", e)))?;

        rows.iter().map(|row| candidate(plan, row)).collect()
    }
}
