//! PostgreSQL violation and run stores

use super::persistence::{AppliedChanges, RunStore, ViolationChanges, ViolationStore};
use super::run::QCRunRecord;
use super::violation::{Violation, ViolationFilter, ViolationStatus};
use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use trialcheck_core::Severity;
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS qc_violations (
        id UUID PRIMARY KEY,
        rule_id TEXT NOT NULL,
        subject_id TEXT NOT NULL,
        visit TEXT,
        field TEXT NOT NULL,
        observed_value TEXT,
        expected TEXT NOT NULL,
        severity TEXT NOT NULL,
        status TEXT NOT NULL,
        detected_at TIMESTAMPTZ NOT NULL,
        resolved_at TIMESTAMPTZ,
        run_id UUID
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS qc_violations_active_key
        ON qc_violations (rule_id, subject_id, (COALESCE(visit, '')), field)
        WHERE status <> 'resolved'",
    "CREATE TABLE IF NOT EXISTS qc_runs (
        id UUID PRIMARY KEY,
        started_at TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL,
        record TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS qc_rule_runs (
        rule_id TEXT PRIMARY KEY,
        last_executed TIMESTAMPTZ NOT NULL
    )",
];

const VIOLATION_COLUMNS: &str = "id, rule_id, subject_id, visit, field, observed_value, expected, \
     severity, status, detected_at, resolved_at, run_id";

fn store_err(context: &str) -> impl Fn(sqlx::Error) -> RuntimeError + '_ {
    move |e| RuntimeError::Store(format!("{}: {}", context, e))
}

/// Create the QC tables if they do not exist
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(store_err("Failed to create QC schema"))?;
    }
    tracing::info!("✓ QC result schema ready");
    Ok(())
}

fn parse_severity(s: &str) -> Result<Severity> {
    match s {
        "error" => Ok(Severity::Error),
        "warning" => Ok(Severity::Warning),
        "info" => Ok(Severity::Info),
        other => Err(RuntimeError::Store(format!("unknown severity '{}'", other))),
    }
}

fn violation_from_row(row: &PgRow) -> Result<Violation> {
    let read = store_err("Failed to read violation row");
    let severity: String = row.try_get("severity").map_err(&read)?;
    let status: String = row.try_get("status").map_err(&read)?;

    Ok(Violation {
        id: row.try_get("id").map_err(&read)?,
        rule_id: row.try_get("rule_id").map_err(&read)?,
        subject_id: row.try_get("subject_id").map_err(&read)?,
        visit: row.try_get("visit").map_err(&read)?,
        field: row.try_get("field").map_err(&read)?,
        observed_value: row.try_get("observed_value").map_err(&read)?,
        expected: row.try_get("expected").map_err(&read)?,
        severity: parse_severity(&severity)?,
        status: status.parse().map_err(RuntimeError::Store)?,
        detected_at: row.try_get("detected_at").map_err(&read)?,
        resolved_at: row.try_get("resolved_at").map_err(&read)?,
        run_id: row.try_get("run_id").map_err(&read)?,
    })
}

/// Violation store over the `qc_violations` table
#[derive(Clone)]
pub struct PostgresViolationStore {
    pool: PgPool,
}

impl PostgresViolationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ViolationStore for PostgresViolationStore {
    async fn active_for_rule(&self, rule_id: &str) -> Result<Vec<Violation>> {
        let sql = format!(
            "SELECT {} FROM qc_violations WHERE rule_id = $1 AND status <> 'resolved' ORDER BY detected_at",
            VIOLATION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(rule_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("Failed to load active violations"))?;
        rows.iter().map(violation_from_row).collect()
    }

    async fn apply(
        &self,
        rule_id: &str,
        changes: ViolationChanges,
        now: DateTime<Utc>,
    ) -> Result<AppliedChanges> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(store_err("Failed to begin transaction"))?;
        let mut applied = AppliedChanges::default();

        if !changes.resolve.is_empty() {
            let result = sqlx::query(
                "UPDATE qc_violations SET status = 'resolved', resolved_at = $1 \
                 WHERE rule_id = $2 AND status = 'open' AND id = ANY($3)",
            )
            .bind(now)
            .bind(rule_id)
            .bind(&changes.resolve)
            .execute(&mut *tx)
            .await
            .map_err(store_err("Failed to resolve violations"))?;
            applied.resolved = result.rows_affected() as usize;
        }

        // The partial unique index turns a duplicate active key into a no-op
        for v in changes.insert.iter().filter(|v| v.rule_id == rule_id) {
            let result = sqlx::query(
                "INSERT INTO qc_violations (id, rule_id, subject_id, visit, field, observed_value, \
                 expected, severity, status, detected_at, resolved_at, run_id) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) ON CONFLICT DO NOTHING",
            )
            .bind(v.id)
            .bind(&v.rule_id)
            .bind(&v.subject_id)
            .bind(&v.visit)
            .bind(&v.field)
            .bind(&v.observed_value)
            .bind(&v.expected)
            .bind(v.severity.to_string())
            .bind(v.status.as_str())
            .bind(v.detected_at)
            .bind(v.resolved_at)
            .bind(v.run_id)
            .execute(&mut *tx)
            .await
            .map_err(store_err("Failed to insert violation"))?;
            applied.inserted += result.rows_affected() as usize;
        }

        tx.commit()
            .await
            .map_err(store_err("Failed to commit violations"))?;
        Ok(applied)
    }

    async fn query(&self, filter: &ViolationFilter) -> Result<Vec<Violation>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM qc_violations WHERE TRUE", VIOLATION_COLUMNS));
        if let Some(rule_id) = &filter.rule_id {
            builder.push(" AND rule_id = ").push_bind(rule_id.clone());
        }
        if let Some(subject_id) = &filter.subject_id {
            builder.push(" AND subject_id = ").push_bind(subject_id.clone());
        }
        if let Some(visit) = &filter.visit {
            builder.push(" AND visit = ").push_bind(visit.clone());
        }
        if let Some(field) = &filter.field {
            builder.push(" AND field = ").push_bind(field.clone());
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(severity) = filter.severity {
            builder.push(" AND severity = ").push_bind(severity.to_string());
        }
        builder.push(" ORDER BY detected_at, subject_id");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("Failed to query violations"))?;
        rows.iter().map(violation_from_row).collect()
    }

    async fn get(&self, id: Uuid) -> Result<Option<Violation>> {
        let sql = format!("SELECT {} FROM qc_violations WHERE id = $1", VIOLATION_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("Failed to load violation"))?;
        row.as_ref().map(violation_from_row).transpose()
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ViolationStatus,
        now: DateTime<Utc>,
    ) -> Result<Violation> {
        let resolved_at = (status == ViolationStatus::Resolved).then_some(now);
        let sql = format!(
            "UPDATE qc_violations SET status = $1, resolved_at = $2 WHERE id = $3 RETURNING {}",
            VIOLATION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(resolved_at)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("Failed to update violation"))?
            .ok_or_else(|| RuntimeError::NotFound(format!("violation {}", id)))?;
        violation_from_row(&row)
    }
}

/// Run store over the `qc_runs` and `qc_rule_runs` tables
#[derive(Clone)]
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn run_from_row(row: &PgRow) -> Result<QCRunRecord> {
    let record: String = row
        .try_get("record")
        .map_err(store_err("Failed to read run row"))?;
    serde_json::from_str(&record)
        .map_err(|e| RuntimeError::Store(format!("Corrupt run record: {}", e)))
}

#[async_trait]
impl RunStore for PostgresRunStore {
    async fn record_run(&self, run: &QCRunRecord) -> Result<()> {
        let record = serde_json::to_string(run)
            .map_err(|e| RuntimeError::Store(format!("Failed to serialize run: {}", e)))?;
        sqlx::query(
            "INSERT INTO qc_runs (id, started_at, status, record) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, record = EXCLUDED.record",
        )
        .bind(run.id)
        .bind(run.started_at)
        .bind(run.status.as_str())
        .bind(record)
        .execute(&self.pool)
        .await
        .map_err(store_err("Failed to record run"))?;
        Ok(())
    }

    async fn mark_executed(&self, rule_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO qc_rule_runs (rule_id, last_executed) VALUES ($1, $2) \
             ON CONFLICT (rule_id) DO UPDATE SET last_executed = EXCLUDED.last_executed",
        )
        .bind(rule_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(store_err("Failed to record rule execution"))?;
        Ok(())
    }

    async fn last_executed(&self, rule_id: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_executed FROM qc_rule_runs WHERE rule_id = $1")
            .bind(rule_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("Failed to load rule execution"))?;
        row.map(|r| r.try_get("last_executed"))
            .transpose()
            .map_err(store_err("Failed to read rule execution"))
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<QCRunRecord>> {
        let row = sqlx::query("SELECT record FROM qc_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("Failed to load run"))?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<QCRunRecord>> {
        let rows = sqlx::query("SELECT record FROM qc_runs ORDER BY started_at DESC LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("Failed to list runs"))?;
        rows.iter().map(run_from_row).collect()
    }
}
