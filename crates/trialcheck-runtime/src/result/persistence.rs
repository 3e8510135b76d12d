//! Violation and run persistence
//!
//! Stores are async traits so the QC engine can run against the in-memory
//! backends in tests and PostgreSQL in production. Each `apply` call covers
//! exactly one rule and is idempotent: a candidate whose key already has an
//! active violation is never inserted twice.

use super::run::QCRunRecord;
use super::violation::{Violation, ViolationFilter, ViolationKey, ViolationStatus};
use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Changes produced by diffing one rule's candidates against its active
/// violations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViolationChanges {
    pub insert: Vec<Violation>,
    pub resolve: Vec<Uuid>,
}

impl ViolationChanges {
    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.resolve.is_empty()
    }
}

/// Counts actually written by `apply`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedChanges {
    pub inserted: usize,
    pub resolved: usize,
}

/// Violation persistence
#[async_trait]
pub trait ViolationStore: Send + Sync {
    /// Unresolved violations of a rule
    async fn active_for_rule(&self, rule_id: &str) -> Result<Vec<Violation>>;

    /// Apply one rule's changes atomically
    async fn apply(
        &self,
        rule_id: &str,
        changes: ViolationChanges,
        now: DateTime<Utc>,
    ) -> Result<AppliedChanges>;

    /// Violations matching a filter, oldest first
    async fn query(&self, filter: &ViolationFilter) -> Result<Vec<Violation>>;

    async fn get(&self, id: Uuid) -> Result<Option<Violation>>;

    /// Review workflow transition
    async fn update_status(
        &self,
        id: Uuid,
        status: ViolationStatus,
        now: DateTime<Utc>,
    ) -> Result<Violation>;
}

/// Run history and per-rule last-execution times
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or replace a run record
    async fn record_run(&self, run: &QCRunRecord) -> Result<()>;

    /// Note that a rule executed successfully at `at`
    async fn mark_executed(&self, rule_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn last_executed(&self, rule_id: &str) -> Result<Option<DateTime<Utc>>>;

    async fn get_run(&self, id: Uuid) -> Result<Option<QCRunRecord>>;

    /// Most recent runs first
    async fn recent_runs(&self, limit: usize) -> Result<Vec<QCRunRecord>>;
}

/// In-memory violation store
#[derive(Default)]
pub struct MemoryViolationStore {
    violations: RwLock<Vec<Violation>>,
}

impl MemoryViolationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.violations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ViolationStore for MemoryViolationStore {
    async fn active_for_rule(&self, rule_id: &str) -> Result<Vec<Violation>> {
        Ok(self
            .violations
            .read()
            .await
            .iter()
            .filter(|v| v.rule_id == rule_id && v.is_active())
            .cloned()
            .collect())
    }

    async fn apply(
        &self,
        rule_id: &str,
        changes: ViolationChanges,
        now: DateTime<Utc>,
    ) -> Result<AppliedChanges> {
        let mut violations = self.violations.write().await;
        let mut applied = AppliedChanges::default();

        let resolve: HashSet<Uuid> = changes.resolve.into_iter().collect();
        for v in violations.iter_mut() {
            if v.rule_id == rule_id && v.status == ViolationStatus::Open && resolve.contains(&v.id) {
                v.set_status(ViolationStatus::Resolved, now);
                applied.resolved += 1;
            }
        }

        let mut active: HashSet<ViolationKey> = violations
            .iter()
            .filter(|v| v.rule_id == rule_id && v.is_active())
            .map(Violation::key)
            .collect();
        for v in changes.insert {
            if v.rule_id == rule_id && active.insert(v.key()) {
                violations.push(v);
                applied.inserted += 1;
            }
        }

        Ok(applied)
    }

    async fn query(&self, filter: &ViolationFilter) -> Result<Vec<Violation>> {
        Ok(self
            .violations
            .read()
            .await
            .iter()
            .filter(|v| filter.matches(v))
            .cloned()
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Violation>> {
        Ok(self.violations.read().await.iter().find(|v| v.id == id).cloned())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ViolationStatus,
        now: DateTime<Utc>,
    ) -> Result<Violation> {
        let mut violations = self.violations.write().await;
        let violation = violations
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| RuntimeError::NotFound(format!("violation {}", id)))?;
        violation.set_status(status, now);
        Ok(violation.clone())
    }
}

/// In-memory run store
#[derive(Default)]
pub struct MemoryRunStore {
    runs: RwLock<Vec<QCRunRecord>>,
    last_executed: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn record_run(&self, run: &QCRunRecord) -> Result<()> {
        let mut runs = self.runs.write().await;
        match runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => runs.push(run.clone()),
        }
        Ok(())
    }

    async fn mark_executed(&self, rule_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.last_executed
            .write()
            .await
            .insert(rule_id.to_string(), at);
        Ok(())
    }

    async fn last_executed(&self, rule_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.last_executed.read().await.get(rule_id).copied())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<QCRunRecord>> {
        Ok(self.runs.read().await.iter().find(|r| r.id == id).cloned())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<QCRunRecord>> {
        let runs = self.runs.read().await;
        Ok(runs.iter().rev().take(limit).cloned().collect())
    }
}
