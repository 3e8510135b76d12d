//! QC run records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

/// Final (or current) status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Every rule executed
    Success,
    /// Some rules failed, others completed
    Partial,
    /// Nothing completed, or results could not be persisted
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single rule did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleFailureKind {
    /// The rule no longer compiles against the current catalog
    Compile,
    /// Query error, including missing tables and columns
    Query,
    Timeout,
}

/// Per-rule failure recorded on a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFailure {
    pub rule_id: String,
    pub kind: RuleFailureKind,
    pub message: String,
}

impl RuleFailure {
    pub fn new(rule_id: impl Into<String>, kind: RuleFailureKind, message: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Record of one QC run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QCRunRecord {
    pub id: Uuid,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Rules attempted, failed ones included
    pub rules_run: usize,
    /// New violations inserted
    pub violations_found: usize,
    /// Violations closed by auto-resolution
    #[serde(default)]
    pub violations_resolved: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub rule_failures: Vec<RuleFailure>,
}

impl QCRunRecord {
    pub fn start(trigger: RunTrigger, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger,
            status: RunStatus::Running,
            started_at,
            ended_at: None,
            rules_run: 0,
            violations_found: 0,
            violations_resolved: 0,
            error: None,
            rule_failures: Vec::new(),
        }
    }

    pub fn finish(&mut self, status: RunStatus, ended_at: DateTime<Utc>) {
        self.status = status;
        self.ended_at = Some(ended_at);
    }

    pub fn is_finished(&self) -> bool {
        self.status != RunStatus::Running
    }

    pub fn failed_rules(&self) -> Vec<&str> {
        self.rule_failures.iter().map(|f| f.rule_id.as_str()).collect()
    }
}
