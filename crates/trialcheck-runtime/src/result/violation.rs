//! Violations raised by batch QC

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use trialcheck_core::ir::ViolationCandidate;
use trialcheck_core::Severity;
use uuid::Uuid;

/// Deduplication key: (rule, subject, visit, field)
pub type ViolationKey = (String, String, Option<String>, String);

/// Review status of a violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationStatus {
    #[default]
    Open,
    Review,
    Resolved,
    FalsePositive,
}

impl ViolationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationStatus::Open => "open",
            ViolationStatus::Review => "review",
            ViolationStatus::Resolved => "resolved",
            ViolationStatus::FalsePositive => "false_positive",
        }
    }
}

impl fmt::Display for ViolationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViolationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(ViolationStatus::Open),
            "review" => Ok(ViolationStatus::Review),
            "resolved" => Ok(ViolationStatus::Resolved),
            "false_positive" => Ok(ViolationStatus::FalsePositive),
            other => Err(format!("unknown violation status '{}'", other)),
        }
    }
}

/// A persisted data-quality finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub id: Uuid,
    pub rule_id: String,
    pub subject_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visit: Option<String>,
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_value: Option<String>,
    pub expected: String,
    pub severity: Severity,
    pub status: ViolationStatus,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Run that first detected this violation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
}

impl Violation {
    /// New open violation for a candidate row
    pub fn from_candidate(
        candidate: ViolationCandidate,
        severity: Severity,
        run_id: Option<Uuid>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_id: candidate.rule_id,
            subject_id: candidate.subject_id,
            visit: candidate.visit,
            field: candidate.field,
            observed_value: candidate.observed_value,
            expected: candidate.expected,
            severity,
            status: ViolationStatus::Open,
            detected_at,
            resolved_at: None,
            run_id,
        }
    }

    pub fn key(&self) -> ViolationKey {
        (
            self.rule_id.clone(),
            self.subject_id.clone(),
            self.visit.clone(),
            self.field.clone(),
        )
    }

    /// Anything not resolved blocks a duplicate for the same key. A false
    /// positive stays dismissed instead of being flagged again.
    pub fn is_active(&self) -> bool {
        self.status != ViolationStatus::Resolved
    }

    /// Move to a new status, stamping or clearing `resolved_at`
    pub fn set_status(&mut self, status: ViolationStatus, now: DateTime<Utc>) {
        self.status = status;
        self.resolved_at = match status {
            ViolationStatus::Resolved => Some(now),
            _ => None,
        };
    }
}

/// Query filter for violations; unset fields match anything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViolationFilter {
    pub rule_id: Option<String>,
    pub subject_id: Option<String>,
    pub visit: Option<String>,
    pub field: Option<String>,
    pub status: Option<ViolationStatus>,
    pub severity: Option<Severity>,
}

impl ViolationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    pub fn with_visit(mut self, visit: impl Into<String>) -> Self {
        self.visit = Some(visit.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_status(mut self, status: ViolationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn matches(&self, violation: &Violation) -> bool {
        self.rule_id.as_ref().map_or(true, |r| *r == violation.rule_id)
            && self.subject_id.as_ref().map_or(true, |s| *s == violation.subject_id)
            && self
                .visit
                .as_ref()
                .map_or(true, |v| violation.visit.as_ref() == Some(v))
            && self.field.as_ref().map_or(true, |f| *f == violation.field)
            && self.status.map_or(true, |s| s == violation.status)
            && self.severity.map_or(true, |s| s == violation.severity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation() -> Violation {
        Violation::from_candidate(
            ViolationCandidate {
                rule_id: "wt".to_string(),
                subject_id: "S001".to_string(),
                visit: Some("week4".to_string()),
                field: "weight".to_string(),
                observed_value: Some("85".to_string()),
                expected: "within 10% of visit(\"baseline\").weight".to_string(),
            },
            Severity::Warning,
            None,
            Utc::now(),
        )
    }

    #[test]
    fn test_status_transitions_stamp_resolution() {
        let mut v = violation();
        assert!(v.is_active());
        let now = Utc::now();
        v.set_status(ViolationStatus::Resolved, now);
        assert_eq!(v.resolved_at, Some(now));
        assert!(!v.is_active());
        v.set_status(ViolationStatus::Open, now);
        assert!(v.resolved_at.is_none());
    }

    #[test]
    fn test_false_positive_stays_active_for_dedup() {
        let mut v = violation();
        v.set_status(ViolationStatus::FalsePositive, Utc::now());
        assert!(v.is_active());
    }

    #[test]
    fn test_filter() {
        let v = violation();
        assert!(ViolationFilter::new().matches(&v));
        assert!(ViolationFilter::new().with_rule("wt").with_visit("week4").matches(&v));
        assert!(!ViolationFilter::new().with_subject("S002").matches(&v));
        assert!(!ViolationFilter::new().with_status(ViolationStatus::Resolved).matches(&v));
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&ViolationStatus::FalsePositive).unwrap();
        assert_eq!(json, "\"false_positive\"");
        assert_eq!("review".parse::<ViolationStatus>(), Ok(ViolationStatus::Review));
    }
}
