//! Rule model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Where a rule runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleContext {
    /// Synchronous per-field check during data entry
    #[default]
    RealTime,
    /// Scheduled QC sweep over the dataset
    Batch,
}

impl fmt::Display for RuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleContext::RealTime => f.write_str("real_time"),
            RuleContext::Batch => f.write_str("batch"),
        }
    }
}

/// Breadth of records a rule depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// Only the target field
    #[default]
    Field,
    /// Several fields of the same record
    CrossField,
    /// The same subject's values at other visits
    CrossVisit,
    /// Population statistics over all subjects
    CrossPatient,
    /// Dataset completeness
    Dataset,
}

impl RuleScope {
    /// Scopes that read more than the current record
    pub fn requires_batch(&self) -> bool {
        !matches!(self, RuleScope::Field)
    }
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuleScope::Field => "field",
            RuleScope::CrossField => "cross_field",
            RuleScope::CrossVisit => "cross_visit",
            RuleScope::CrossPatient => "cross_patient",
            RuleScope::Dataset => "dataset",
        };
        f.write_str(name)
    }
}

/// Severity attached to failures and violations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => f.write_str("error"),
            Severity::Warning => f.write_str("warning"),
            Severity::Info => f.write_str("info"),
        }
    }
}

/// When a batch rule fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Only via a manual trigger
    Manual,
    /// Every N minutes
    Interval { minutes: u32 },
    /// Once per day at the given UTC hour
    Daily { hour: u32 },
}

impl Schedule {
    /// Next fire time after a run at `last_run`. `None` for manual rules.
    pub fn next_after(&self, last_run: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Manual => None,
            Schedule::Interval { minutes } => {
                Some(last_run + Duration::minutes(i64::from((*minutes).max(1))))
            }
            Schedule::Daily { hour } => {
                let hour = (*hour).min(23);
                let today_at = last_run
                    .date_naive()
                    .and_hms_opt(hour, 0, 0)?
                    .and_utc();
                if today_at > last_run {
                    Some(today_at)
                } else {
                    Some(today_at + Duration::days(1))
                }
            }
        }
    }

    /// A rule is due if it never ran or its next fire time has passed
    pub fn is_due(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match (self, last_run) {
            (Schedule::Manual, _) => false,
            (_, None) => true,
            (_, Some(last)) => self.next_after(last).is_some_and(|next| next <= now),
        }
    }
}

/// A validation rule as authored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique identifier
    pub id: String,

    /// Target field (the implicit subject of bare predicates)
    pub field: String,

    /// Rule text in the rule language
    pub text: String,

    #[serde(default)]
    pub context: RuleContext,

    #[serde(default)]
    pub scope: RuleScope,

    #[serde(default)]
    pub severity: Severity,

    /// Batch schedule; `None` for real-time rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,

    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_active() -> bool {
    true
}

impl Rule {
    /// Create an active real-time field rule
    pub fn new(id: impl Into<String>, field: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            field: field.into(),
            text: text.into(),
            context: RuleContext::RealTime,
            scope: RuleScope::Field,
            severity: Severity::Error,
            schedule: None,
            active: true,
            description: None,
        }
    }

    /// Make this a batch rule with the given scope
    pub fn batch(mut self, scope: RuleScope) -> Self {
        self.context = RuleContext::Batch;
        self.scope = scope;
        if self.schedule.is_none() {
            self.schedule = Some(Schedule::Manual);
        }
        self
    }

    pub fn with_context(mut self, context: RuleContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_scope(mut self, scope: RuleScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Hash over everything that changes the compiled artifact.
    ///
    /// Two rules with the same hash compile to the same validator and plan
    /// against the same catalog version.
    pub fn content_hash(&self, catalog_version: u64) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.text.as_str(),
            self.field.as_str(),
            &self.context.to_string(),
            &self.scope.to_string(),
            &self.severity.to_string(),
            &catalog_version.to_string(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}
