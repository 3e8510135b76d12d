//! Compiled real-time validator
//!
//! A `RealTimeValidator` is an immutable tree of closures built from the
//! primitive whitelist. It never sees rule text, only the typed tree it was
//! generated from, and evaluation is pure: no I/O, no shared state, and the
//! only clock is `EvalContext::today`.

use super::primitive::Primitive;
use crate::ast::{AllowKind, FieldRef, Severity};
use crate::types::Value;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Current form state: field name to value
pub type Record = HashMap<String, Value>;

/// Evaluation context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalContext {
    /// Date `today` evaluates to
    pub today: NaiveDate,
}

impl EvalContext {
    pub fn new(today: NaiveDate) -> Self {
        Self { today }
    }

    /// Context for the current UTC date
    pub fn now() -> Self {
        Self::new(Utc::now().date_naive())
    }
}

impl Default for EvalContext {
    fn default() -> Self {
        Self::now()
    }
}

/// Why a closure stopped before producing a value
#[derive(Debug, Clone, PartialEq)]
pub enum Halt {
    /// A referenced field is missing; `token` holds the missing-value token
    /// it carried, if any
    Missing { field: String, token: Option<String> },
    /// Runtime fault (wrong runtime type, division by zero, ...)
    Fault(String),
}

impl Halt {
    pub fn fault(message: impl Into<String>) -> Self {
        Halt::Fault(message.into())
    }
}

/// Result of a compiled closure
pub type Eval<T> = std::result::Result<T, Halt>;

/// A compiled closure node
pub type CompiledFn = Box<dyn Fn(&Record, &EvalContext) -> Eval<Value> + Send + Sync>;

/// Read a field from the record, applying missing-value rules and coercing
/// to the declared type
pub fn read_field(record: &Record, field: &FieldRef, allow: Option<&AllowKind>) -> Eval<Value> {
    let raw = match record.get(&field.name) {
        None | Some(Value::Null) => {
            return Err(Halt::Missing {
                field: field.name.clone(),
                token: None,
            })
        }
        Some(v) => v,
    };

    if let Value::String(text) = raw {
        if text.trim().is_empty() {
            return Err(Halt::Missing {
                field: field.name.clone(),
                token: None,
            });
        }
        if field.is_missing_token(text) || allow.is_some_and(|a| a.accepts_token(text)) {
            return Err(Halt::Missing {
                field: field.name.clone(),
                token: Some(text.trim().to_string()),
            });
        }
    }

    raw.coerce(field.field_type).ok_or_else(|| {
        Halt::fault(format!(
            "{} = {} is not a {} value",
            field.name, raw, field.field_type
        ))
    })
}

/// Outcome of evaluating one rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationStatus {
    Passed,
    Failed,
    /// Inconclusive: a referenced field was missing
    Skipped,
    /// Runtime fault; fails open
    Error,
}

impl fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvaluationStatus::Passed => f.write_str("passed"),
            EvaluationStatus::Failed => f.write_str("failed"),
            EvaluationStatus::Skipped => f.write_str("skipped"),
            EvaluationStatus::Error => f.write_str("error"),
        }
    }
}

/// Result of a real-time check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub rule_id: String,
    pub field: String,
    /// False only when the rule definitively failed
    pub valid: bool,
    pub status: EvaluationStatus,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ValidationResult {
    fn new(validator: &RealTimeValidator, status: EvaluationStatus, message: Option<String>) -> Self {
        Self {
            rule_id: validator.rule_id.clone(),
            field: validator.target.name.clone(),
            valid: status != EvaluationStatus::Failed,
            status,
            severity: validator.severity,
            message,
        }
    }

    /// Result for a rule that could not be evaluated at all
    pub fn error(rule_id: impl Into<String>, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            field: field.into(),
            valid: true,
            status: EvaluationStatus::Error,
            severity: Severity::Error,
            message: Some(message.into()),
        }
    }
}

/// Immutable compiled validator for one rule
pub struct RealTimeValidator {
    rule_id: String,
    content_hash: String,
    target: FieldRef,
    severity: Severity,
    description: String,
    allow: Option<AllowKind>,
    root: CompiledFn,
    call_graph: Vec<Primitive>,
}

impl RealTimeValidator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rule_id: impl Into<String>,
        content_hash: impl Into<String>,
        target: FieldRef,
        severity: Severity,
        description: impl Into<String>,
        allow: Option<AllowKind>,
        root: CompiledFn,
        call_graph: Vec<Primitive>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            content_hash: content_hash.into(),
            target,
            severity,
            description: description.into(),
            allow,
            root,
            call_graph,
        }
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn field(&self) -> &str {
        &self.target.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Primitives this validator was composed of, one entry per node
    pub fn call_graph(&self) -> &[Primitive] {
        &self.call_graph
    }

    /// Call graph as a multiset
    pub fn call_counts(&self) -> BTreeMap<Primitive, usize> {
        let mut counts = BTreeMap::new();
        for p in &self.call_graph {
            *counts.entry(*p).or_insert(0) += 1;
        }
        counts
    }

    /// Evaluate the rule against one record
    pub fn evaluate(&self, record: &Record, ctx: &EvalContext) -> ValidationResult {
        if let Some(allow) = &self.allow {
            if self.target_allowed(record, allow) {
                return ValidationResult::new(self, EvaluationStatus::Passed, None);
            }
        }

        match (self.root)(record, ctx) {
            Ok(Value::Bool(true)) => ValidationResult::new(self, EvaluationStatus::Passed, None),
            Ok(Value::Bool(false)) => {
                let message = self.failure_message(record);
                ValidationResult::new(self, EvaluationStatus::Failed, Some(message))
            }
            Ok(other) => ValidationResult::new(
                self,
                EvaluationStatus::Error,
                Some(format!("rule produced a {} value", other.type_name())),
            ),
            Err(Halt::Missing { field, token }) => {
                let allowed = match (&self.allow, &token) {
                    (Some(AllowKind::Missing), _) => true,
                    (Some(allow @ AllowKind::Tokens(_)), Some(token)) => allow.accepts_token(token),
                    _ => false,
                };
                if allowed {
                    ValidationResult::new(self, EvaluationStatus::Passed, None)
                } else {
                    ValidationResult::new(
                        self,
                        EvaluationStatus::Skipped,
                        Some(format!("{} is missing", field)),
                    )
                }
            }
            Err(Halt::Fault(message)) => {
                ValidationResult::new(self, EvaluationStatus::Error, Some(message))
            }
        }
    }

    /// True if the allow clause accepts the target's current value outright
    fn target_allowed(&self, record: &Record, allow: &AllowKind) -> bool {
        match allow {
            AllowKind::Missing => matches!(
                read_field(record, &self.target, None),
                Err(Halt::Missing { .. })
            ),
            AllowKind::Tokens(_) => match record.get(&self.target.name) {
                Some(Value::String(text)) => allow.accepts_token(text),
                _ => false,
            },
        }
    }

    fn failure_message(&self, record: &Record) -> String {
        let observed = match record.get(&self.target.name) {
            None | Some(Value::Null) => "missing".to_string(),
            Some(v) => v.to_string(),
        };
        format!(
            "{} = {} is invalid: expected {}",
            self.target.name, observed, self.description
        )
    }
}

impl fmt::Debug for RealTimeValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealTimeValidator")
            .field("rule_id", &self.rule_id)
            .field("content_hash", &self.content_hash)
            .field("field", &self.target.name)
            .field("description", &self.description)
            .field("call_graph", &self.call_graph)
            .finish()
    }
}
