//! Real-time executor
//!
//! Runs compiled validators against a form record. Evaluation itself is
//! pure; this layer adds the logging and fail-open policy.

use tracing::{debug, warn};
use trialcheck_core::ir::{EvalContext, EvaluationStatus, RealTimeValidator, Record, ValidationResult};

/// Real-time rule executor
#[derive(Debug, Clone, Copy, Default)]
pub struct Executor;

impl Executor {
    /// Evaluate one validator against a record
    pub fn validate(
        validator: &RealTimeValidator,
        record: &Record,
        ctx: &EvalContext,
    ) -> ValidationResult {
        let result = validator.evaluate(record, ctx);

        match result.status {
            EvaluationStatus::Error => warn!(
                "Rule '{}' on field '{}' failed open: {}",
                result.rule_id,
                result.field,
                result.message.as_deref().unwrap_or("unknown fault")
            ),
            EvaluationStatus::Skipped => debug!(
                "Rule '{}' skipped: {}",
                result.rule_id,
                result.message.as_deref().unwrap_or("missing value")
            ),
            EvaluationStatus::Failed => debug!(
                "Rule '{}' failed: {}",
                result.rule_id,
                result.message.as_deref().unwrap_or_default()
            ),
            EvaluationStatus::Passed => {}
        }

        result
    }

    /// Evaluate several validators against the same record, in order
    pub fn validate_all<'a, I>(validators: I, record: &Record, ctx: &EvalContext) -> Vec<ValidationResult>
    where
        I: IntoIterator<Item = &'a RealTimeValidator>,
    {
        validators
            .into_iter()
            .map(|v| Self::validate(v, record, ctx))
            .collect()
    }
}
