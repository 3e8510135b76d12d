//! TrialCheck SDK
//!
//! High-level API for authoring clinical data-validation rules, checking
//! form fields as they are entered, and sweeping the study database with
//! batch QC runs.

pub mod builder;
pub mod config;
pub mod error;
pub mod telemetry;
pub mod validation_engine;

// Re-export main types
pub use builder::ValidationEngineBuilder;
pub use config::EngineConfig;
pub use error::{Result, SdkError};
pub use telemetry::init_tracing;
pub use validation_engine::ValidationEngine;

// Re-export commonly used types from dependencies
pub use trialcheck_compiler::{CompileResult, CompilerOptions};
pub use trialcheck_core::ir::{EvalContext, EvaluationStatus, Record, ValidationResult};
pub use trialcheck_core::{
    FieldCatalog, FieldDefinition, FieldType, Rule, RuleContext, RuleScope, Schedule, Severity,
    Value,
};
pub use trialcheck_parser::SyntaxError;
pub use trialcheck_runtime::{
    CacheConfig, QCRunRecord, QcConfig, RuleFailureKind, RunStatus, RunTrigger, Violation,
    ViolationFilter, ViolationStatus,
};
