//! QC results: violations, run records and their persistence

mod persistence;
#[cfg(feature = "sqlx")]
mod postgres;
mod run;
mod violation;

pub use persistence::{
    AppliedChanges, MemoryRunStore, MemoryViolationStore, RunStore, ViolationChanges,
    ViolationStore,
};
#[cfg(feature = "sqlx")]
pub use postgres::{ensure_schema, PostgresRunStore, PostgresViolationStore};
pub use run::{QCRunRecord, RuleFailure, RuleFailureKind, RunStatus, RunTrigger};
pub use violation::{Violation, ViolationFilter, ViolationKey, ViolationStatus};
