//! TrialCheck Runtime - Execution of compiled rules
//!
//! This crate provides:
//! - The real-time executor and the compiled-rule cache
//! - Batch data sources (in-memory, PostgreSQL behind `sqlx`)
//! - Violation and run persistence
//! - The QC engine and its scheduler

pub mod cache;
pub mod datasource;
pub mod error;
pub mod executor;
pub mod qc;
pub mod result;

// Re-export main types
pub use cache::{CacheConfig, CacheStats, RuleCache};
pub use datasource::{DataSource, InMemoryDataSource, SqlRenderer, SqlStatement, Table};
#[cfg(feature = "sqlx")]
pub use datasource::PostgresDataSource;
pub use error::{Result, RuntimeError};
pub use executor::Executor;
pub use qc::{
    CancelHandle, DueRunner, EngineState, QcConfig, QcEngine, ScheduledPlan, Scheduler,
    SchedulerHandle,
};
pub use result::{
    MemoryRunStore, MemoryViolationStore, QCRunRecord, RuleFailure, RuleFailureKind, RunStatus,
    RunStore, RunTrigger, Violation, ViolationFilter, ViolationStatus, ViolationStore,
};
#[cfg(feature = "sqlx")]
pub use result::{ensure_schema, PostgresRunStore, PostgresViolationStore};
