//! Data Source Layer for batch QC
//!
//! Batch plans run against a read-only relational source:
//! - `InMemoryDataSource` executes plans directly over snapshot tables
//! - `PostgresDataSource` renders plans to parameterized SQL (feature `sqlx`)

pub mod memory;
#[cfg(feature = "sqlx")]
pub mod postgres;
pub mod sql;

pub use memory::{InMemoryDataSource, Table};
#[cfg(feature = "sqlx")]
pub use postgres::PostgresDataSource;
pub use sql::{SqlRenderer, SqlStatement};

use crate::error::Result;
use chrono::NaiveDate;
use trialcheck_core::ir::{BatchQuery, ViolationCandidate};

/// Expected-constraint text reported for a missing visit record
pub const MISSING_RECORD_EXPECTATION: &str = "record present for visit";

/// Read-only relational access used by batch queries
#[async_trait::async_trait]
pub trait DataSource: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Execute a plan and return its violation candidates, ordered by
    /// subject and visit. `today` is what the plan's `today` reads as.
    async fn execute(&self, plan: &BatchQuery, today: NaiveDate) -> Result<Vec<ViolationCandidate>>;
}
