//! Runtime error types

use thiserror::Error;

/// Runtime error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// Fault while evaluating a row expression
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// Table not present in the data source
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Column not present in a table
    #[error("Column \"{column}\" does not exist in table \"{table}\"")]
    ColumnNotFound { table: String, column: String },

    /// Identifier rejected before reaching SQL
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Data source failure (connection, query)
    #[error("Data source error: {0}")]
    DataSource(String),

    /// Rule query exceeded its time ceiling
    #[error("Rule '{rule_id}' timed out after {seconds}s")]
    Timeout { rule_id: String, seconds: u64 },

    /// Violation or run store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Run stopped by its cancel handle
    #[error("QC run cancelled")]
    Cancelled,

    /// A QC run is already executing
    #[error("A QC run is already in progress")]
    RunInProgress,

    /// Whole run aborted because results could not be persisted
    #[error("QC run aborted: {0}")]
    SchedulerFailure(String),
}

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;
