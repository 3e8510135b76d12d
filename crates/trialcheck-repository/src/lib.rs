//! Repository layer for TrialCheck
//!
//! Storage for the inputs the validation engine consumes:
//!
//! - **Rules**: in memory or as one YAML file per rule on disk
//! - **Field catalog**: fixed in memory or loaded from a YAML file
//! - **Form records**: current values for real-time checks
//!
//! # Quick Start
//!
//! ```no_run
//! use trialcheck_repository::{FileSystemRuleStore, RuleStore};
//! use trialcheck_core::Rule;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = FileSystemRuleStore::create("rules").await?;
//! store.save(&Rule::new("bp_range", "systolic_bp", "between 60 and 220")).await?;
//! let rule = store.get("bp_range").await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod file_system;
pub mod memory;
pub mod traits;

pub use error::{RepositoryError, RepositoryResult};
pub use file_system::{FileSystemCatalogProvider, FileSystemRuleStore};
pub use memory::{MemoryRecordProvider, MemoryRuleStore, StaticCatalogProvider};
pub use traits::{FieldCatalogProvider, RecordProvider, RuleStore};
