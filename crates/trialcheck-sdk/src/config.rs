//! Configuration types for ValidationEngine
//!
//! ```yaml
//! qc:
//!   rule_timeout_secs: 120
//!   auto_resolve: false
//!   tick_interval_secs: 60
//! cache:
//!   max_entries: 5000
//! compiler:
//!   expected_visits_table: expected_visits
//!   layout:
//!     subject_column: subject_id
//!     visit_column: visit
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use trialcheck_compiler::CompilerOptions;
use trialcheck_runtime::{CacheConfig, QcConfig};

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Batch QC settings
    pub qc: QcConfig,

    /// Compiled-rule cache settings
    pub cache: CacheConfig,

    /// Compiler options
    pub compiler: CompilerOptions,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn with_qc(mut self, qc: QcConfig) -> Self {
        self.qc = qc;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_compiler_options(mut self, options: CompilerOptions) -> Self {
        self.compiler = options;
        self
    }
}
