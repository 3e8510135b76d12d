//! SDK error types

use thiserror::Error;
use trialcheck_core::RuleContext;

/// SDK error type
#[derive(Error, Debug)]
pub enum SdkError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Compiler error
    #[error("Compiler error: {0}")]
    CompileError(#[from] trialcheck_compiler::CompileError),

    /// Runtime error
    #[error("Runtime error: {0}")]
    RuntimeError(#[from] trialcheck_runtime::RuntimeError),

    /// Repository error
    #[error("Repository error: {0}")]
    RepositoryError(#[from] trialcheck_repository::RepositoryError),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// YAML configuration error
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// No active rule with this id
    #[error("Rule not found or inactive: {0}")]
    RuleNotFound(String),

    /// Rule exists but runs in the other context
    #[error("Rule '{rule_id}' is a {context} rule")]
    WrongContext { rule_id: String, context: RuleContext },

    /// Optional component was not supplied to the builder
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

/// Result type for SDK operations
pub type Result<T> = std::result::Result<T, SdkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error() {
        let error = SdkError::ConfigError("Invalid configuration".to_string());
        assert!(error.to_string().contains("Configuration error"));
        assert!(error.to_string().contains("Invalid configuration"));
    }

    #[test]
    fn test_wrong_context() {
        let error = SdkError::WrongContext {
            rule_id: "wt_change".to_string(),
            context: RuleContext::Batch,
        };
        assert_eq!(error.to_string(), "Rule 'wt_change' is a batch rule");
    }

    #[test]
    fn test_runtime_error_conversion() {
        let error: SdkError = trialcheck_runtime::RuntimeError::RunInProgress.into();
        assert!(matches!(
            error,
            SdkError::RuntimeError(trialcheck_runtime::RuntimeError::RunInProgress)
        ));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let sdk_error: SdkError = io_error.into();
        assert!(sdk_error.to_string().contains("I/O error"));
        assert!(sdk_error.to_string().contains("File not found"));
    }

    #[test]
    fn test_not_configured() {
        let error = SdkError::NotConfigured("record provider");
        assert_eq!(error.to_string(), "record provider is not configured");
    }
}
