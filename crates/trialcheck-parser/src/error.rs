//! Parser error types

use serde::{Deserialize, Serialize};
use thiserror::Error;
use trialcheck_core::Span;

/// Syntax error located in the rule text
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("syntax error at {span}: expected {expected}, found {found}")]
pub struct SyntaxError {
    /// Offending byte range
    pub span: Span,

    /// Description of what was found
    pub found: String,

    /// Description of what the parser expected
    pub expected: String,
}

impl SyntaxError {
    pub fn new(span: Span, found: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            span,
            found: found.into(),
            expected: expected.into(),
        }
    }

    /// Message with 1-based line and column, for author feedback
    pub fn describe(&self, source: &str) -> String {
        let (line, col) = self.span.line_col(source);
        format!(
            "line {}, column {}: expected {}, found {}",
            line, col, self.expected, self.found
        )
    }
}

/// Result type for parser operations
pub type Result<T> = std::result::Result<T, SyntaxError>;
