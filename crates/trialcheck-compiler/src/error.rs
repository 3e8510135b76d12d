//! Compiler error types

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use trialcheck_core::Span;
use trialcheck_parser::SyntaxError;

/// Category of a semantic problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticErrorKind {
    /// Field not in the catalog
    UnknownField,
    /// Function not in the builtin whitelist
    UnknownFunction,
    /// Wrong number of arguments
    ArityMismatch,
    /// Operand types do not fit the operator
    TypeMismatch,
    /// Rule body is not a logical expression
    NotBoolean,
    /// Construct not allowed for the rule's context and scope
    IllegalScope,
    /// Batch rule reads fields from more than one table
    CrossTableReference,
    /// Declared scope is never used by the rule body
    ScopeUnused,
}

impl fmt::Display for SemanticErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SemanticErrorKind::UnknownField => "unknown field",
            SemanticErrorKind::UnknownFunction => "unknown function",
            SemanticErrorKind::ArityMismatch => "arity mismatch",
            SemanticErrorKind::TypeMismatch => "type mismatch",
            SemanticErrorKind::NotBoolean => "not boolean",
            SemanticErrorKind::IllegalScope => "illegal scope",
            SemanticErrorKind::CrossTableReference => "cross-table reference",
            SemanticErrorKind::ScopeUnused => "scope unused",
        };
        f.write_str(name)
    }
}

/// A located semantic problem
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} at {span}: {message}")]
pub struct SemanticError {
    pub kind: SemanticErrorKind,
    pub span: Span,
    pub message: String,
}

impl SemanticError {
    pub fn new(kind: SemanticErrorKind, span: Span, message: impl Into<String>) -> Self {
        Self {
            kind,
            span,
            message: message.into(),
        }
    }
}

/// Compiler error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    /// Rule text did not parse
    #[error("Syntax error: {0}")]
    Syntax(#[from] SyntaxError),

    /// One or more semantic problems
    #[error("Semantic validation failed: {}", join_errors(.0))]
    Semantic(Vec<SemanticError>),

    /// Codegen invariant violated on an already-validated rule
    #[error("Internal compiler error: {0}")]
    Internal(String),
}

impl CompileError {
    pub fn semantic_errors(&self) -> &[SemanticError] {
        match self {
            CompileError::Semantic(errors) => errors,
            _ => &[],
        }
    }

    /// True if the rule itself is at fault rather than the compiler
    pub fn is_author_error(&self) -> bool {
        !matches!(self, CompileError::Internal(_))
    }
}

fn join_errors(errors: &[SemanticError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for compiler operations
pub type Result<T> = std::result::Result<T, CompileError>;
