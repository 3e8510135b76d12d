//! TrialCheck Core - Core types and definitions for the TrialCheck rule engine
//!
//! This crate provides the fundamental types used across the TrialCheck workspace:
//! - Value types and the field catalog
//! - AST (Abstract Syntax Tree) and typed AST definitions
//! - Compiled artifacts: the real-time validator and the batch query plan
//! - Error types

pub mod ast;
pub mod error;
pub mod ir;
pub mod types;

// Re-export commonly used types
pub use ast::{Rule, RuleContext, RuleScope, Schedule, Severity, Span};
pub use error::CoreError;
pub use types::{FieldCatalog, FieldDefinition, FieldType, Value};
