//! TrialCheck Compiler - rule text to executable artifacts
//!
//! This crate validates parsed rules against the field catalog and compiles
//! them into real-time validators or batch query plans.

pub mod codegen;
pub mod compiler;
pub mod error;
pub mod semantic;

// Re-export main types
pub use compiler::{CompileResult, CompiledRule, Compiler, CompilerOptions};
pub use error::{CompileError, Result, SemanticError, SemanticErrorKind};

// Re-export codegen types
pub use codegen::{BatchCodegen, BatchCodegenOptions, RealTimeCodegen};

// Re-export semantic types
pub use semantic::{SemanticAnalyzer, TypeChecker};
