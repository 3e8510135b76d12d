//! TrialCheck Parser - rule text to AST
//!
//! This crate provides the lexer and recursive-descent parser for the
//! TrialCheck rule language. Parsing never evaluates anything: the output
//! is a `RuleAst` or a located `SyntaxError`.

pub mod error;
pub mod lexer;
pub mod parser;

// Re-export main parser types
pub use error::{Result, SyntaxError};
pub use lexer::{Keyword, Lexer, Token, TokenKind};
pub use parser::RuleParser;

use trialcheck_core::ast::{RuleAst, RuleContext};

/// Parse rule text for the given context
pub fn parse(text: &str, context_hint: RuleContext) -> Result<RuleAst> {
    RuleParser::parse(text, context_hint)
}
