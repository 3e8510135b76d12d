//! Parsed rule text

use super::expression::Expression;
use super::rule::RuleContext;
use super::span::Span;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What an `allow` clause accepts in place of a value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllowKind {
    /// `allow missing`: any missing value passes
    Missing,
    /// `allow "NA", "UNK"`: these tokens pass
    Tokens(Vec<String>),
}

impl AllowKind {
    /// Case-insensitive match against the allowed tokens
    pub fn accepts_token(&self, text: &str) -> bool {
        match self {
            AllowKind::Missing => false,
            AllowKind::Tokens(tokens) => {
                let text = text.trim();
                tokens.iter().any(|t| t.eq_ignore_ascii_case(text))
            }
        }
    }

    pub fn tokens(&self) -> &[String] {
        match self {
            AllowKind::Missing => &[],
            AllowKind::Tokens(tokens) => tokens,
        }
    }
}

impl fmt::Display for AllowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllowKind::Missing => write!(f, "allow missing"),
            AllowKind::Tokens(tokens) => {
                write!(f, "allow ")?;
                for (i, t) in tokens.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\"", t)?;
                }
                Ok(())
            }
        }
    }
}

/// Trailing `allow ...` clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllowClause {
    pub kind: AllowKind,
    pub span: Span,
}

/// Parser output for one rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAst {
    /// Rule body
    pub body: Expression,

    /// Optional allow clause
    pub allow: Option<AllowClause>,

    /// Context the rule was parsed for
    pub context_hint: RuleContext,

    /// Span of the whole rule
    pub span: Span,
}

impl fmt::Display for RuleAst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.body)?;
        if let Some(allow) = &self.allow {
            write!(f, " {}", allow.kind)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_tokens_case_insensitive() {
        let allow = AllowKind::Tokens(vec!["NA".to_string(), "UNK".to_string()]);
        assert!(allow.accepts_token("na"));
        assert!(allow.accepts_token(" Unk"));
        assert!(!allow.accepts_token("ND"));
        assert!(!AllowKind::Missing.accepts_token("NA"));
    }

    #[test]
    fn test_allow_display() {
        let allow = AllowKind::Tokens(vec!["NA".to_string(), "UNK".to_string()]);
        assert_eq!(allow.to_string(), "allow \"NA\", \"UNK\"");
        assert_eq!(AllowKind::Missing.to_string(), "allow missing");
    }
}
