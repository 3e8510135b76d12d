//! Lexer
//!
//! Splits rule text into tokens with byte spans.
//!
//! - Keywords are case-insensitive
//! - `--` starts a comment that runs to end of line
//! - Strings use `"..."` or `'...'` with `\"`, `\'` and `\\` escapes
//! - Dates are written `@YYYY-MM-DD`

use crate::error::{Result, SyntaxError};
use chrono::NaiveDate;
use std::fmt;
use trialcheck_core::Span;

/// Reserved words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Between,
    And,
    Or,
    Not,
    If,
    Then,
    Else,
    Elif,
    Endif,
    In,
    Required,
    Allow,
    Missing,
    Within,
    Of,
    Today,
    Days,
    Weeks,
    True,
    False,
}

impl Keyword {
    pub fn lookup(word: &str) -> Option<Self> {
        let kw = match word.to_ascii_lowercase().as_str() {
            "between" => Keyword::Between,
            "and" => Keyword::And,
            "or" => Keyword::Or,
            "not" => Keyword::Not,
            "if" => Keyword::If,
            "then" => Keyword::Then,
            "else" => Keyword::Else,
            "elif" => Keyword::Elif,
            "endif" => Keyword::Endif,
            "in" => Keyword::In,
            "required" => Keyword::Required,
            "allow" => Keyword::Allow,
            "missing" => Keyword::Missing,
            "within" => Keyword::Within,
            "of" => Keyword::Of,
            "today" => Keyword::Today,
            "days" | "day" => Keyword::Days,
            "weeks" | "week" => Keyword::Weeks,
            "true" => Keyword::True,
            "false" => Keyword::False,
            _ => return None,
        };
        Some(kw)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Keyword::Between => "between",
            Keyword::And => "and",
            Keyword::Or => "or",
            Keyword::Not => "not",
            Keyword::If => "if",
            Keyword::Then => "then",
            Keyword::Else => "else",
            Keyword::Elif => "elif",
            Keyword::Endif => "endif",
            Keyword::In => "in",
            Keyword::Required => "required",
            Keyword::Allow => "allow",
            Keyword::Missing => "missing",
            Keyword::Within => "within",
            Keyword::Of => "of",
            Keyword::Today => "today",
            Keyword::Days => "days",
            Keyword::Weeks => "weeks",
            Keyword::True => "true",
            Keyword::False => "false",
        }
    }
}

/// Token kinds
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Str(String),
    Date(NaiveDate),
    Ident(String),
    Keyword(Keyword),
    /// `=` or `==`
    Eq,
    /// `!=` or `<>`
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
    Dot,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Number(n) => write!(f, "number {}", trialcheck_core::Value::Number(*n)),
            TokenKind::Str(s) => write!(f, "string \"{}\"", s),
            TokenKind::Date(d) => write!(f, "date @{}", d.format("%Y-%m-%d")),
            TokenKind::Ident(name) => write!(f, "identifier '{}'", name),
            TokenKind::Keyword(kw) => write!(f, "keyword '{}'", kw.as_str()),
            TokenKind::Eq => write!(f, "'='"),
            TokenKind::Ne => write!(f, "'!='"),
            TokenKind::Lt => write!(f, "'<'"),
            TokenKind::Le => write!(f, "'<='"),
            TokenKind::Gt => write!(f, "'>'"),
            TokenKind::Ge => write!(f, "'>='"),
            TokenKind::Plus => write!(f, "'+'"),
            TokenKind::Minus => write!(f, "'-'"),
            TokenKind::Star => write!(f, "'*'"),
            TokenKind::Slash => write!(f, "'/'"),
            TokenKind::Percent => write!(f, "'%'"),
            TokenKind::LParen => write!(f, "'('"),
            TokenKind::RParen => write!(f, "')'"),
            TokenKind::Comma => write!(f, "','"),
            TokenKind::Dot => write!(f, "'.'"),
            TokenKind::Eof => write!(f, "end of input"),
        }
    }
}

/// A token with its source span
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

/// Tokenizer over rule text
pub struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
        }
    }

    /// Tokenize the whole input. The last token is always `Eof`.
    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => self.pos += 1,
                Some(b'-') if self.peek_at(1) == Some(b'-') => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => return,
            }
        }
    }

    fn token(&self, kind: TokenKind, start: usize) -> Token {
        Token {
            kind,
            span: Span::new(start, self.pos),
        }
    }

    fn next_token(&mut self) -> Result<Token> {
        self.skip_trivia();
        let start = self.pos;

        let Some(b) = self.peek() else {
            return Ok(self.token(TokenKind::Eof, start));
        };

        if b.is_ascii_digit() {
            return self.number(start);
        }
        if b.is_ascii_alphabetic() || b == b'_' {
            return Ok(self.word(start));
        }

        let kind = match b {
            b'"' | b'\'' => return self.string(start, b),
            b'@' => return self.date(start),
            b'=' => {
                self.pos += 1;
                if self.peek() == Some(b'=') {
                    self.pos += 1;
                }
                TokenKind::Eq
            }
            b'!' if self.peek_at(1) == Some(b'=') => {
                self.pos += 2;
                TokenKind::Ne
            }
            b'<' => {
                self.pos += 1;
                match self.peek() {
                    Some(b'=') => {
                        self.pos += 1;
                        TokenKind::Le
                    }
                    Some(b'>') => {
                        self.pos += 1;
                        TokenKind::Ne
                    }
                    _ => TokenKind::Lt,
                }
            }
            b'>' => {
                self.pos += 1;
                if self.peek() == Some(b'=') {
                    self.pos += 1;
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            b'+' => self.single(TokenKind::Plus),
            b'-' => self.single(TokenKind::Minus),
            b'*' => self.single(TokenKind::Star),
            b'/' => self.single(TokenKind::Slash),
            b'%' => self.single(TokenKind::Percent),
            b'(' => self.single(TokenKind::LParen),
            b')' => self.single(TokenKind::RParen),
            b',' => self.single(TokenKind::Comma),
            b'.' => self.single(TokenKind::Dot),
            _ => {
                let ch = self.source[start..].chars().next().unwrap_or('?');
                return Err(SyntaxError::new(
                    Span::new(start, start + ch.len_utf8()),
                    format!("character '{}'", ch),
                    "a token",
                ));
            }
        };
        Ok(self.token(kind, start))
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.pos += 1;
        kind
    }

    fn number(&mut self, start: usize) -> Result<Token> {
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') && self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
            while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text = &self.source[start..self.pos];
        let value = text.parse::<f64>().map_err(|_| {
            SyntaxError::new(Span::new(start, self.pos), format!("'{}'", text), "a number")
        })?;
        Ok(self.token(TokenKind::Number(value), start))
    }

    fn word(&mut self, start: usize) -> Token {
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            self.pos += 1;
        }
        let text = &self.source[start..self.pos];
        let kind = match Keyword::lookup(text) {
            Some(kw) => TokenKind::Keyword(kw),
            None => TokenKind::Ident(text.to_string()),
        };
        self.token(kind, start)
    }

    fn string(&mut self, start: usize, quote: u8) -> Result<Token> {
        self.pos += 1;
        let mut value = String::new();
        loop {
            let Some(b) = self.peek() else {
                return Err(SyntaxError::new(
                    Span::new(start, start + 1),
                    "unterminated string",
                    "closing quote",
                ));
            };
            if b == quote {
                self.pos += 1;
                return Ok(self.token(TokenKind::Str(value), start));
            }
            if b == b'\\' {
                match self.peek_at(1) {
                    Some(e @ (b'"' | b'\'' | b'\\')) => {
                        value.push(e as char);
                        self.pos += 2;
                        continue;
                    }
                    _ => {
                        return Err(SyntaxError::new(
                            Span::new(self.pos, self.pos + 2),
                            "invalid escape",
                            "one of \\\" \\' \\\\",
                        ))
                    }
                }
            }
            // Push the full UTF-8 character
            let ch = self.source[self.pos..].chars().next().unwrap_or('\u{fffd}');
            value.push(ch);
            self.pos += ch.len_utf8();
        }
    }

    fn date(&mut self, start: usize) -> Result<Token> {
        self.pos += 1;
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_digit() || b == b'-')
        {
            self.pos += 1;
        }
        let text = &self.source[start + 1..self.pos];
        let shaped = text.len() == 10 && text.as_bytes()[4] == b'-' && text.as_bytes()[7] == b'-';
        match NaiveDate::parse_from_str(text, "%Y-%m-%d") {
            Ok(date) if shaped => Ok(self.token(TokenKind::Date(date), start)),
            _ => Err(SyntaxError::new(
                Span::new(start, self.pos),
                format!("'@{}'", text),
                "a calendar date @YYYY-MM-DD",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_keywords_case_insensitive() {
        assert_eq!(
            kinds("BETWEEN 40 And 200"),
            vec![
                TokenKind::Keyword(Keyword::Between),
                TokenKind::Number(40.0),
                TokenKind::Keyword(Keyword::And),
                TokenKind::Number(200.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("= == != <> <= >= < >"),
            vec![
                TokenKind::Eq,
                TokenKind::Eq,
                TokenKind::Ne,
                TokenKind::Ne,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::Lt,
                TokenKind::Gt,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comment_skipped() {
        assert_eq!(
            kinds("age -- adult check\n>= 18"),
            vec![
                TokenKind::Ident("age".to_string()),
                TokenKind::Ge,
                TokenKind::Number(18.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_strings_and_escapes() {
        assert_eq!(
            kinds(r#""a\"b" 'it\'s'"#),
            vec![
                TokenKind::Str("a\"b".to_string()),
                TokenKind::Str("it's".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_unterminated_string_located_at_quote() {
        let err = Lexer::new("sex = \"M").tokenize().unwrap_err();
        assert_eq!(err.span, Span::new(6, 7));
        assert_eq!(err.found, "unterminated string");
    }

    #[test]
    fn test_date_literal() {
        let tokens = kinds("@2024-02-29");
        assert_eq!(
            tokens[0],
            TokenKind::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );
        assert!(Lexer::new("@2023-02-29").tokenize().is_err());
        assert!(Lexer::new("@2024-1-5").tokenize().is_err());
    }

    #[test]
    fn test_unexpected_character() {
        let err = Lexer::new("age ; 3").tokenize().unwrap_err();
        assert_eq!(err.span, Span::new(4, 5));
    }

    #[test]
    fn test_decimal_number_then_dot() {
        assert_eq!(
            kinds("72.5"),
            vec![TokenKind::Number(72.5), TokenKind::Eof]
        );
    }
}
