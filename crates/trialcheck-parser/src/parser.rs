//! Rule parser
//!
//! Recursive-descent parser from tokens to a `RuleAst`.
//!
//! Precedence, lowest first: `or`, `and`, `not`, predicates
//! (comparison, `between`, `in`, `within`), `+`/`-`, `*`/`/`, unary minus.
//! A predicate without a left operand applies to the rule's target field.

use crate::error::{Result, SyntaxError};
use crate::lexer::{Keyword, Lexer, Token, TokenKind};
use trialcheck_core::ast::{
    AggregateFn, AllowClause, AllowKind, ArithOp, CompareOp, DateUnit, ExprKind, Expression,
    LogicalOp, RuleAst, RuleContext, Span, Tolerance, MAX_DAY_SPAN,
};
use trialcheck_core::Value;

/// Deepest expression tree the parser will build
const MAX_DEPTH: usize = 64;

/// Rule text parser
pub struct RuleParser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl RuleParser {
    /// Parse rule text
    pub fn parse(text: &str, context_hint: RuleContext) -> Result<RuleAst> {
        let tokens = Lexer::new(text).tokenize()?;
        let mut parser = RuleParser {
            tokens,
            pos: 0,
            depth: 0,
        };
        parser.rule(context_hint, text.len())
    }

    /// Parse a standalone expression (no allow clause)
    pub fn parse_expression(text: &str) -> Result<Expression> {
        let tokens = Lexer::new(text).tokenize()?;
        let mut parser = RuleParser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.expr()?;
        parser.expect_eof("end of expression")?;
        Ok(expr)
    }

    // =========================================================================
    // Token cursor
    // =========================================================================

    fn peek(&self) -> &Token {
        // tokenize() always ends with Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind_at(&self, offset: usize) -> &TokenKind {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at_keyword(&self, kw: Keyword) -> bool {
        self.peek().kind == TokenKind::Keyword(kw)
    }

    fn eat_keyword(&mut self, kw: Keyword) -> bool {
        if self.at_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_here(&self, expected: impl Into<String>) -> SyntaxError {
        let token = self.peek();
        SyntaxError::new(token.span, token.kind.to_string(), expected)
    }

    fn expect_keyword(&mut self, kw: Keyword) -> Result<Token> {
        if self.at_keyword(kw) {
            Ok(self.advance())
        } else {
            Err(self.error_here(format!("'{}'", kw.as_str())))
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> Result<Token> {
        if self.peek().kind == kind {
            Ok(self.advance())
        } else {
            Err(self.error_here(expected))
        }
    }

    /// One level deeper into the expression tree
    fn descend(&mut self) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error_here("a less deeply nested expression"));
        }
        self.depth += 1;
        Ok(())
    }

    fn expect_eof(&mut self, expected: &str) -> Result<()> {
        if self.peek().kind == TokenKind::Eof {
            Ok(())
        } else {
            Err(self.error_here(expected))
        }
    }

    // =========================================================================
    // Grammar
    // =========================================================================

    fn rule(&mut self, context_hint: RuleContext, len: usize) -> Result<RuleAst> {
        if self.peek().kind == TokenKind::Eof {
            return Err(self.error_here("a rule expression"));
        }
        let body = self.expr()?;
        let allow = if self.at_keyword(Keyword::Allow) {
            Some(self.allow_clause()?)
        } else {
            None
        };
        self.expect_eof("end of rule")?;

        Ok(RuleAst {
            body,
            allow,
            context_hint,
            span: Span::new(0, len),
        })
    }

    fn allow_clause(&mut self) -> Result<AllowClause> {
        let start = self.expect_keyword(Keyword::Allow)?.span;
        if self.at_keyword(Keyword::Missing) {
            let end = self.advance().span;
            return Ok(AllowClause {
                kind: AllowKind::Missing,
                span: start.merge(end),
            });
        }

        let mut tokens = Vec::new();
        let mut end;
        loop {
            let token = self.advance();
            match token.kind {
                TokenKind::Str(s) => tokens.push(s),
                kind => {
                    return Err(SyntaxError::new(
                        token.span,
                        kind.to_string(),
                        "'missing' or a quoted token",
                    ))
                }
            }
            end = token.span;
            if self.peek().kind == TokenKind::Comma {
                self.advance();
            } else {
                break;
            }
        }
        Ok(AllowClause {
            kind: AllowKind::Tokens(tokens),
            span: start.merge(end),
        })
    }

    fn expr(&mut self) -> Result<Expression> {
        self.descend()?;
        let expr = self.or_expr();
        self.depth -= 1;
        expr
    }

    // Each chained operator nests the tree one level, so binary loops
    // descend per operator and restore the depth once the chain ends.

    fn or_expr(&mut self) -> Result<Expression> {
        let mark = self.depth;
        let mut left = self.and_expr()?;
        while self.eat_keyword(Keyword::Or) {
            self.descend()?;
            let right = self.and_expr()?;
            left = Expression::logical(left, LogicalOp::Or, right);
        }
        self.depth = mark;
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expression> {
        let mark = self.depth;
        let mut left = self.not_expr()?;
        while self.eat_keyword(Keyword::And) {
            self.descend()?;
            let right = self.not_expr()?;
            left = Expression::logical(left, LogicalOp::And, right);
        }
        self.depth = mark;
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expression> {
        // `not in (...)` is an implicit-subject predicate, not a negation
        if self.at_keyword(Keyword::Not)
            && self.peek_kind_at(1) != &TokenKind::Keyword(Keyword::In)
        {
            self.descend()?;
            let start = self.advance().span;
            let inner = self.not_expr()?;
            self.depth -= 1;
            let span = start.merge(inner.span);
            return Ok(Expression::new(ExprKind::Not(Box::new(inner)), span));
        }
        self.predicate()
    }

    fn starts_suffix(&self) -> bool {
        match &self.peek().kind {
            TokenKind::Eq
            | TokenKind::Ne
            | TokenKind::Lt
            | TokenKind::Le
            | TokenKind::Gt
            | TokenKind::Ge => true,
            TokenKind::Keyword(Keyword::Between | Keyword::In | Keyword::Within) => true,
            TokenKind::Keyword(Keyword::Not) => {
                self.peek_kind_at(1) == &TokenKind::Keyword(Keyword::In)
            }
            _ => false,
        }
    }

    fn predicate(&mut self) -> Result<Expression> {
        if self.starts_suffix() {
            let subject = Expression::new(ExprKind::Subject, Span::point(self.peek().span.start));
            return self.suffix(subject);
        }
        let left = self.additive()?;
        if self.starts_suffix() {
            self.suffix(left)
        } else {
            Ok(left)
        }
    }

    fn suffix(&mut self, subject: Expression) -> Result<Expression> {
        let token = self.peek().clone();
        let op = match token.kind {
            TokenKind::Eq => Some(CompareOp::Eq),
            TokenKind::Ne => Some(CompareOp::Ne),
            TokenKind::Lt => Some(CompareOp::Lt),
            TokenKind::Le => Some(CompareOp::Le),
            TokenKind::Gt => Some(CompareOp::Gt),
            TokenKind::Ge => Some(CompareOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.additive()?;
            let span = subject.span.merge(token.span).merge(right.span);
            return Ok(Expression::new(
                ExprKind::Compare {
                    left: Box::new(subject),
                    op,
                    right: Box::new(right),
                },
                span,
            ));
        }

        match token.kind {
            TokenKind::Keyword(Keyword::Between) => {
                self.advance();
                let low = self.additive()?;
                self.expect_keyword(Keyword::And)?;
                let high = self.additive()?;
                let span = subject.span.merge(token.span).merge(high.span);
                Ok(Expression::new(
                    ExprKind::Between {
                        value: Box::new(subject),
                        low: Box::new(low),
                        high: Box::new(high),
                    },
                    span,
                ))
            }
            TokenKind::Keyword(Keyword::Not) | TokenKind::Keyword(Keyword::In) => {
                let negated = self.eat_keyword(Keyword::Not);
                self.expect_keyword(Keyword::In)?;
                self.expect(TokenKind::LParen, "'('")?;
                let mut items = vec![self.list_literal()?];
                while self.peek().kind == TokenKind::Comma {
                    self.advance();
                    items.push(self.list_literal()?);
                }
                let end = self.expect(TokenKind::RParen, "',' or ')'")?.span;
                let span = subject.span.merge(token.span).merge(end);
                Ok(Expression::new(
                    ExprKind::InList {
                        value: Box::new(subject),
                        items,
                        negated,
                    },
                    span,
                ))
            }
            TokenKind::Keyword(Keyword::Within) => {
                self.advance();
                let amount_token = self.advance();
                let amount = match amount_token.kind {
                    TokenKind::Number(n) => n,
                    kind => {
                        return Err(SyntaxError::new(
                            amount_token.span,
                            kind.to_string(),
                            "a tolerance number",
                        ))
                    }
                };
                let tolerance = match self.peek().kind.clone() {
                    TokenKind::Percent => {
                        self.advance();
                        Tolerance::Percent(amount)
                    }
                    TokenKind::Keyword(kw @ (Keyword::Days | Keyword::Weeks)) => {
                        let unit = if kw == Keyword::Days {
                            DateUnit::Days
                        } else {
                            DateUnit::Weeks
                        };
                        self.advance();
                        Tolerance::Days(day_count(amount, unit, amount_token.span)?)
                    }
                    _ => Tolerance::Absolute(amount),
                };
                self.expect_keyword(Keyword::Of)?;
                let reference = self.additive()?;
                let span = subject.span.merge(token.span).merge(reference.span);
                Ok(Expression::new(
                    ExprKind::Within {
                        value: Box::new(subject),
                        reference: Box::new(reference),
                        tolerance,
                    },
                    span,
                ))
            }
            _ => Err(self.error_here("a comparison, 'between', 'in' or 'within'")),
        }
    }

    fn list_literal(&mut self) -> Result<Expression> {
        let token = self.advance();
        let value = match token.kind {
            TokenKind::Number(n) => Value::Number(n),
            TokenKind::Str(s) => Value::String(s),
            TokenKind::Date(d) => Value::Date(d),
            TokenKind::Keyword(Keyword::True) => Value::Bool(true),
            TokenKind::Keyword(Keyword::False) => Value::Bool(false),
            TokenKind::Minus => match self.peek().kind.clone() {
                TokenKind::Number(n) => {
                    let end = self.advance().span;
                    return Ok(Expression::literal(Value::Number(-n), token.span.merge(end)));
                }
                _ => return Err(self.error_here("a number")),
            },
            kind => {
                return Err(SyntaxError::new(token.span, kind.to_string(), "a literal"));
            }
        };
        Ok(Expression::literal(value, token.span))
    }

    fn additive(&mut self) -> Result<Expression> {
        let mark = self.depth;
        let mut left = self.multiplicative()?;
        loop {
            let sign = match self.peek().kind {
                TokenKind::Plus => 1,
                TokenKind::Minus => -1,
                _ => {
                    self.depth = mark;
                    return Ok(left);
                }
            };
            self.descend()?;

            // `+ N days` / `- N weeks`
            if let (TokenKind::Number(n), TokenKind::Keyword(kw @ (Keyword::Days | Keyword::Weeks))) =
                (self.peek_kind_at(1).clone(), self.peek_kind_at(2).clone())
            {
                self.advance();
                let amount_span = self.advance().span;
                let unit_span = self.advance().span;
                let unit = if kw == Keyword::Days {
                    DateUnit::Days
                } else {
                    DateUnit::Weeks
                };
                day_count(n, unit, amount_span)?;
                let amount = sign * whole_number(n, amount_span)?;
                let span = left.span.merge(unit_span);
                left = Expression::new(
                    ExprKind::DateShift {
                        base: Box::new(left),
                        amount,
                        unit,
                    },
                    span,
                );
                continue;
            }

            self.advance();
            let op = if sign > 0 { ArithOp::Add } else { ArithOp::Sub };
            let right = self.multiplicative()?;
            left = Expression::arithmetic(left, op, right);
        }
    }

    fn multiplicative(&mut self) -> Result<Expression> {
        let mark = self.depth;
        let mut left = self.unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => ArithOp::Mul,
                TokenKind::Slash => ArithOp::Div,
                _ => {
                    self.depth = mark;
                    return Ok(left);
                }
            };
            self.descend()?;
            self.advance();
            let right = self.unary()?;
            left = Expression::arithmetic(left, op, right);
        }
    }

    fn unary(&mut self) -> Result<Expression> {
        if self.peek().kind == TokenKind::Minus {
            self.descend()?;
            let start = self.advance().span;
            let inner = self.unary()?;
            self.depth -= 1;
            let span = start.merge(inner.span);
            // Fold negative number literals
            if let ExprKind::Literal(Value::Number(n)) = inner.kind {
                return Ok(Expression::literal(Value::Number(-n), span));
            }
            return Ok(Expression::new(ExprKind::Negate(Box::new(inner)), span));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expression> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expression::literal(Value::Number(n), token.span))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expression::literal(Value::String(s), token.span))
            }
            TokenKind::Date(d) => {
                self.advance();
                Ok(Expression::literal(Value::Date(d), token.span))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Ok(Expression::literal(Value::Bool(true), token.span))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Ok(Expression::literal(Value::Bool(false), token.span))
            }
            TokenKind::Keyword(Keyword::Today) => {
                self.advance();
                Ok(Expression::new(ExprKind::Today, token.span))
            }
            TokenKind::Keyword(Keyword::Required) => {
                self.advance();
                Ok(Expression::new(ExprKind::Required, token.span))
            }
            TokenKind::Keyword(Keyword::If) => self.conditional(),
            TokenKind::LParen => {
                self.advance();
                let inner = self.expr()?;
                let end = self.expect(TokenKind::RParen, "')'")?.span;
                Ok(Expression::new(inner.kind, token.span.merge(end)))
            }
            TokenKind::Ident(name) => {
                self.advance();
                if self.peek().kind != TokenKind::LParen {
                    return Ok(Expression::field(name, token.span));
                }
                if name.eq_ignore_ascii_case("visit") {
                    return self.visit_ref(token.span);
                }
                self.call(name, token.span)
            }
            _ => Err(self.error_here("an expression")),
        }
    }

    /// `visit("baseline").weight`
    fn visit_ref(&mut self, start: Span) -> Result<Expression> {
        self.expect(TokenKind::LParen, "'('")?;
        let visit_token = self.advance();
        let visit = match visit_token.kind {
            TokenKind::Str(s) => s,
            kind => {
                return Err(SyntaxError::new(
                    visit_token.span,
                    kind.to_string(),
                    "a quoted visit name",
                ))
            }
        };
        self.expect(TokenKind::RParen, "')'")?;
        self.expect(TokenKind::Dot, "'.'")?;
        let field_token = self.advance();
        let field = match field_token.kind {
            TokenKind::Ident(name) => name,
            kind => {
                return Err(SyntaxError::new(
                    field_token.span,
                    kind.to_string(),
                    "a field name",
                ))
            }
        };
        Ok(Expression::new(
            ExprKind::VisitRef { visit, field },
            start.merge(field_token.span),
        ))
    }

    fn call(&mut self, name: String, start: Span) -> Result<Expression> {
        self.expect(TokenKind::LParen, "'('")?;
        let mut args = Vec::new();
        if self.peek().kind != TokenKind::RParen {
            args.push(self.expr()?);
            while self.peek().kind == TokenKind::Comma {
                self.advance();
                args.push(self.expr()?);
            }
        }
        let end = self.expect(TokenKind::RParen, "',' or ')'")?.span;
        let span = start.merge(end);

        // `mean(field)` / `sd(field)` are population aggregates
        if let Some(func) = AggregateFn::from_name(&name) {
            if let [Expression {
                kind: ExprKind::Field(field),
                ..
            }] = args.as_slice()
            {
                return Ok(Expression::new(
                    ExprKind::Aggregate {
                        func,
                        field: field.clone(),
                    },
                    span,
                ));
            }
        }

        Ok(Expression::new(ExprKind::Call { name, args }, span))
    }

    fn conditional(&mut self) -> Result<Expression> {
        let start = self.expect_keyword(Keyword::If)?.span;
        let condition = self.expr()?;
        self.expect_keyword(Keyword::Then)?;
        let then_branch = self.expr()?;

        // Collect elif arms, then fold them right-to-left into nested
        // conditionals
        let mark = self.depth;
        let mut arms = vec![(start, condition, then_branch)];
        while self.at_keyword(Keyword::Elif) {
            self.descend()?;
            let elif_span = self.advance().span;
            let cond = self.expr()?;
            self.expect_keyword(Keyword::Then)?;
            let branch = self.expr()?;
            arms.push((elif_span, cond, branch));
        }

        let mut else_branch = if self.eat_keyword(Keyword::Else) {
            Some(Box::new(self.expr()?))
        } else {
            None
        };
        let end = self.expect_keyword(Keyword::Endif)?.span;
        self.depth = mark;

        while let Some((arm_start, cond, branch)) = arms.pop() {
            let node = Expression::new(
                ExprKind::Conditional {
                    condition: Box::new(cond),
                    then_branch: Box::new(branch),
                    else_branch,
                },
                arm_start.merge(end),
            );
            else_branch = Some(Box::new(node));
        }

        match else_branch {
            Some(node) => Ok(*node),
            None => Err(SyntaxError::new(start, "'if'", "a conditional")),
        }
    }
}

/// Day and week counts must be whole numbers
fn whole_number(n: f64, span: Span) -> Result<i64> {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Ok(n as i64)
    } else {
        Err(SyntaxError::new(
            span,
            format!("number {}", Value::Number(n)),
            "a whole number",
        ))
    }
}

/// Whole-number day window or shift that stays inside the calendar
fn day_count(n: f64, unit: DateUnit, span: Span) -> Result<i64> {
    unit.to_days(whole_number(n, span)?).ok_or_else(|| {
        SyntaxError::new(
            span,
            format!("number {}", Value::Number(n)),
            format!("at most {} days", MAX_DAY_SPAN),
        )
    })
}
