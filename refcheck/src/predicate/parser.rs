//! Precedence-climbing parser for annotation text

use crate::ast::{Span, Spanned};
use crate::contract::LoadError;
use crate::lexer::{tokenize, Token};

use super::{Pred, PredBinOp, PredExpr, PredUnOp};

/// Parse a refinement predicate
pub fn parse_predicate(source: &str) -> Result<Pred, LoadError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(source, tokens);
    let expr = parser.parse_expr()?;
    parser.expect_end()?;
    Ok(expr)
}

/// A parsed alias definition `Name(type p, ...) { body }`
#[derive(Debug, Clone, PartialEq)]
pub struct AliasDef {
    pub name: String,
    pub params: Vec<(String, String)>,
    pub body: Pred,
}

/// Parse an alias definition
pub fn parse_alias(source: &str) -> Result<AliasDef, LoadError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(source, tokens);
    let name = parser.expect_ident("alias name")?;
    parser.expect(Token::LParen, "`(` after alias name")?;
    let mut params = Vec::new();
    if !parser.eat(&Token::RParen) {
        loop {
            let ty = parser.expect_ident("parameter type")?;
            let param = parser.expect_ident("parameter name")?;
            params.push((ty, param));
            if parser.eat(&Token::Comma) {
                continue;
            }
            parser.expect(Token::RParen, "`)` after alias parameters")?;
            break;
        }
    }
    parser.expect(Token::LBrace, "`{` before alias body")?;
    let body = parser.parse_expr()?;
    parser.expect(Token::RBrace, "`}` after alias body")?;
    parser.expect_end()?;
    Ok(AliasDef { name, params, body })
}

struct Parser<'s> {
    source: &'s str,
    tokens: Vec<(Token, Span)>,
    pos: usize,
}

impl<'s> Parser<'s> {
    fn new(source: &'s str, tokens: Vec<(Token, Span)>) -> Self {
        Self {
            source,
            tokens,
            pos: 0,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn span_here(&self) -> Span {
        match self.tokens.get(self.pos) {
            Some((_, span)) => *span,
            None => Span::new(self.source.len(), self.source.len()),
        }
    }

    fn bump(&mut self) -> Option<(Token, Span)> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> LoadError {
        LoadError::malformed(self.source, message, self.span_here())
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<Span, LoadError> {
        let span = self.span_here();
        if self.eat(&token) {
            Ok(span)
        } else {
            Err(self.error(format!("expected {what}, found {}", self.describe_current())))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, LoadError> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error(format!("expected {what}, found {}", self.describe_current()))),
        }
    }

    fn expect_end(&self) -> Result<(), LoadError> {
        match self.peek() {
            None => Ok(()),
            Some(tok) => Err(self.error(format!("unexpected `{tok}` after predicate"))),
        }
    }

    fn describe_current(&self) -> String {
        match self.peek() {
            Some(tok) => format!("`{tok}`"),
            None => "end of annotation".to_string(),
        }
    }

    fn parse_expr(&mut self) -> Result<Pred, LoadError> {
        stacker::maybe_grow(crate::STACK_RED_ZONE, crate::STACK_GROW_SIZE, || self.parse_ternary())
    }

    /// `cond ? a : b`, right-associative, lowest precedence
    fn parse_ternary(&mut self) -> Result<Pred, LoadError> {
        let cond = self.parse_binary(1)?;
        if !self.eat(&Token::Question) {
            return Ok(cond);
        }
        let then_branch = self.parse_expr()?;
        self.expect(Token::Colon, "`:` in conditional")?;
        let else_branch = self.parse_expr()?;
        let span = cond.span.merge(else_branch.span);
        Ok(Spanned::new(
            PredExpr::Ite {
                cond: Box::new(cond),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            },
            span,
        ))
    }

    fn current_binop(&self) -> Option<PredBinOp> {
        let op = match self.peek()? {
            Token::Implies => PredBinOp::Implies,
            Token::PipePipe => PredBinOp::Or,
            Token::AmpAmp => PredBinOp::And,
            Token::EqEq => PredBinOp::Eq,
            Token::NotEq => PredBinOp::Ne,
            Token::Lt => PredBinOp::Lt,
            Token::LtEq => PredBinOp::Le,
            Token::Gt => PredBinOp::Gt,
            Token::GtEq => PredBinOp::Ge,
            Token::Plus => PredBinOp::Add,
            Token::Minus => PredBinOp::Sub,
            Token::Star => PredBinOp::Mul,
            Token::Slash => PredBinOp::Div,
            Token::Percent => PredBinOp::Rem,
            _ => return None,
        };
        Some(op)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Pred, LoadError> {
        let mut lhs = self.parse_unary()?;
        while let Some(op) = self.current_binop() {
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            // Implication is right-associative
            let next_min = if op == PredBinOp::Implies { prec } else { prec + 1 };
            let rhs = stacker::maybe_grow(crate::STACK_RED_ZONE, crate::STACK_GROW_SIZE, || self.parse_binary(next_min))?;
            let span = lhs.span.merge(rhs.span);
            lhs = Spanned::new(
                PredExpr::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span,
            );
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Pred, LoadError> {
        let start = self.span_here();
        let op = match self.peek() {
            Some(Token::Bang) => PredUnOp::Not,
            Some(Token::Minus) => PredUnOp::Neg,
            _ => return self.parse_primary(),
        };
        self.pos += 1;
        let operand = stacker::maybe_grow(crate::STACK_RED_ZONE, crate::STACK_GROW_SIZE, || self.parse_unary())?;
        // Fold negative literals so `-1` stays a constant
        if op == PredUnOp::Neg
            && let PredExpr::Int(n) = operand.node
        {
            return Ok(Spanned::new(PredExpr::Int(-n), start.merge(operand.span)));
        }
        let span = start.merge(operand.span);
        Ok(Spanned::new(
            PredExpr::Unary {
                op,
                operand: Box::new(operand),
            },
            span,
        ))
    }

    fn parse_primary(&mut self) -> Result<Pred, LoadError> {
        let Some((token, span)) = self.bump() else {
            return Err(self.error("unexpected end of annotation"));
        };
        let expr = match token {
            Token::True => PredExpr::Bool(true),
            Token::False => PredExpr::Bool(false),
            Token::IntLit(n) => PredExpr::Int(n),
            Token::RealLit(text) => PredExpr::Real(text),
            Token::Underscore => PredExpr::Value,
            Token::This => PredExpr::This,
            Token::Positional(i) => PredExpr::Positional(i),
            Token::Old => {
                self.expect(Token::LParen, "`(` after `old`")?;
                let inner = self.parse_expr()?;
                let end = self.expect(Token::RParen, "`)` closing `old(`")?;
                return Ok(Spanned::new(PredExpr::Old(Box::new(inner)), span.merge(end)));
            }
            Token::Ident(name) => {
                if !self.eat(&Token::LParen) {
                    return Ok(Spanned::new(PredExpr::Var(name), span));
                }
                let mut args = Vec::new();
                let end = if let Some(end) = self.eat_span(&Token::RParen) {
                    end
                } else {
                    loop {
                        args.push(self.parse_expr()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        break self.expect(Token::RParen, "`)` closing argument list")?;
                    }
                };
                return Ok(Spanned::new(PredExpr::App { name, args }, span.merge(end)));
            }
            Token::LParen => {
                let inner = self.parse_expr()?;
                let end = self.expect(Token::RParen, "`)`")?;
                return Ok(Spanned::new(inner.node, span.merge(end)));
            }
            other => {
                return Err(LoadError::malformed(
                    self.source,
                    format!("expected an expression, found `{other}`"),
                    span,
                ));
            }
        };
        Ok(Spanned::new(expr, span))
    }

    fn eat_span(&mut self, token: &Token) -> Option<Span> {
        let span = self.span_here();
        self.eat(token).then_some(span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state_atom() {
        let p = parse_predicate("off(this)").unwrap();
        match p.node {
            PredExpr::App { name, args } => {
                assert_eq!(name, "off");
                assert_eq!(args[0].node, PredExpr::This);
            }
            other => panic!("expected application, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_precedence() {
        let p = parse_predicate("0 <= _ && _ < size(this)").unwrap();
        match p.node {
            PredExpr::Binary { op: PredBinOp::And, lhs, rhs } => {
                assert!(matches!(lhs.node, PredExpr::Binary { op: PredBinOp::Le, .. }));
                assert!(matches!(rhs.node, PredExpr::Binary { op: PredBinOp::Lt, .. }));
            }
            other => panic!("expected conjunction, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_ternary() {
        let p = parse_predicate("arg0 >= 0 ? _ == arg0 : _ == -arg0").unwrap();
        assert!(matches!(p.node, PredExpr::Ite { .. }));
    }

    #[test]
    fn test_parse_negative_literal_folds() {
        let p = parse_predicate("-5").unwrap();
        assert_eq!(p.node, PredExpr::Int(-5));
    }

    #[test]
    fn test_parse_old() {
        let p = parse_predicate("size(old(this))").unwrap();
        match p.node {
            PredExpr::App { args, .. } => assert!(matches!(args[0].node, PredExpr::Old(_))),
            other => panic!("expected application, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_spans_cover_operands() {
        let p = parse_predicate("a + bc").unwrap();
        assert_eq!(p.span, Span::new(0, 6));
    }

    #[test]
    fn test_parse_error_on_dangling_operator() {
        let err = parse_predicate("x >").unwrap_err();
        assert!(err.to_string().contains("unexpected end of annotation"));
    }

    #[test]
    fn test_parse_error_on_trailing_tokens() {
        let err = parse_predicate("x > 0 y").unwrap_err();
        assert!(err.to_string().contains("unexpected `y`"));
    }

    #[test]
    fn test_parse_alias() {
        let alias = parse_alias("Percent(int x) { 0 <= x && x <= 100 }").unwrap();
        assert_eq!(alias.name, "Percent");
        assert_eq!(alias.params, vec![("int".to_string(), "x".to_string())]);
        assert!(matches!(alias.body.node, PredExpr::Binary { op: PredBinOp::And, .. }));
    }

    #[test]
    fn test_parse_alias_without_params() {
        let alias = parse_alias("Always() { true }").unwrap();
        assert!(alias.params.is_empty());
        assert_eq!(alias.body.node, PredExpr::Bool(true));
    }

    #[test]
    fn test_parse_alias_missing_body() {
        assert!(parse_alias("Percent(int x)").is_err());
    }

    #[test]
    fn test_deeply_nested_parens() {
        let text = format!("{}1{}", "(".repeat(2000), ")".repeat(2000));
        let p = parse_predicate(&text).unwrap();
        assert_eq!(p.node, PredExpr::Int(1));
    }
}
