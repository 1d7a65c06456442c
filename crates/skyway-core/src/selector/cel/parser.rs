//! Recursive-descent parser producing the CEL expression tree.
//!
//! Precedence, loosest first: `?:`, `||`, `&&`, relations
//! (`== != < <= > >= in`), `+ -`, `* / %`, unary `! -`, then member
//! access, indexing and calls.

use regex::Regex;

use super::super::SelectorError;
use super::eval::CelValue;
use super::lexer::{tokenize, Spanned, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Quantifier {
    Exists,
    All,
    ExistsOne,
}

#[derive(Debug, Clone)]
pub(crate) enum Expr {
    Literal(CelValue),
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call {
        target: Option<Box<Expr>>,
        function: String,
        args: Vec<Expr>,
    },
    /// `s.matches('literal')` with the pattern compiled once.
    Matches(Box<Expr>, Regex),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    /// `has(a.b)`.
    Has(Box<Expr>, String),
    /// `range.exists(x, pred)` and friends.
    Quantified {
        quantifier: Quantifier,
        range: Box<Expr>,
        var: String,
        predicate: Box<Expr>,
    },
}

pub(crate) fn parse(source: &str) -> Result<Expr, SelectorError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(SelectorError::Compile("empty expression".to_string()));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: source.len(),
    };
    let expr = parser.expr()?;
    if let Some(extra) = parser.tokens.get(parser.pos) {
        return Err(SelectorError::Compile(format!(
            "unexpected {:?} at offset {}",
            extra.token, extra.offset
        )));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |s| s.offset)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), SelectorError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {expected:?}")))
        }
    }

    fn error(&self, msg: &str) -> SelectorError {
        match self.peek() {
            Some(found) => SelectorError::Compile(format!(
                "{msg}, found {found:?} at offset {}",
                self.offset()
            )),
            None => SelectorError::Compile(format!("{msg} at end of input")),
        }
    }

    fn expr(&mut self) -> Result<Expr, SelectorError> {
        let cond = self.or()?;
        if self.eat(&Token::Question) {
            let then = self.or()?;
            self.expect(Token::Colon)?;
            let otherwise = self.expr()?;
            return Ok(Expr::Ternary(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        Ok(cond)
    }

    fn or(&mut self) -> Result<Expr, SelectorError> {
        let mut lhs = self.and()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, SelectorError> {
        let mut lhs = self.relation()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.relation()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn relation(&mut self) -> Result<Expr, SelectorError> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::Ne,
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                Some(Token::In) => BinaryOp::In,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn additive(&mut self) -> Result<Expr, SelectorError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, SelectorError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, SelectorError> {
        if self.eat(&Token::Bang) {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)));
        }
        if self.eat(&Token::Minus) {
            // Fold negated numeric literals.
            return Ok(match self.unary()? {
                Expr::Literal(CelValue::Int(i)) => Expr::Literal(CelValue::Int(-i)),
                Expr::Literal(CelValue::Double(d)) => Expr::Literal(CelValue::Double(-d)),
                other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, SelectorError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = self.ident()?;
                if self.eat(&Token::LParen) {
                    let args = self.args(Token::RParen)?;
                    expr = self.method(expr, name, args)?;
                } else {
                    expr = Expr::Member(Box::new(expr), name);
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.expr()?;
                self.expect(Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn method(&self, target: Expr, name: String, args: Vec<Expr>) -> Result<Expr, SelectorError> {
        let quantifier = match name.as_str() {
            "exists" => Some(Quantifier::Exists),
            "all" => Some(Quantifier::All),
            "exists_one" => Some(Quantifier::ExistsOne),
            _ => None,
        };
        if let Some(quantifier) = quantifier {
            let mut args = args.into_iter();
            return match (args.next(), args.next(), args.next()) {
                (Some(Expr::Ident(var)), Some(predicate), None) => Ok(Expr::Quantified {
                    quantifier,
                    range: Box::new(target),
                    var,
                    predicate: Box::new(predicate),
                }),
                _ => Err(SelectorError::Compile(format!(
                    "{name}() expects an identifier and a predicate"
                ))),
            };
        }
        if name == "matches" {
            if let [Expr::Literal(CelValue::String(pattern))] = args.as_slice() {
                let re = Regex::new(pattern).map_err(|e| {
                    SelectorError::Compile(format!("invalid regex {pattern:?}: {e}"))
                })?;
                return Ok(Expr::Matches(Box::new(target), re));
            }
        }
        Ok(Expr::Call {
            target: Some(Box::new(target)),
            function: name,
            args,
        })
    }

    fn ident(&mut self) -> Result<String, SelectorError> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error("expected identifier")),
        }
    }

    fn args(&mut self, close: Token) -> Result<Vec<Expr>, SelectorError> {
        let mut args = Vec::new();
        if self.eat(&close) {
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            if self.eat(&close) {
                return Ok(args);
            }
            self.expect(Token::Comma)?;
            // Trailing comma.
            if self.eat(&close) {
                return Ok(args);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, SelectorError> {
        let Some(spanned) = self.tokens.get(self.pos).cloned() else {
            return Err(self.error("expected expression"));
        };
        self.pos += 1;
        match spanned.token {
            Token::Int(i) => Ok(Expr::Literal(CelValue::Int(i))),
            Token::UInt(u) => Ok(Expr::Literal(CelValue::UInt(u))),
            Token::Double(d) => Ok(Expr::Literal(CelValue::Double(d))),
            Token::Str(s) => Ok(Expr::Literal(CelValue::String(s))),
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => Ok(Expr::List(self.args(Token::RBracket)?)),
            Token::LBrace => {
                let mut entries = Vec::new();
                if self.eat(&Token::RBrace) {
                    return Ok(Expr::Map(entries));
                }
                loop {
                    let key = self.expr()?;
                    self.expect(Token::Colon)?;
                    let value = self.expr()?;
                    entries.push((key, value));
                    if self.eat(&Token::RBrace) {
                        return Ok(Expr::Map(entries));
                    }
                    self.expect(Token::Comma)?;
                }
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(CelValue::Bool(true))),
                "false" => Ok(Expr::Literal(CelValue::Bool(false))),
                "null" => Ok(Expr::Literal(CelValue::Null)),
                _ if self.eat(&Token::LParen) => {
                    let args = self.args(Token::RParen)?;
                    if name == "has" {
                        return match args.as_slice() {
                            [Expr::Member(target, field)] => {
                                Ok(Expr::Has(target.clone(), field.clone()))
                            }
                            _ => Err(SelectorError::Compile(
                                "has() expects a field selection like has(a.b)".to_string(),
                            )),
                        };
                    }
                    Ok(Expr::Call {
                        target: None,
                        function: name,
                        args,
                    })
                }
                _ => Ok(Expr::Ident(name)),
            },
            other => {
                self.pos -= 1;
                Err(self.error(&format!("unexpected {other:?}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence() {
        let expr = parse("a || b && c == 1").unwrap();
        match expr {
            Expr::Or(lhs, rhs) => {
                assert!(matches!(*lhs, Expr::Ident(ref n) if n == "a"));
                assert!(matches!(*rhs, Expr::And(_, _)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn literal_matches_is_precompiled() {
        assert!(matches!(
            parse("resource.name.matches('^web-')").unwrap(),
            Expr::Matches(_, _)
        ));
        assert!(matches!(
            parse("resource.name.matches(pattern)").unwrap(),
            Expr::Call { .. }
        ));
        assert!(parse("resource.name.matches('(')").is_err());
    }

    #[test]
    fn macros() {
        assert!(matches!(parse("has(resource.metadata.env)").unwrap(), Expr::Has(_, _)));
        assert!(matches!(
            parse("[1, 2].exists(x, x > 1)").unwrap(),
            Expr::Quantified { quantifier: Quantifier::Exists, .. }
        ));
        assert!(parse("has(resource)").is_err());
        assert!(parse("[1].all(1, true)").is_err());
    }

    #[test]
    fn syntax_errors() {
        for src in ["", "a ==", "(a", "a b", "a ? b", "{'a' 1}", "a.", "a[1"] {
            assert!(parse(src).is_err(), "{src:?} should not parse");
        }
    }
}
