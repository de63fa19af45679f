//! Constraint expressions over entity labels.
//!
//! # Grammar
//! ```text
//! expr    := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | primary
//! primary := "(" expr ")" | Label("key", "value") | LabelRegex("key", "regex")
//! ```
//!
//! # Design Decisions
//! - An empty expression matches every entity
//! - Regexes are compiled once, at parse time, and must match the whole value
//! - Strings are double-quoted or backquoted

use std::collections::HashMap;

use regex::Regex;
use thiserror::Error;

/// Errors raised while parsing a constraint expression.
#[derive(Debug, Error)]
pub enum ConstraintError {
    #[error("constraint parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("invalid regex {pattern:?} in constraint: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("unknown constraint function {0:?}")]
    UnknownFunction(String),
}

#[derive(Debug, Clone)]
enum Expr {
    Label { key: String, value: String },
    LabelRegex { key: String, regex: Regex },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, labels: &HashMap<String, String>) -> bool {
        match self {
            Expr::Label { key, value } => labels.get(key).is_some_and(|v| v == value),
            Expr::LabelRegex { key, regex } => labels.get(key).is_some_and(|v| regex.is_match(v)),
            Expr::Not(inner) => !inner.eval(labels),
            Expr::And(lhs, rhs) => lhs.eval(labels) && rhs.eval(labels),
            Expr::Or(lhs, rhs) => lhs.eval(labels) || rhs.eval(labels),
        }
    }
}

/// A parsed constraint expression.
#[derive(Debug, Clone, Default)]
pub struct Constraint {
    expr: Option<Expr>,
}

impl Constraint {
    pub fn parse(source: &str) -> Result<Self, ConstraintError> {
        if source.trim().is_empty() {
            return Ok(Self::default());
        }

        let mut parser = Parser { src: source, pos: 0 };
        let expr = parser.expr()?;
        parser.skip_ws();
        if parser.pos != source.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self { expr: Some(expr) })
    }

    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.expr.as_ref().map_or(true, |expr| expr.eval(labels))
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn error(&self, message: impl Into<String>) -> ConstraintError {
        ConstraintError::Parse {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> Result<(), ConstraintError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {token:?}")))
        }
    }

    fn expr(&mut self) -> Result<Expr, ConstraintError> {
        let mut lhs = self.and()?;
        while self.eat("||") {
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ConstraintError> {
        let mut lhs = self.unary()?;
        while self.eat("&&") {
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ConstraintError> {
        if self.eat("!") {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.eat("(") {
            let inner = self.expr()?;
            self.expect(")")?;
            return Ok(inner);
        }
        self.call()
    }

    fn call(&mut self) -> Result<Expr, ConstraintError> {
        self.skip_ws();
        let name_len = self
            .rest()
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(self.rest().len());
        if name_len == 0 {
            return Err(self.error("expected a function name"));
        }
        let name = &self.rest()[..name_len];
        self.pos += name_len;

        self.expect("(")?;
        let key = self.string()?;
        self.expect(",")?;
        let value = self.string()?;
        self.expect(")")?;

        match name {
            "Label" => Ok(Expr::Label { key, value }),
            "LabelRegex" => {
                let regex = Regex::new(&format!("^(?:{value})$")).map_err(|source| {
                    ConstraintError::Regex {
                        pattern: value.clone(),
                        source,
                    }
                })?;
                Ok(Expr::LabelRegex { key, regex })
            }
            other => Err(ConstraintError::UnknownFunction(other.to_string())),
        }
    }

    fn string(&mut self) -> Result<String, ConstraintError> {
        self.skip_ws();
        let quote = match self.rest().chars().next() {
            Some(q @ ('"' | '`')) => q,
            _ => return Err(self.error("expected a quoted string")),
        };
        self.pos += 1;

        let mut out = String::new();
        let mut chars = self.rest().char_indices();
        while let Some((offset, c)) = chars.next() {
            match c {
                '\\' if quote == '"' => {
                    if let Some((_, escaped)) = chars.next() {
                        out.push(escaped);
                    }
                }
                c if c == quote => {
                    self.pos += offset + 1;
                    return Ok(out);
                }
                c => out.push(c),
            }
        }
        Err(self.error("unterminated string"))
    }
}
