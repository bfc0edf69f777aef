//! Boolean result expressions over selection flags
//!
//! Grammar (whitespace is ignored):
//!
//! ```text
//! expr    := and ( ('|' | '||') and )*
//! and     := unary ( ('.' | '&' | '&&') unary )*
//! unary   := '!' unary | primary
//! primary := '(' expr ')' | flag
//! flag    := [A-Za-z0-9_]+
//! ```

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Flag(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn parse(text: &str) -> Result<Self> {
        let mut parser = Parser {
            text,
            chars: text.chars().filter(|c| !c.is_whitespace()).collect(),
            pos: 0,
        };
        let expr = parser.or()?;
        if parser.pos != parser.chars.len() {
            return Err(parser.error(format!(
                "unexpected '{}' at offset {}",
                parser.chars[parser.pos], parser.pos
            )));
        }
        Ok(expr)
    }

    /// Evaluate with `lookup` answering each flag. Unknown flags should be
    /// answered with `false`.
    pub fn eval(&self, lookup: &dyn Fn(&str) -> bool) -> bool {
        match self {
            Self::Flag(name) => lookup(name),
            Self::Not(inner) => !inner.eval(lookup),
            Self::And(a, b) => a.eval(lookup) && b.eval(lookup),
            Self::Or(a, b) => a.eval(lookup) || b.eval(lookup),
        }
    }
}

struct Parser<'a> {
    text: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, message: String) -> Error {
        Error::InvalidExpression {
            expression: self.text.to_string(),
            message,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or(&mut self) -> Result<Expr> {
        let mut left = self.and()?;
        while self.eat('|') {
            self.eat('|');
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        while self.eat('.') || self.eat('&') {
            if self.chars.get(self.pos.wrapping_sub(1)) == Some(&'&') {
                self.eat('&');
            }
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat('!') {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr> {
        if self.eat('(') {
            let inner = self.or()?;
            if !self.eat(')') {
                return Err(self.error("missing ')'".into()));
            }
            return Ok(inner);
        }

        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(match self.peek() {
                Some(c) => self.error(format!("expected a flag name, found '{c}'")),
                None => self.error("expression ends early".into()),
            });
        }
        Ok(Expr::Flag(self.chars[start..self.pos].iter().collect()))
    }
}
