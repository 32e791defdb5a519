//! Minimal arithmetic/comparison evaluator backing the integration tests.
//!
//! The engine treats expression evaluation as an external concern; this
//! implementation covers just enough grammar for realistic aspect formulas:
//! numbers, booleans, identifiers, unary minus, `* /`, `+ -`, comparisons,
//! parentheses and a `sum(column)` row aggregate. Identifiers resolve against
//! the scope, with unset names reading as zero.

use aspect_engine::{ExprError, ExprEvaluator, Scope};
use aspect_model::Value;
use std::collections::BTreeSet;

pub struct TestEvaluator;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    Ne,
}

fn tokenize(text: &str) -> Result<Vec<Token>, ExprError> {
    let err = |message: String| ExprError::Parse {
        text: text.to_string(),
        message,
    };
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '<' | '>' | '=' | '!' => {
                let two = chars.get(i + 1) == Some(&'=');
                let token = match (c, two) {
                    ('<', true) => Token::Le,
                    ('<', false) => Token::Lt,
                    ('>', true) => Token::Ge,
                    ('>', false) => Token::Gt,
                    ('=', true) => Token::EqEq,
                    ('!', true) => Token::Ne,
                    _ => return Err(err(format!("unexpected character '{c}'"))),
                };
                i += if two { 2 } else { 1 };
                tokens.push(token);
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let number = literal
                    .parse::<f64>()
                    .map_err(|e| err(format!("bad number '{literal}': {e}")))?;
                tokens.push(Token::Number(number));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => return Err(err(format!("unexpected character '{c}'"))),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    text: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    scope: &'a Scope,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> ExprError {
        ExprError::Eval {
            text: self.text.to_string(),
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expression(&mut self) -> Result<Value, ExprError> {
        let left = self.additive()?;
        let op = match self.peek() {
            Some(Token::Lt | Token::Gt | Token::Le | Token::Ge | Token::EqEq | Token::Ne) => {
                self.next().unwrap()
            }
            _ => return Ok(left),
        };
        let right = self.additive()?;
        if matches!(op, Token::EqEq | Token::Ne) {
            let equal = match (left.as_number(), right.as_number()) {
                (Some(l), Some(r)) => l == r,
                _ => left == right,
            };
            return Ok(Value::Bool(if matches!(op, Token::EqEq) { equal } else { !equal }));
        }
        let l = numeric(&left);
        let r = numeric(&right);
        let result = match op {
            Token::Lt => l < r,
            Token::Gt => l > r,
            Token::Le => l <= r,
            Token::Ge => l >= r,
            _ => unreachable!(),
        };
        Ok(Value::Bool(result))
    }

    fn additive(&mut self) -> Result<Value, ExprError> {
        let mut value = numeric(&self.term()?);
        while let Some(op @ (Token::Plus | Token::Minus)) = self.peek().cloned() {
            self.pos += 1;
            let rhs = numeric(&self.term()?);
            value = match op {
                Token::Plus => value + rhs,
                _ => value - rhs,
            };
        }
        Ok(Value::Number(value))
    }

    fn term(&mut self) -> Result<Value, ExprError> {
        let mut value = numeric(&self.factor()?);
        while let Some(op @ (Token::Star | Token::Slash)) = self.peek().cloned() {
            self.pos += 1;
            let rhs = numeric(&self.factor()?);
            value = match op {
                Token::Star => value * rhs,
                _ => {
                    if rhs == 0.0 {
                        return Err(self.error("division by zero"));
                    }
                    value / rhs
                }
            };
        }
        Ok(Value::Number(value))
    }

    fn factor(&mut self) -> Result<Value, ExprError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Value::Number(n)),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let column = match self.next() {
                        Some(Token::Ident(column)) => column,
                        _ => return Err(self.error("expected a column name")),
                    };
                    match self.next() {
                        Some(Token::RParen) => {}
                        _ => return Err(self.error("missing closing parenthesis")),
                    }
                    return self.call(&name, &column);
                }
                Ok(match name.as_str() {
                    "true" => Value::Bool(true),
                    "false" => Value::Bool(false),
                    _ => self.scope.value_or_empty(&name),
                })
            }
            Some(Token::Minus) => Ok(Value::Number(-numeric(&self.factor()?))),
            Some(Token::LParen) => {
                let value = self.expression()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(self.error("missing closing parenthesis")),
                }
            }
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }

    /// `sum(collection_property)` totals one column across a collection's
    /// rows. The argument is the column's composed template name.
    fn call(&self, func: &str, column: &str) -> Result<Value, ExprError> {
        if func != "sum" {
            return Err(self.error(format!("unknown function '{func}'")));
        }
        for (name, value) in self.scope.iter() {
            if let Value::Rows(rows) = value {
                if let Some(short) = column.strip_prefix(&format!("{name}_")) {
                    let total: f64 = rows
                        .values()
                        .filter_map(|row| row.get(short))
                        .filter_map(|v| v.as_number())
                        .sum();
                    return Ok(Value::Number(total));
                }
            }
        }
        Ok(Value::Number(0.0))
    }
}

fn numeric(value: &Value) -> f64 {
    value.as_number().unwrap_or(0.0)
}

impl ExprEvaluator for TestEvaluator {
    fn evaluate(&self, text: &str, scope: &Scope) -> Result<Value, ExprError> {
        let tokens = tokenize(text)?;
        let mut parser = Parser {
            text,
            tokens,
            pos: 0,
            scope,
        };
        let value = parser.expression()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("trailing input"));
        }
        Ok(value)
    }

    fn referenced_names(&self, text: &str) -> Result<BTreeSet<String>, ExprError> {
        let tokens = tokenize(text)?;
        let mut names = BTreeSet::new();
        for (i, token) in tokens.iter().enumerate() {
            if let Token::Ident(name) = token {
                if name == "true" || name == "false" {
                    continue;
                }
                // A name followed by '(' is a function, not a member.
                if tokens.get(i + 1) == Some(&Token::LParen) {
                    continue;
                }
                names.insert(name.clone());
            }
        }
        Ok(names)
    }
}
