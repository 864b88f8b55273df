//! Parser and evaluator for the backend's textual filter grammar.
//!
//! ```text
//! expr       := and_expr ("or" and_expr)*
//! and_expr   := unary ("and" unary)*
//! unary      := "not" unary | "(" expr ")" | comparison
//! comparison := operand ("eq" | "ne" | "gt" | "ge" | "lt" | "le") operand
//! operand    := identifier | literal
//! ```
//!
//! Comparisons are strictly typed: operands of different types, or a
//! property the entity does not carry, never match.

use super::{BackendError, BackendResult};
use crate::model::{Entity, Value};
use std::cmp::Ordering;
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl ComparisonOp {
    pub fn token(self) -> &'static str {
        match self {
            ComparisonOp::Eq => "eq",
            ComparisonOp::Ne => "ne",
            ComparisonOp::Gt => "gt",
            ComparisonOp::Ge => "ge",
            ComparisonOp::Lt => "lt",
            ComparisonOp::Le => "le",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "eq" => ComparisonOp::Eq,
            "ne" => ComparisonOp::Ne,
            "gt" => ComparisonOp::Gt,
            "ge" => ComparisonOp::Ge,
            "lt" => ComparisonOp::Lt,
            "le" => ComparisonOp::Le,
            _ => return None,
        })
    }

    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            ComparisonOp::Eq => ordering == Ordering::Equal,
            ComparisonOp::Ne => ordering != Ordering::Equal,
            ComparisonOp::Gt => ordering == Ordering::Greater,
            ComparisonOp::Ge => ordering != Ordering::Less,
            ComparisonOp::Lt => ordering == Ordering::Less,
            ComparisonOp::Le => ordering != Ordering::Greater,
        }
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Compare two typed values the way the backend does.
pub fn compare_values(op: ComparisonOp, left: &Value, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Int32(a), Value::Int32(b)) => a.cmp(b),
        (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
        (Value::Double(a), Value::Double(b)) => match a.partial_cmp(b) {
            Some(ordering) => ordering,
            None => return false,
        },
        (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
        (Value::Guid(a), Value::Guid(b)) => a.cmp(b),
        (Value::Binary(a), Value::Binary(b)) => a.cmp(b),
        _ => return false,
    };
    op.accepts(ordering)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Property(String),
    Literal(Value),
}

impl Operand {
    fn resolve<'a>(&'a self, entity: &'a Entity) -> Option<std::borrow::Cow<'a, Value>> {
        match self {
            Operand::Property(name) => entity.property(name),
            Operand::Literal(value) => Some(std::borrow::Cow::Borrowed(value)),
        }
    }
}

/// Parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    Compare {
        left: Operand,
        op: ComparisonOp,
        right: Operand,
    },
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
}

impl FilterExpr {
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            FilterExpr::Compare { left, op, right } => {
                match (left.resolve(entity), right.resolve(entity)) {
                    (Some(l), Some(r)) => compare_values(*op, &l, &r),
                    _ => false,
                }
            }
            FilterExpr::And(l, r) => l.matches(entity) && r.matches(entity),
            FilterExpr::Or(l, r) => l.matches(entity) || r.matches(entity),
            FilterExpr::Not(inner) => !inner.matches(entity),
        }
    }
}

pub fn parse_filter(input: &str) -> BackendResult<FilterExpr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(invalid(format!(
            "unexpected trailing input at token {}",
            parser.pos
        )));
    }
    Ok(expr)
}

fn invalid(message: impl Into<String>) -> BackendError {
    BackendError::InvalidFilter(message.into())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Word(String),
    Literal(Value),
}

fn tokenize(input: &str) -> BackendResult<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '(' {
            tokens.push(Token::LParen);
            i += 1;
        } else if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
        } else if c == '\'' {
            let (text, next) = read_quoted(&chars, i)?;
            tokens.push(Token::Literal(Value::String(text)));
            i = next;
        } else if c == '-' || c.is_ascii_digit() {
            let (value, next) = read_number(&chars, i)?;
            tokens.push(Token::Literal(value));
            i = next;
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            if i < chars.len() && chars[i] == '\'' {
                let (text, next) = read_quoted(&chars, i)?;
                tokens.push(Token::Literal(typed_literal(&word, &text)?));
                i = next;
            } else {
                match word.as_str() {
                    "true" => tokens.push(Token::Literal(Value::Bool(true))),
                    "false" => tokens.push(Token::Literal(Value::Bool(false))),
                    _ => tokens.push(Token::Word(word)),
                }
            }
        } else {
            return Err(invalid(format!("unexpected character {c:?} at {i}")));
        }
    }
    Ok(tokens)
}

/// Read a `'...'` literal starting at the opening quote; `''` is an escaped quote.
fn read_quoted(chars: &[char], start: usize) -> BackendResult<(String, usize)> {
    let mut text = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == '\'' {
            if i + 1 < chars.len() && chars[i + 1] == '\'' {
                text.push('\'');
                i += 2;
                continue;
            }
            return Ok((text, i + 1));
        }
        text.push(chars[i]);
        i += 1;
    }
    Err(invalid("unterminated string literal"))
}

fn read_number(chars: &[char], start: usize) -> BackendResult<(Value, usize)> {
    let mut i = start;
    if chars[i] == '-' {
        i += 1;
    }
    let mut is_double = false;
    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_digit() {
            i += 1;
        } else if c == '.' || c == 'e' || c == 'E' {
            is_double = true;
            i += 1;
            if (c == 'e' || c == 'E') && i < chars.len() && (chars[i] == '-' || chars[i] == '+') {
                i += 1;
            }
        } else {
            break;
        }
    }
    let text: String = chars[start..i].iter().collect();
    if i < chars.len() && chars[i] == 'L' {
        if is_double {
            return Err(invalid(format!("malformed 64-bit literal {text}L")));
        }
        let value = text
            .parse::<i64>()
            .map_err(|e| invalid(format!("bad 64-bit literal {text}: {e}")))?;
        return Ok((Value::Int64(value), i + 1));
    }
    if is_double {
        let value = text
            .parse::<f64>()
            .map_err(|e| invalid(format!("bad double literal {text}: {e}")))?;
        return Ok((Value::Double(value), i));
    }
    // Unsuffixed integers are 32-bit; wider values need the L suffix.
    let value = text
        .parse::<i32>()
        .map_err(|e| invalid(format!("bad 32-bit literal {text}: {e}")))?;
    Ok((Value::Int32(value), i))
}

fn typed_literal(prefix: &str, text: &str) -> BackendResult<Value> {
    match prefix {
        "datetime" => OffsetDateTime::parse(text, &Rfc3339)
            .map(Value::DateTime)
            .map_err(|e| invalid(format!("bad datetime literal {text}: {e}"))),
        "guid" => Uuid::parse_str(text)
            .map(Value::Guid)
            .map_err(|e| invalid(format!("bad guid literal {text}: {e}"))),
        "X" | "binary" => hex::decode(text)
            .map(Value::Binary)
            .map_err(|e| invalid(format!("bad binary literal {text}: {e}"))),
        other => Err(invalid(format!("unknown literal prefix {other}"))),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_word(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w == word)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> BackendResult<FilterExpr> {
        let mut left = self.parse_and()?;
        while self.peek_word("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = FilterExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> BackendResult<FilterExpr> {
        let mut left = self.parse_unary()?;
        while self.peek_word("and") {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = FilterExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> BackendResult<FilterExpr> {
        if self.peek_word("not") {
            self.pos += 1;
            return Ok(FilterExpr::Not(Box::new(self.parse_unary()?)));
        }
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            match self.next() {
                Some(Token::RParen) => return Ok(inner),
                other => return Err(invalid(format!("expected ')', found {other:?}"))),
            }
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> BackendResult<FilterExpr> {
        let left = self.parse_operand()?;
        let op = match self.next() {
            Some(Token::Word(word)) => ComparisonOp::from_token(&word)
                .ok_or_else(|| invalid(format!("unknown operator {word}")))?,
            other => return Err(invalid(format!("expected operator, found {other:?}"))),
        };
        let right = self.parse_operand()?;
        Ok(FilterExpr::Compare { left, op, right })
    }

    fn parse_operand(&mut self) -> BackendResult<Operand> {
        match self.next() {
            Some(Token::Word(word)) => Ok(Operand::Property(word)),
            Some(Token::Literal(value)) => Ok(Operand::Literal(value)),
            other => Err(invalid(format!("expected operand, found {other:?}"))),
        }
    }
}
