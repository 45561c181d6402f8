//! Boolean predicate evaluation for condition branches and loop breaks.
//!
//! The grammar is deliberately restricted: `operand op operand` chains
//! joined by `&&` / `||`, where an operand is a literal or a `{{path}}`
//! reference. A small recursive-descent parser handles it; user strings
//! are never handed to a general-purpose evaluator.
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := cmp ( "&&" cmp )*
//! cmp     := operand ( cmp-op operand )?
//! cmp-op  := == | != | <= | >= | < | > | contains | startsWith | endsWith
//! operand := number | 'string' | "string" | true | false | {{path}}
//! ```

use serde_json::Value;

use crate::interpolate::{stringify, Scope};
use crate::{EngineError, Result};

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Reference(String),
    Literal(Value),
    Compare(CmpOp),
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    StartsWith,
    EndsWith,
}

fn malformed(input: &str, reason: impl std::fmt::Display) -> EngineError {
    EngineError::Validation(format!("malformed predicate '{input}': {reason}"))
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '{' if input[i..].starts_with("{{") => {
                let rest = &input[i + 2..];
                let end = rest
                    .find("}}")
                    .ok_or_else(|| malformed(input, "unterminated '{{' reference"))?;
                tokens.push(Token::Reference(rest[..end].trim().to_string()));
                i += 2 + end + 2;
            }
            '\'' | '"' => {
                let quote = c;
                let rest = &input[i + 1..];
                let end = rest
                    .find(quote)
                    .ok_or_else(|| malformed(input, "unterminated string literal"))?;
                tokens.push(Token::Literal(Value::String(rest[..end].to_string())));
                i += 1 + end + 1;
            }
            '=' if input[i..].starts_with("==") => {
                tokens.push(Token::Compare(CmpOp::Eq));
                i += 2;
            }
            '!' if input[i..].starts_with("!=") => {
                tokens.push(Token::Compare(CmpOp::Ne));
                i += 2;
            }
            '<' => {
                if input[i..].starts_with("<=") {
                    tokens.push(Token::Compare(CmpOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Compare(CmpOp::Lt));
                    i += 1;
                }
            }
            '>' => {
                if input[i..].starts_with(">=") {
                    tokens.push(Token::Compare(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Compare(CmpOp::Gt));
                    i += 1;
                }
            }
            '&' if input[i..].starts_with("&&") => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if input[i..].starts_with("||") => {
                tokens.push(Token::Or);
                i += 2;
            }
            '-' | '0'..='9' => {
                let start = i;
                i += 1;
                while i < bytes.len() && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let text = &input[start..i];
                let n: f64 = text
                    .parse()
                    .map_err(|_| malformed(input, format!("invalid number '{text}'")))?;
                let number = serde_json::Number::from_f64(n)
                    .ok_or_else(|| malformed(input, format!("non-finite number '{text}'")))?;
                tokens.push(Token::Literal(Value::Number(number)));
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < bytes.len() && (bytes[i] as char).is_ascii_alphanumeric() {
                    i += 1;
                }
                match &input[start..i] {
                    "true" => tokens.push(Token::Literal(Value::Bool(true))),
                    "false" => tokens.push(Token::Literal(Value::Bool(false))),
                    "contains" => tokens.push(Token::Compare(CmpOp::Contains)),
                    "startsWith" => tokens.push(Token::Compare(CmpOp::StartsWith)),
                    "endsWith" => tokens.push(Token::Compare(CmpOp::EndsWith)),
                    word => return Err(malformed(input, format!("unexpected word '{word}'"))),
                }
            }
            other => return Err(malformed(input, format!("unexpected character '{other}'"))),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser / evaluator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Literal(Value),
    Reference(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Truthy(Operand),
    Compare {
        lhs: Operand,
        op: CmpOp,
        rhs: Operand,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
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

    fn parse(mut self) -> Result<Expr> {
        if self.tokens.is_empty() {
            return Err(malformed(self.input, "empty expression"));
        }
        let expr = self.parse_or()?;
        if self.pos != self.tokens.len() {
            return Err(malformed(self.input, "trailing tokens"));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_cmp()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.parse_cmp()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let lhs = self.parse_operand()?;
        if let Some(Token::Compare(op)) = self.peek().cloned() {
            self.next();
            let rhs = self.parse_operand()?;
            return Ok(Expr::Compare { lhs, op, rhs });
        }
        Ok(Expr::Truthy(lhs))
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        match self.next() {
            Some(Token::Literal(value)) => Ok(Operand::Literal(value)),
            Some(Token::Reference(path)) => Ok(Operand::Reference(path)),
            Some(other) => Err(malformed(self.input, format!("expected operand, got {other:?}"))),
            None => Err(malformed(self.input, "expected operand, got end of input")),
        }
    }
}

impl Expr {
    fn eval(&self, scope: &Scope) -> bool {
        match self {
            Self::Truthy(operand) => truthy(&operand.resolve(scope)),
            Self::Compare { lhs, op, rhs } => compare(&lhs.resolve(scope), *op, &rhs.resolve(scope)),
            Self::And(a, b) => a.eval(scope) && b.eval(scope),
            Self::Or(a, b) => a.eval(scope) || b.eval(scope),
        }
    }
}

impl Operand {
    fn resolve(&self, scope: &Scope) -> Value {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Reference(path) => scope.resolve_path(path).unwrap_or(Value::Null),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(lhs), as_number(rhs)) {
        return a == b;
    }
    lhs == rhs
}

/// Compare two resolved values. Ordering over non-comparable operand types
/// evaluates to `false` rather than failing the node; a missing reference
/// resolves to null and must not crash a break condition.
fn compare(lhs: &Value, op: CmpOp, rhs: &Value) -> bool {
    match op {
        CmpOp::Eq => loose_eq(lhs, rhs),
        CmpOp::Ne => !loose_eq(lhs, rhs),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            if let (Some(a), Some(b)) = (as_number(lhs), as_number(rhs)) {
                match op {
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                    _ => unreachable!(),
                }
            } else if let (Value::String(a), Value::String(b)) = (lhs, rhs) {
                match op {
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                    _ => unreachable!(),
                }
            } else {
                false
            }
        }
        CmpOp::Contains => match lhs {
            Value::String(s) => s.contains(&stringify(rhs)),
            Value::Array(items) => items.iter().any(|item| loose_eq(item, rhs)),
            Value::Object(map) => map.contains_key(&stringify(rhs)),
            _ => false,
        },
        CmpOp::StartsWith => stringify(lhs).starts_with(&stringify(rhs)),
        CmpOp::EndsWith => stringify(lhs).ends_with(&stringify(rhs)),
    }
}

/// Evaluate a predicate against the given scope.
///
/// A malformed predicate is a fatal `Validation` error; evaluation itself
/// never fails.
pub fn evaluate(input: &str, scope: &Scope) -> Result<bool> {
    let tokens = tokenize(input)?;
    let expr = Parser {
        input,
        tokens,
        pos: 0,
    }
    .parse()?;
    Ok(expr.eval(scope))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
