//! Guard and verification expression language.
//!
//! A small, pure boolean expression language evaluated over named JSON
//! roots (`context`, `outputs`, `policy` for guards; `output` for
//! verification). The grammar supports strict equality, relational
//! comparison, boolean connectives, property access, array indexing, and
//! primitive literals - no function calls, no loops, no assignment, and no
//! host-code evaluation of any kind.
//!
//! Missing roots, properties, or indices yield `undefined`, which is falsy
//! and strictly equal only to itself.
//!
//! ```rust
//! use acm_core::expr::{eval_bool, ExprRoots};
//! use serde_json::json;
//!
//! let roots = ExprRoots::new().with_root("outputs", json!({"t1": {"score": 12}}));
//! assert!(eval_bool("outputs.t1.score > 10", &roots).unwrap());
//! assert!(!eval_bool("outputs.missing.score > 10", &roots).unwrap());
//! ```

use serde_json::{Number, Value};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Named JSON roots an expression evaluates against.
#[derive(Debug, Clone, Default)]
pub struct ExprRoots {
    roots: BTreeMap<String, Value>,
}

impl ExprRoots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a root object.
    pub fn with_root(mut self, name: impl Into<String>, value: Value) -> Self {
        self.roots.insert(name.into(), value);
        self
    }

    fn root(&self, name: &str) -> Option<&Value> {
        self.roots.get(name)
    }
}

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    /// Missing root, property, or index
    Undefined,
    /// A concrete JSON value
    Json(Value),
}

impl ExprValue {
    /// Boolean coercion: `undefined`, `null`, `false`, `0`, `NaN`, and the
    /// empty string are falsy; everything else is truthy.
    pub fn truthy(&self) -> bool {
        match self {
            Self::Undefined => false,
            Self::Json(Value::Null) => false,
            Self::Json(Value::Bool(b)) => *b,
            Self::Json(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Self::Json(Value::String(s)) => !s.is_empty(),
            Self::Json(Value::Array(_)) | Self::Json(Value::Object(_)) => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Bang,
    Minus,
    AndAnd,
    OrOr,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '&' => {
                chars.next();
                match chars.next() {
                    Some((_, '&')) => tokens.push(Token::AndAnd),
                    _ => return Err(lex_error(source, pos, "expected '&&'")),
                }
            }
            '|' => {
                chars.next();
                match chars.next() {
                    Some((_, '|')) => tokens.push(Token::OrOr),
                    _ => return Err(lex_error(source, pos, "expected '||'")),
                }
            }
            '=' => {
                chars.next();
                let second = chars.next();
                let third = chars.next();
                match (second, third) {
                    (Some((_, '=')), Some((_, '='))) => tokens.push(Token::StrictEq),
                    _ => return Err(lex_error(source, pos, "expected '==='")),
                }
            }
            '!' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    match chars.next() {
                        Some((_, '=')) => tokens.push(Token::StrictNe),
                        _ => return Err(lex_error(source, pos, "expected '!=='")),
                    }
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '<' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '\'' | '"' => {
                tokens.push(Token::Str(lex_string(source, &mut chars)?));
            }
            c if c.is_ascii_digit() => {
                tokens.push(Token::Number(lex_number(source, &mut chars)?));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '$' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match ident.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(ident),
                });
            }
            other => {
                return Err(lex_error(
                    source,
                    pos,
                    &format!("unexpected character {:?}", other),
                ))
            }
        }
    }

    Ok(tokens)
}

fn lex_string(
    source: &str,
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
) -> Result<String> {
    let (start, quote) = chars.next().expect("caller peeked a quote");
    let mut out = String::new();
    while let Some((_, c)) = chars.next() {
        if c == quote {
            return Ok(out);
        }
        if c == '\\' {
            match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, escaped)) => out.push(escaped),
                None => break,
            }
        } else {
            out.push(c);
        }
    }
    Err(lex_error(source, start, "unterminated string literal"))
}

fn lex_number(
    source: &str,
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
) -> Result<f64> {
    let start = chars.peek().map(|&(p, _)| p).unwrap_or(0);
    let mut text = String::new();
    let mut seen_dot = false;
    while let Some(&(_, c)) = chars.peek() {
        if c.is_ascii_digit() {
            text.push(c);
            chars.next();
        } else if c == '.' && !seen_dot {
            // lookahead: "1.x" must not swallow a trailing member access
            let mut ahead = chars.clone();
            ahead.next();
            match ahead.peek() {
                Some(&(_, d)) if d.is_ascii_digit() => {
                    seen_dot = true;
                    text.push(c);
                    chars.next();
                }
                _ => break,
            }
        } else {
            break;
        }
    }
    text.parse::<f64>()
        .map_err(|_| lex_error(source, start, "invalid number literal"))
}

fn lex_error(source: &str, pos: usize, message: &str) -> Error {
    Error::Expr(format!("{} at offset {} in {:?}", message, pos, source))
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Root(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

/// Primitive literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
}

/// Binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

struct Parser<'a> {
    source: &'a str,
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

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<()> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.error(what))
        }
    }

    fn error(&self, message: &str) -> Error {
        Error::Expr(format!(
            "parse error: {} (token {} of {:?})",
            message, self.pos, self.source
        ))
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_equality()?;
        while self.eat(&Token::AndAnd) {
            let right = self.parse_equality()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::StrictEq) => BinaryOp::StrictEq,
                Some(Token::StrictNe) => BinaryOp::StrictNe,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_relational()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Bang) {
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        if self.eat(&Token::Minus) {
            match self.next() {
                Some(Token::Number(n)) => return Ok(Expr::Literal(Literal::Number(-n))),
                _ => return Err(self.error("'-' must precede a number literal")),
            }
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                match self.next() {
                    Some(Token::Ident(name)) => {
                        expr = Expr::Member(Box::new(expr), name);
                    }
                    // keywords double as property names after '.'
                    Some(Token::True) => expr = Expr::Member(Box::new(expr), "true".into()),
                    Some(Token::False) => expr = Expr::Member(Box::new(expr), "false".into()),
                    Some(Token::Null) => expr = Expr::Member(Box::new(expr), "null".into()),
                    _ => return Err(self.error("expected property name after '.'")),
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.parse_or()?;
                self.expect(Token::RBracket, "expected ']'")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(Literal::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Literal::Str(s))),
            Some(Token::True) => Ok(Expr::Literal(Literal::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Literal::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Literal::Null)),
            Some(Token::Ident(name)) => Ok(Expr::Root(name)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen, "expected ')'")?;
                Ok(inner)
            }
            _ => Err(self.error("expected expression")),
        }
    }
}

/// Parse an expression source string.
pub fn parse(source: &str) -> Result<Expr> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(Error::Expr(format!("empty expression: {:?}", source)));
    }
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
    };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error("trailing tokens"));
    }
    Ok(expr)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

impl Expr {
    /// Evaluate against the given roots.
    pub fn eval(&self, roots: &ExprRoots) -> ExprValue {
        match self {
            Expr::Literal(lit) => lit.to_value(),
            Expr::Root(name) => match roots.root(name) {
                Some(value) => ExprValue::Json(value.clone()),
                None => ExprValue::Undefined,
            },
            Expr::Member(base, name) => match base.eval(roots) {
                ExprValue::Json(Value::Object(map)) => match map.get(name) {
                    Some(value) => ExprValue::Json(value.clone()),
                    None => ExprValue::Undefined,
                },
                _ => ExprValue::Undefined,
            },
            Expr::Index(base, index) => {
                let base = base.eval(roots);
                let index = index.eval(roots);
                index_value(&base, &index)
            }
            Expr::Not(inner) => ExprValue::Json(Value::Bool(!inner.eval(roots).truthy())),
            Expr::Binary(op, left, right) => eval_binary(*op, left, right, roots),
        }
    }

    /// Evaluate and coerce to boolean.
    pub fn eval_bool(&self, roots: &ExprRoots) -> bool {
        self.eval(roots).truthy()
    }
}

impl Literal {
    fn to_value(&self) -> ExprValue {
        match self {
            Literal::Number(n) => match Number::from_f64(*n) {
                Some(number) => ExprValue::Json(Value::Number(number)),
                None => ExprValue::Undefined,
            },
            Literal::Str(s) => ExprValue::Json(Value::String(s.clone())),
            Literal::Bool(b) => ExprValue::Json(Value::Bool(*b)),
            Literal::Null => ExprValue::Json(Value::Null),
        }
    }
}

fn index_value(base: &ExprValue, index: &ExprValue) -> ExprValue {
    let (base, index) = match (base, index) {
        (ExprValue::Json(b), ExprValue::Json(i)) => (b, i),
        _ => return ExprValue::Undefined,
    };
    match (base, index) {
        (Value::Array(items), Value::Number(n)) => {
            let f = match n.as_f64() {
                Some(f) if f >= 0.0 && f.fract() == 0.0 => f,
                _ => return ExprValue::Undefined,
            };
            match items.get(f as usize) {
                Some(value) => ExprValue::Json(value.clone()),
                None => ExprValue::Undefined,
            }
        }
        (Value::Object(map), Value::String(key)) => match map.get(key) {
            Some(value) => ExprValue::Json(value.clone()),
            None => ExprValue::Undefined,
        },
        _ => ExprValue::Undefined,
    }
}

fn eval_binary(op: BinaryOp, left: &Expr, right: &Expr, roots: &ExprRoots) -> ExprValue {
    match op {
        // short-circuit; both connectives are boolean-valued
        BinaryOp::And => {
            let value = left.eval(roots).truthy() && right.eval(roots).truthy();
            ExprValue::Json(Value::Bool(value))
        }
        BinaryOp::Or => {
            let value = left.eval(roots).truthy() || right.eval(roots).truthy();
            ExprValue::Json(Value::Bool(value))
        }
        BinaryOp::StrictEq => {
            let value = strict_eq(&left.eval(roots), &right.eval(roots));
            ExprValue::Json(Value::Bool(value))
        }
        BinaryOp::StrictNe => {
            let value = !strict_eq(&left.eval(roots), &right.eval(roots));
            ExprValue::Json(Value::Bool(value))
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let value = relational(op, &left.eval(roots), &right.eval(roots));
            ExprValue::Json(Value::Bool(value))
        }
    }
}

/// Strict equality. `undefined` equals only itself; numbers compare
/// numerically (`1 === 1.0`); arrays and objects compare structurally.
fn strict_eq(left: &ExprValue, right: &ExprValue) -> bool {
    match (left, right) {
        (ExprValue::Undefined, ExprValue::Undefined) => true,
        (ExprValue::Undefined, _) | (_, ExprValue::Undefined) => false,
        (ExprValue::Json(l), ExprValue::Json(r)) => json_strict_eq(l, r),
    }
}

fn json_strict_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(l), Value::Bool(r)) => l == r,
        (Value::Number(l), Value::Number(r)) => match (l.as_f64(), r.as_f64()) {
            (Some(l), Some(r)) => l == r,
            _ => false,
        },
        (Value::String(l), Value::String(r)) => l == r,
        (Value::Array(l), Value::Array(r)) => {
            l.len() == r.len() && l.iter().zip(r).all(|(a, b)| json_strict_eq(a, b))
        }
        (Value::Object(l), Value::Object(r)) => {
            l.len() == r.len()
                && l.iter()
                    .all(|(k, lv)| r.get(k).map(|rv| json_strict_eq(lv, rv)).unwrap_or(false))
        }
        _ => false,
    }
}

/// Relational comparison is defined for number-number and string-string
/// pairs; everything else (including any `undefined` operand) is false.
fn relational(op: BinaryOp, left: &ExprValue, right: &ExprValue) -> bool {
    let (left, right) = match (left, right) {
        (ExprValue::Json(l), ExprValue::Json(r)) => (l, r),
        _ => return false,
    };
    let ordering = match (left, right) {
        (Value::Number(l), Value::Number(r)) => match (l.as_f64(), r.as_f64()) {
            (Some(l), Some(r)) => l.partial_cmp(&r),
            _ => None,
        },
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    };
    match ordering {
        None => false,
        Some(ordering) => match op {
            BinaryOp::Lt => ordering.is_lt(),
            BinaryOp::Le => ordering.is_le(),
            BinaryOp::Gt => ordering.is_gt(),
            BinaryOp::Ge => ordering.is_ge(),
            _ => false,
        },
    }
}

/// Parse and evaluate a boolean expression in one step.
pub fn eval_bool(source: &str, roots: &ExprRoots) -> Result<bool> {
    Ok(parse(source)?.eval_bool(roots))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn roots() -> ExprRoots {
        ExprRoots::new()
            .with_root("context", json!({"region": "eu", "tier": 2}))
            .with_root(
                "outputs",
                json!({
                    "t1": {"score": 12, "tags": ["alpha", "beta"], "ok": true},
                    "t2": {"score": 5},
                }),
            )
            .with_root("policy", json!({"t1": {"allow": true}}))
    }

    #[test]
    fn test_property_chains_and_comparison() {
        let r = roots();
        assert!(eval_bool("outputs.t1.score > 10", &r).unwrap());
        assert!(!eval_bool("outputs.t2.score > 10", &r).unwrap());
        assert!(eval_bool("context.region === 'eu'", &r).unwrap());
        assert!(eval_bool("context.region !== 'us'", &r).unwrap());
    }

    #[test]
    fn test_array_indexing() {
        let r = roots();
        assert!(eval_bool("outputs.t1.tags[0] === 'alpha'", &r).unwrap());
        assert!(!eval_bool("outputs.t1.tags[5] === 'alpha'", &r).unwrap());
        assert!(eval_bool("outputs['t1'].ok", &r).unwrap());
    }

    #[test]
    fn test_undefined_is_falsy_and_self_equal() {
        let r = roots();
        assert!(!eval_bool("outputs.t9.score", &r).unwrap());
        assert!(!eval_bool("outputs.t9.score > 0", &r).unwrap());
        assert!(!eval_bool("outputs.t9.score < 0", &r).unwrap());
        // both sides undefined
        assert!(eval_bool("outputs.t9.score === outputs.t8.score", &r).unwrap());
        assert!(!eval_bool("outputs.t9.score === null", &r).unwrap());
        assert!(!eval_bool("outputs.t9.score === 0", &r).unwrap());
    }

    #[test]
    fn test_missing_policy_root_entry_is_falsy() {
        let r = roots();
        assert!(eval_bool("policy.t1.allow", &r).unwrap());
        assert!(!eval_bool("policy.t2.allow", &r).unwrap());
    }

    #[test]
    fn test_connectives_and_negation() {
        let r = roots();
        assert!(eval_bool("outputs.t1.ok && outputs.t1.score >= 12", &r).unwrap());
        assert!(eval_bool("outputs.t9.x || context.tier === 2", &r).unwrap());
        assert!(eval_bool("!outputs.t9.x", &r).unwrap());
        assert!(eval_bool("!(outputs.t1.score < 10)", &r).unwrap());
    }

    #[test]
    fn test_numeric_equality_ignores_representation() {
        let r = ExprRoots::new().with_root("output", json!({"count": 5}));
        // integer-backed 5 compares equal to literal 5 parsed as f64
        assert!(eval_bool("output.count === 5", &r).unwrap());
        assert!(eval_bool("output.count === 5.0", &r).unwrap());
    }

    #[test]
    fn test_negative_literals() {
        let r = ExprRoots::new().with_root("output", json!({"delta": -3}));
        assert!(eval_bool("output.delta === -3", &r).unwrap());
        assert!(eval_bool("output.delta < -1", &r).unwrap());
    }

    #[test]
    fn test_string_ordering() {
        let r = ExprRoots::new().with_root("output", json!({"name": "beta"}));
        assert!(eval_bool("output.name > 'alpha'", &r).unwrap());
        assert!(!eval_bool("output.name > 'gamma'", &r).unwrap());
    }

    #[test]
    fn test_mixed_type_relational_is_false() {
        let r = ExprRoots::new().with_root("output", json!({"n": 3, "s": "x"}));
        assert!(!eval_bool("output.n > output.s", &r).unwrap());
        assert!(!eval_bool("output.s < 5", &r).unwrap());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("a ==").is_err());
        assert!(parse("a == b").is_err()); // only strict equality exists
        assert!(parse("a &&").is_err());
        assert!(parse("f(x)").is_err());
        assert!(parse("a[1").is_err());
        assert!(parse("'unterminated").is_err());
    }

    #[test]
    fn test_number_member_boundary() {
        // "1.x" style: the lexer must not swallow a member access dot
        let r = ExprRoots::new().with_root("output", json!({"v": 1.5}));
        assert!(eval_bool("output.v === 1.5", &r).unwrap());
        assert!(eval_bool("2 > 1", &r).unwrap());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // The parser must never panic, whatever the input.
            #[test]
            fn parse_is_total(source in ".{0,64}") {
                let _ = parse(&source);
            }

            // Valid member chains over arbitrary JSON never panic and
            // always produce a boolean.
            #[test]
            fn eval_is_total(
                key in "[a-z]{1,8}",
                n in proptest::num::f64::NORMAL,
            ) {
                let roots = ExprRoots::new().with_root("output", json!({ key.clone(): n }));
                let src = format!("output.{} === output.{}", key, key);
                let value = eval_bool(&src, &roots).unwrap();
                prop_assert!(value);
            }

            // Relational operators agree with f64 ordering.
            #[test]
            fn relational_matches_f64(a in -1e6f64..1e6, b in -1e6f64..1e6) {
                let roots = ExprRoots::new().with_root("output", json!({"a": a, "b": b}));
                prop_assert_eq!(eval_bool("output.a < output.b", &roots).unwrap(), a < b);
                prop_assert_eq!(eval_bool("output.a >= output.b", &roots).unwrap(), a >= b);
            }
        }
    }
}
