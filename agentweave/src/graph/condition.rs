//! Sandboxed router condition language.
//!
//! Conditions are pure predicates over the state snapshot: boolean and
//! comparison operators, membership, `state.get("key", default)` /
//! `state["key"]` access, literal values, and the special token `default` as
//! an always-match fallback. No function calls, no writes, no side effects.
//!
//! ```rust
//! use agentweave::graph::Predicate;
//! use agentweave::state::WorkflowState;
//! use serde_json::json;
//!
//! let pred = Predicate::parse("state.get(\"score\", 0) > 0.8").unwrap();
//! let state = WorkflowState::builder().with_property("score", json!(0.9)).build();
//! assert!(pred.eval(&state.snapshot()));
//! ```

use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

use crate::state::StateSnapshot;

/// Errors raised while parsing a condition expression.
#[derive(Debug, Error, Diagnostic)]
pub enum ConditionError {
    #[error("unexpected character '{ch}' at offset {offset} in condition")]
    #[diagnostic(code(agentweave::condition::lex))]
    UnexpectedChar { ch: char, offset: usize },

    #[error("unterminated string literal starting at offset {offset}")]
    #[diagnostic(code(agentweave::condition::unterminated_string))]
    UnterminatedString { offset: usize },

    #[error("parse error in condition: {detail}")]
    #[diagnostic(
        code(agentweave::condition::parse),
        help("supported: and/or/not, ==/!=/</<=/>/>=, in, state.get(\"key\", default), literals, default")
    )]
    Parse { detail: String },
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

fn lex(src: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' if !chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '"' | '\'' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') if chars.get(i + 1).is_some() => {
                            s.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err(ConditionError::UnterminatedString { offset: start }),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()))
                || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while chars
                    .get(i)
                    .is_some_and(|n| n.is_ascii_digit() || *n == '.' || *n == 'e' || *n == 'E')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text.parse::<f64>().map_err(|_| ConditionError::Parse {
                    detail: format!("invalid number literal '{text}'"),
                })?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|n| n.is_ascii_alphanumeric() || *n == '_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(ConditionError::UnexpectedChar {
                    ch: other,
                    offset: i,
                })
            }
        }
    }

    Ok(tokens)
}

#[derive(Clone, Debug, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Literal(Value),
    Get { key: String, default: Option<Value> },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    In { needle: Box<Expr>, haystack: Box<Expr>, negated: bool },
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ConditionError> {
        match self.next() {
            Some(tok) if tok == *expected => Ok(()),
            other => Err(ConditionError::Parse {
                detail: format!("expected {expected:?}, found {other:?}"),
            }),
        }
    }

    fn is_ident(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w == word)
    }

    fn parse_expr(&mut self) -> Result<Expr, ConditionError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut lhs = self.parse_and()?;
        while self.is_ident("or") {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut lhs = self.parse_unary()?;
        while self.is_ident("and") {
            self.next();
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if self.is_ident("not") {
            // Peek past `not`: `not in` belongs to comparison, handled below.
            if !matches!(self.tokens.get(self.pos + 1), Some(Token::Ident(w)) if w == "in") {
                self.next();
                let inner = self.parse_unary()?;
                return Ok(Expr::Not(Box::new(inner)));
            }
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ConditionError> {
        let lhs = self.parse_operand()?;

        let op = match self.peek() {
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.next();
            let rhs = self.parse_operand()?;
            return Ok(Expr::Cmp(op, Box::new(lhs), Box::new(rhs)));
        }

        if self.is_ident("in") {
            self.next();
            let haystack = self.parse_operand()?;
            return Ok(Expr::In {
                needle: Box::new(lhs),
                haystack: Box::new(haystack),
                negated: false,
            });
        }
        if self.is_ident("not") {
            self.next();
            if !self.is_ident("in") {
                return Err(ConditionError::Parse {
                    detail: "expected 'in' after 'not'".to_string(),
                });
            }
            self.next();
            let haystack = self.parse_operand()?;
            return Ok(Expr::In {
                needle: Box::new(lhs),
                haystack: Box::new(haystack),
                negated: true,
            });
        }

        Ok(lhs)
    }

    fn parse_operand(&mut self) -> Result<Expr, ConditionError> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::LBracket) => {
                // Array literal for membership tests.
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.next();
                    return Ok(Expr::Literal(Value::Array(items)));
                }
                loop {
                    match self.parse_operand()? {
                        Expr::Literal(v) => items.push(v),
                        other => {
                            return Err(ConditionError::Parse {
                                detail: format!("array literals may only hold literals, found {other:?}"),
                            })
                        }
                    }
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBracket) => break,
                        other => {
                            return Err(ConditionError::Parse {
                                detail: format!("expected ',' or ']' in array literal, found {other:?}"),
                            })
                        }
                    }
                }
                Ok(Expr::Literal(Value::Array(items)))
            }
            Some(Token::Ident(word)) => match word.as_str() {
                "true" | "True" => Ok(Expr::Literal(Value::Bool(true))),
                "false" | "False" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "None" | "none" => Ok(Expr::Literal(Value::Null)),
                "state" => self.parse_state_access(),
                other => Err(ConditionError::Parse {
                    detail: format!("unknown identifier '{other}'"),
                }),
            },
            other => Err(ConditionError::Parse {
                detail: format!("unexpected token {other:?}"),
            }),
        }
    }

    fn parse_state_access(&mut self) -> Result<Expr, ConditionError> {
        match self.next() {
            Some(Token::Dot) => {
                match self.next() {
                    Some(Token::Ident(method)) if method == "get" => {}
                    other => {
                        return Err(ConditionError::Parse {
                            detail: format!("only state.get(...) is allowed, found {other:?}"),
                        })
                    }
                }
                self.expect(&Token::LParen)?;
                let key = match self.next() {
                    Some(Token::Str(key)) => key,
                    other => {
                        return Err(ConditionError::Parse {
                            detail: format!("state.get expects a string key, found {other:?}"),
                        })
                    }
                };
                let default = if self.peek() == Some(&Token::Comma) {
                    self.next();
                    match self.parse_operand()? {
                        Expr::Literal(v) => Some(v),
                        other => {
                            return Err(ConditionError::Parse {
                                detail: format!("state.get default must be a literal, found {other:?}"),
                            })
                        }
                    }
                } else {
                    None
                };
                self.expect(&Token::RParen)?;
                Ok(Expr::Get { key, default })
            }
            Some(Token::LBracket) => {
                let key = match self.next() {
                    Some(Token::Str(key)) => key,
                    other => {
                        return Err(ConditionError::Parse {
                            detail: format!("state[...] expects a string key, found {other:?}"),
                        })
                    }
                };
                self.expect(&Token::RBracket)?;
                Ok(Expr::Get { key, default: None })
            }
            other => Err(ConditionError::Parse {
                detail: format!("expected '.' or '[' after 'state', found {other:?}"),
            }),
        }
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Python-flavoured truthiness: null, false, 0, "", [], {} are falsy.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn compare(op: &CmpOp, lhs: &Value, rhs: &Value) -> bool {
    match op {
        CmpOp::Eq | CmpOp::Ne => {
            // Numeric equality ignores integer/float representation.
            let eq = match (as_f64(lhs), as_f64(rhs)) {
                (Some(a), Some(b)) => a == b,
                _ => lhs == rhs,
            };
            if matches!(op, CmpOp::Eq) {
                eq
            } else {
                !eq
            }
        }
        ordering => {
            let cmp = match (lhs, rhs) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => match (as_f64(lhs), as_f64(rhs)) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
            };
            let Some(cmp) = cmp else { return false };
            match ordering {
                CmpOp::Lt => cmp.is_lt(),
                CmpOp::Le => cmp.is_le(),
                CmpOp::Gt => cmp.is_gt(),
                CmpOp::Ge => cmp.is_ge(),
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            }
        }
    }
}

fn eval_expr(expr: &Expr, snapshot: &StateSnapshot) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Get { key, default } => snapshot
            .get(key)
            .cloned()
            .or_else(|| default.clone())
            .unwrap_or(Value::Null),
        Expr::Not(inner) => Value::Bool(!truthy(&eval_expr(inner, snapshot))),
        Expr::And(lhs, rhs) => {
            let left = eval_expr(lhs, snapshot);
            if truthy(&left) {
                eval_expr(rhs, snapshot)
            } else {
                left
            }
        }
        Expr::Or(lhs, rhs) => {
            let left = eval_expr(lhs, snapshot);
            if truthy(&left) {
                left
            } else {
                eval_expr(rhs, snapshot)
            }
        }
        Expr::Cmp(op, lhs, rhs) => Value::Bool(compare(
            op,
            &eval_expr(lhs, snapshot),
            &eval_expr(rhs, snapshot),
        )),
        Expr::In {
            needle,
            haystack,
            negated,
        } => {
            let needle = eval_expr(needle, snapshot);
            let haystack = eval_expr(haystack, snapshot);
            let found = match &haystack {
                Value::Array(items) => items.contains(&needle),
                Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
                Value::Object(map) => needle.as_str().is_some_and(|n| map.contains_key(n)),
                _ => false,
            };
            Value::Bool(found != *negated)
        }
    }
}

fn collect_references(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Get { key, .. } => {
            if !out.contains(key) {
                out.push(key.clone());
            }
        }
        Expr::Not(inner) => collect_references(inner, out),
        Expr::And(a, b) | Expr::Or(a, b) | Expr::Cmp(_, a, b) => {
            collect_references(a, out);
            collect_references(b, out);
        }
        Expr::In { needle, haystack, .. } => {
            collect_references(needle, out);
            collect_references(haystack, out);
        }
        Expr::Literal(_) => {}
    }
}

/// A compiled router condition.
///
/// Parsed once at graph compilation; evaluated against a state snapshot with
/// no side effects. The special source `default` always matches.
#[derive(Clone, Debug)]
pub struct Predicate {
    source: String,
    expr: Option<Expr>,
}

impl Predicate {
    /// Parses a condition expression.
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let trimmed = source.trim();
        if trimmed == "default" {
            return Ok(Self {
                source: trimmed.to_string(),
                expr: None,
            });
        }
        let tokens = lex(trimmed)?;
        if tokens.is_empty() {
            return Err(ConditionError::Parse {
                detail: "empty condition".to_string(),
            });
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(ConditionError::Parse {
                detail: format!("trailing tokens after expression in '{trimmed}'"),
            });
        }
        Ok(Self {
            source: trimmed.to_string(),
            expr: Some(expr),
        })
    }

    /// The always-match fallback predicate.
    #[must_use]
    pub fn default_route() -> Self {
        Self {
            source: "default".to_string(),
            expr: None,
        }
    }

    /// `true` for the `default` fallback.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.expr.is_none()
    }

    /// Evaluates the predicate against a snapshot.
    #[must_use]
    pub fn eval(&self, snapshot: &StateSnapshot) -> bool {
        match &self.expr {
            None => true,
            Some(expr) => truthy(&eval_expr(expr, snapshot)),
        }
    }

    /// State properties the predicate reads.
    #[must_use]
    pub fn references(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(expr) = &self.expr {
            collect_references(expr, &mut out);
        }
        out
    }

    /// Original source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WorkflowState;
    use serde_json::json;

    fn snap(props: Value) -> StateSnapshot {
        WorkflowState::builder().with_input(props).build().snapshot()
    }

    #[test]
    fn get_with_default() {
        let p = Predicate::parse("state.get('plan_confirmed', false)").unwrap();
        assert!(!p.eval(&snap(json!({}))));
        assert!(p.eval(&snap(json!({"plan_confirmed": true}))));
    }

    #[test]
    fn numeric_comparisons() {
        let p = Predicate::parse("state.get('score', 0) > 0.8").unwrap();
        assert!(p.eval(&snap(json!({"score": 0.9}))));
        assert!(!p.eval(&snap(json!({"score": 0.5}))));
        assert!(!p.eval(&snap(json!({}))));

        let p = Predicate::parse("state.get('n', 0) == 3").unwrap();
        assert!(p.eval(&snap(json!({"n": 3.0}))));
    }

    #[test]
    fn boolean_connectives_and_not() {
        let p = Predicate::parse(
            "state.get('a', false) and not state.get('b', false) or state.get('c', false)",
        )
        .unwrap();
        assert!(p.eval(&snap(json!({"a": true}))));
        assert!(!p.eval(&snap(json!({"a": true, "b": true}))));
        assert!(p.eval(&snap(json!({"a": true, "b": true, "c": true}))));
    }

    #[test]
    fn membership() {
        let p = Predicate::parse("state.get('mode') in ['fast', 'cheap']").unwrap();
        assert!(p.eval(&snap(json!({"mode": "fast"}))));
        assert!(!p.eval(&snap(json!({"mode": "thorough"}))));

        let p = Predicate::parse("'err' in state.get('log', '')").unwrap();
        assert!(p.eval(&snap(json!({"log": "tool err: timeout"}))));

        let p = Predicate::parse("state.get('mode') not in ['fast']").unwrap();
        assert!(p.eval(&snap(json!({"mode": "slow"}))));
    }

    #[test]
    fn bracket_access() {
        let p = Predicate::parse("state['flag'] == true").unwrap();
        assert!(p.eval(&snap(json!({"flag": true}))));
    }

    #[test]
    fn default_always_matches() {
        let p = Predicate::parse("default").unwrap();
        assert!(p.is_default());
        assert!(p.eval(&snap(json!({}))));
    }

    #[test]
    fn python_style_literals() {
        let p = Predicate::parse("state.get('x', None) != None").unwrap();
        assert!(p.eval(&snap(json!({"x": 1}))));
        assert!(!p.eval(&snap(json!({}))));
        let p = Predicate::parse("state.get('ok', False) == True").unwrap();
        assert!(p.eval(&snap(json!({"ok": true}))));
    }

    #[test]
    fn references_lists_read_properties() {
        let p = Predicate::parse("state.get('a', 0) > 1 and state['b'] == 'x'").unwrap();
        let mut refs = p.references();
        refs.sort();
        assert_eq!(refs, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn rejects_function_calls_and_writes() {
        assert!(Predicate::parse("state.delete('x')").is_err());
        assert!(Predicate::parse("open('/etc/passwd')").is_err());
        assert!(Predicate::parse("__import__('os')").is_err());
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(Predicate::parse("state.get('a') extra").is_err());
        assert!(Predicate::parse("").is_err());
    }
}
