//! The trigger predicate language.
//!
//! Predicates are short, side-effect-free expressions evaluated against the
//! triggering message and a read-only ledger view, e.g.
//!
//! ```text
//! message.content.data.approved == false && ledger.count({topic: 'VALIDATION_RESULT'}) >= 2
//! ```
//!
//! The environment is frozen: `message`, `ledger.query`, `ledger.findLast`,
//! `ledger.count`, `cluster.getAgents`, and `helpers.allResponded` are the
//! whole API. No I/O, no wall clock beyond `message.timestamp`, and a hard
//! wall-time budget enforced inside the evaluation loop.

use std::time::{Duration, Instant};

use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Wall-time budget for a single predicate evaluation.
pub const EVAL_BUDGET: Duration = Duration::from_millis(1000);

const MAX_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum LogicError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("evaluation error: {0}")]
    Eval(String),

    #[error("evaluation exceeded the {}ms budget", EVAL_BUDGET.as_millis())]
    Budget,

    #[error("host error: {0}")]
    Host(String),
}

/// The read-only API surface a predicate may touch.
pub trait LogicHost {
    fn message(&self) -> Value;
    fn ledger_query(&self, filter: &Value) -> Result<Value, LogicError>;
    fn ledger_find_last(&self, filter: &Value) -> Result<Value, LogicError>;
    fn ledger_count(&self, filter: &Value) -> Result<Value, LogicError>;
    fn cluster_agents(&self) -> Result<Value, LogicError>;
    fn all_responded(&self, agents: &Value, topic: &Value, since: &Value)
        -> Result<bool, LogicError>;
}

/// Evaluate a predicate to a boolean under the standard budget.
pub fn evaluate(source: &str, host: &dyn LogicHost) -> Result<bool, LogicError> {
    evaluate_with_budget(source, host, EVAL_BUDGET)
}

pub fn evaluate_with_budget(
    source: &str,
    host: &dyn LogicHost,
    budget: Duration,
) -> Result<bool, LogicError> {
    let expr = Parser::new(source)?.parse()?;
    let evaluator = Evaluator {
        host,
        deadline: Instant::now() + budget,
    };
    let value = evaluator.eval(&expr, 0)?;
    Ok(truthy(&value))
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Dot,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
}

fn lex(source: &str) -> Result<Vec<Token>, LogicError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
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
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
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
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(LogicError::Parse("assignment is not allowed".to_string()));
                }
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
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(LogicError::Parse("expected `&&`".to_string()));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(LogicError::Parse("expected `||`".to_string()));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => value.push('\n'),
                                Some('t') => value.push('\t'),
                                Some(&esc) => value.push(esc),
                                None => {
                                    return Err(LogicError::Parse(
                                        "unterminated string".to_string(),
                                    ))
                                }
                            }
                            i += 2;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                        None => return Err(LogicError::Parse("unterminated string".to_string())),
                    }
                }
                tokens.push(Token::Str(value));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // `1.foo` is not a number; stop a trailing dot.
                    if chars[i] == '.'
                        && !chars
                            .get(i + 1)
                            .map(|c| c.is_ascii_digit())
                            .unwrap_or(false)
                    {
                        break;
                    }
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let num = raw
                    .parse::<f64>()
                    .map_err(|_| LogicError::Parse(format!("invalid number `{raw}`")))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(LogicError::Parse(format!("unexpected character `{other}`")));
            }
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone)]
enum Expr {
    Lit(Value),
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call { path: Vec<String>, args: Vec<Expr> },
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(source: &str) -> Result<Self, LogicError> {
        Ok(Self {
            tokens: lex(source)?,
            pos: 0,
        })
    }

    fn parse(mut self) -> Result<Expr, LogicError> {
        if self.tokens.is_empty() {
            return Err(LogicError::Parse("empty predicate".to_string()));
        }
        let expr = self.or_expr()?;
        if self.pos != self.tokens.len() {
            return Err(LogicError::Parse(format!(
                "trailing tokens at position {}",
                self.pos
            )));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: Token) -> Result<(), LogicError> {
        match self.bump() {
            Some(found) if found == token => Ok(()),
            other => Err(LogicError::Parse(format!(
                "expected {token:?}, found {other:?}"
            ))),
        }
    }

    fn or_expr(&mut self) -> Result<Expr, LogicError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::OrOr) {
            self.bump();
            let right = self.and_expr()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, LogicError> {
        let mut left = self.equality()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.bump();
            let right = self.equality()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, LogicError> {
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::Ne,
                _ => break,
            };
            self.bump();
            let right = self.comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, LogicError> {
        let left = self.unary()?;
        let op = match self.peek() {
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            _ => return Ok(left),
        };
        self.bump();
        let right = self.unary()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn unary(&mut self) -> Result<Expr, LogicError> {
        if self.peek() == Some(&Token::Bang) {
            self.bump();
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, LogicError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.bump();
                    let name = match self.bump() {
                        Some(Token::Ident(name)) => name,
                        other => {
                            return Err(LogicError::Parse(format!(
                                "expected property name after `.`, found {other:?}"
                            )))
                        }
                    };
                    expr = Expr::Member(Box::new(expr), name);
                }
                Some(Token::LBracket) => {
                    self.bump();
                    let index = self.or_expr()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Some(Token::LParen) => {
                    let path = flatten_call_path(&expr).ok_or_else(|| {
                        LogicError::Parse("only the fixed API may be called".to_string())
                    })?;
                    self.bump();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.or_expr()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.bump();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    expr = Expr::Call { path, args };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, LogicError> {
        match self.bump() {
            Some(Token::Num(n)) => Ok(Expr::Lit(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Lit(Value::String(s))),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Lit(Value::Bool(true))),
                "false" => Ok(Expr::Lit(Value::Bool(false))),
                "null" => Ok(Expr::Lit(Value::Null)),
                _ => Ok(Expr::Ident(name)),
            },
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBrace) => {
                let mut fields = Vec::new();
                if self.peek() != Some(&Token::RBrace) {
                    loop {
                        let key = match self.bump() {
                            Some(Token::Ident(key)) => key,
                            Some(Token::Str(key)) => key,
                            other => {
                                return Err(LogicError::Parse(format!(
                                    "expected object key, found {other:?}"
                                )))
                            }
                        };
                        self.expect(Token::Colon)?;
                        fields.push((key, self.or_expr()?));
                        if self.peek() == Some(&Token::Comma) {
                            self.bump();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RBrace)?;
                Ok(Expr::Object(fields))
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.or_expr()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.bump();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RBracket)?;
                Ok(Expr::Array(items))
            }
            other => Err(LogicError::Parse(format!(
                "unexpected token {other:?}"
            ))),
        }
    }
}

fn flatten_call_path(expr: &Expr) -> Option<Vec<String>> {
    match expr {
        Expr::Ident(name) => Some(vec![name.clone()]),
        Expr::Member(base, name) => {
            let mut path = flatten_call_path(base)?;
            path.push(name.clone());
            Some(path)
        }
        _ => None,
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

struct Evaluator<'a> {
    host: &'a dyn LogicHost,
    deadline: Instant,
}

impl<'a> Evaluator<'a> {
    fn eval(&self, expr: &Expr, depth: usize) -> Result<Value, LogicError> {
        if Instant::now() > self.deadline {
            return Err(LogicError::Budget);
        }
        if depth > MAX_DEPTH {
            return Err(LogicError::Eval("expression nests too deeply".to_string()));
        }
        match expr {
            Expr::Lit(value) => Ok(value.clone()),
            Expr::Ident(name) => match name.as_str() {
                "message" => Ok(self.host.message()),
                // Bare `ledger`/`cluster`/`helpers` only make sense called;
                // any other identifier does not exist in the frozen env.
                other => Err(LogicError::Eval(format!("unknown identifier `{other}`"))),
            },
            Expr::Member(base, name) => {
                let value = self.eval(base, depth + 1)?;
                Ok(member(&value, name))
            }
            Expr::Index(base, index) => {
                let value = self.eval(base, depth + 1)?;
                let index = self.eval(index, depth + 1)?;
                Ok(index_value(&value, &index))
            }
            Expr::Call { path, args } => self.call(path, args, depth),
            Expr::Not(inner) => {
                let value = self.eval(inner, depth + 1)?;
                Ok(Value::Bool(!truthy(&value)))
            }
            Expr::Binary(op, left, right) => self.binary(*op, left, right, depth),
            Expr::Object(fields) => {
                let mut map = Map::new();
                for (key, value_expr) in fields {
                    map.insert(key.clone(), self.eval(value_expr, depth + 1)?);
                }
                Ok(Value::Object(map))
            }
            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item, depth + 1)?);
                }
                Ok(Value::Array(out))
            }
        }
    }

    fn binary(
        &self,
        op: BinOp,
        left: &Expr,
        right: &Expr,
        depth: usize,
    ) -> Result<Value, LogicError> {
        match op {
            BinOp::And => {
                let left = self.eval(left, depth + 1)?;
                if !truthy(&left) {
                    return Ok(Value::Bool(false));
                }
                let right = self.eval(right, depth + 1)?;
                Ok(Value::Bool(truthy(&right)))
            }
            BinOp::Or => {
                let left = self.eval(left, depth + 1)?;
                if truthy(&left) {
                    return Ok(Value::Bool(true));
                }
                let right = self.eval(right, depth + 1)?;
                Ok(Value::Bool(truthy(&right)))
            }
            BinOp::Eq => {
                let (l, r) = (self.eval(left, depth + 1)?, self.eval(right, depth + 1)?);
                Ok(Value::Bool(values_equal(&l, &r)))
            }
            BinOp::Ne => {
                let (l, r) = (self.eval(left, depth + 1)?, self.eval(right, depth + 1)?);
                Ok(Value::Bool(!values_equal(&l, &r)))
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let (l, r) = (self.eval(left, depth + 1)?, self.eval(right, depth + 1)?);
                let (a, b) = match (l.as_f64(), r.as_f64()) {
                    (Some(a), Some(b)) => (a, b),
                    _ => {
                        return Err(LogicError::Eval(format!(
                            "cannot order {l} and {r}"
                        )))
                    }
                };
                let result = match op {
                    BinOp::Lt => a < b,
                    BinOp::Le => a <= b,
                    BinOp::Gt => a > b,
                    BinOp::Ge => a >= b,
                    _ => unreachable!(),
                };
                Ok(Value::Bool(result))
            }
        }
    }

    fn call(&self, path: &[String], args: &[Expr], depth: usize) -> Result<Value, LogicError> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg, depth + 1)?);
        }
        let names: Vec<&str> = path.iter().map(String::as_str).collect();
        match (names.as_slice(), values.as_slice()) {
            (["ledger", "query"], [filter]) => self.host.ledger_query(filter),
            (["ledger", "findLast"], [filter]) => self.host.ledger_find_last(filter),
            (["ledger", "count"], [filter]) => self.host.ledger_count(filter),
            (["cluster", "getAgents"], []) => self.host.cluster_agents(),
            (["helpers", "allResponded"], [agents, topic, since]) => self
                .host
                .all_responded(agents, topic, since)
                .map(Value::Bool),
            _ => Err(LogicError::Eval(format!(
                "unknown function `{}` with {} argument(s)",
                path.join("."),
                values.len()
            ))),
        }
    }
}

fn member(value: &Value, name: &str) -> Value {
    match value {
        Value::Object(map) => map.get(name).cloned().unwrap_or(Value::Null),
        Value::Array(items) if name == "length" => Value::Number(Number::from(items.len())),
        // Missing fields and null bases propagate as null rather than
        // failing the whole predicate.
        _ => Value::Null,
    }
}

fn index_value(value: &Value, index: &Value) -> Value {
    match (value, index) {
        (Value::Array(items), Value::Number(n)) => n
            .as_u64()
            .and_then(|i| items.get(i as usize))
            .cloned()
            .unwrap_or(Value::Null),
        (Value::Object(map), Value::String(key)) => {
            map.get(key).cloned().unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct MockHost {
        message: Value,
        count: i64,
        delay: Option<Duration>,
    }

    impl MockHost {
        fn with_message(message: Value) -> Self {
            Self {
                message,
                count: 0,
                delay: None,
            }
        }
    }

    impl LogicHost for MockHost {
        fn message(&self) -> Value {
            self.message.clone()
        }
        fn ledger_query(&self, _filter: &Value) -> Result<Value, LogicError> {
            Ok(json!([]))
        }
        fn ledger_find_last(&self, _filter: &Value) -> Result<Value, LogicError> {
            Ok(Value::Null)
        }
        fn ledger_count(&self, _filter: &Value) -> Result<Value, LogicError> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            Ok(json!(self.count))
        }
        fn cluster_agents(&self) -> Result<Value, LogicError> {
            Ok(json!([{ "id": "worker" }, { "id": "validator" }]))
        }
        fn all_responded(
            &self,
            agents: &Value,
            _topic: &Value,
            _since: &Value,
        ) -> Result<bool, LogicError> {
            Ok(agents.as_array().map(|a| a.len()).unwrap_or(0) == 2)
        }
    }

    fn host() -> MockHost {
        MockHost::with_message(json!({
            "topic": "VALIDATION_RESULT",
            "timestamp": 1700000000000i64,
            "content": { "data": { "approved": false, "errors": ["A"] } }
        }))
    }

    #[test]
    fn literal_and_boolean_operators() {
        let host = host();
        assert!(evaluate("true", &host).unwrap());
        assert!(!evaluate("false || (1 > 2)", &host).unwrap());
        assert!(evaluate("!false && 1 <= 1", &host).unwrap());
    }

    #[test]
    fn message_paths_resolve() {
        let host = host();
        assert!(evaluate("message.topic == 'VALIDATION_RESULT'", &host).unwrap());
        assert!(evaluate("message.content.data.approved == false", &host).unwrap());
        assert!(evaluate("message.content.data.errors.length == 1", &host).unwrap());
        assert!(evaluate("message.content.data.errors[0] == 'A'", &host).unwrap());
    }

    #[test]
    fn missing_paths_are_null_not_errors() {
        let host = host();
        assert!(evaluate("message.content.data.nope == null", &host).unwrap());
        assert!(!evaluate("message.no.such.path", &host).unwrap());
    }

    #[test]
    fn ledger_count_with_object_argument() {
        let mut mock = host();
        mock.count = 3;
        assert!(evaluate("ledger.count({topic: 'VALIDATION_RESULT'}) >= 2", &mock).unwrap());
        assert!(!evaluate("ledger.count({topic: 'X'}) > 5", &mock).unwrap());
    }

    #[test]
    fn helpers_all_responded_is_callable() {
        let host = host();
        assert!(evaluate(
            "helpers.allResponded(cluster.getAgents(), 'VALIDATION_RESULT', message.timestamp)",
            &host
        )
        .unwrap());
    }

    #[test]
    fn unknown_identifiers_are_frozen_out() {
        let host = host();
        assert!(matches!(
            evaluate("process.exit()", &host),
            Err(LogicError::Parse(_)) | Err(LogicError::Eval(_))
        ));
        assert!(matches!(
            evaluate("globalThis", &host),
            Err(LogicError::Eval(_))
        ));
    }

    #[test]
    fn assignment_is_a_parse_error() {
        let host = host();
        assert!(matches!(
            evaluate("message = 1", &host),
            Err(LogicError::Parse(_))
        ));
    }

    #[test]
    fn budget_overrun_is_reported() {
        let mut mock = host();
        mock.delay = Some(Duration::from_millis(30));
        mock.count = 1;
        let result = evaluate_with_budget(
            "ledger.count({}) > 0 && ledger.count({}) > 0",
            &mock,
            Duration::from_millis(10),
        );
        assert!(matches!(result, Err(LogicError::Budget)));
    }

    #[test]
    fn short_circuit_skips_right_side() {
        let mock = host();
        // The right side would be a host error if evaluated eagerly.
        assert!(!evaluate("false && bogus_identifier", &mock).unwrap());
        assert!(evaluate("true || bogus_identifier", &mock).unwrap());
    }

    #[test]
    fn empty_predicate_is_a_parse_error() {
        let host = host();
        assert!(matches!(evaluate("  ", &host), Err(LogicError::Parse(_))));
    }
}
