//! Expression evaluation.
//!
//! The engine talks to expressions through the [`Evaluator`] trait. The
//! bundled [`SimpleEvaluator`] understands literals, dotted and indexed paths
//! into the store (`steps[0].exit_code`, `vars.user`), comparisons, boolean
//! logic (`&& || !` or `and or not`), parentheses and `len(x)`.

use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

use serde_json::Value;

use crate::core::{Error, Result};

/// One node of an evaluation trace.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceNode {
    pub expr: String,
    pub value: Value,
    pub children: Vec<TraceNode>,
}

/// Outcome of [`Evaluator::eval_with_trace`].
#[derive(Debug, Clone, PartialEq)]
pub struct EvalResult {
    pub value: Value,
    pub trace: TraceNode,
}

impl EvalResult {
    pub fn is_true(&self) -> bool {
        truthy(&self.value)
    }

    /// Human-readable tree showing what every sub-expression evaluated to.
    pub fn render(&self) -> String {
        let mut out = self.trace.expr.clone();
        render_children(&self.trace.children, "", &mut out);
        out
    }
}

fn render_children(children: &[TraceNode], prefix: &str, out: &mut String) {
    for (i, child) in children.iter().enumerate() {
        let last = i + 1 == children.len();
        let (branch, indent) = if last { ("└── ", "    ") } else { ("├── ", "│   ") };
        out.push('\n');
        out.push_str(prefix);
        out.push_str(branch);
        out.push_str(&format!("{} => {}", child.expr, child.value));
        render_children(&child.children, &format!("{prefix}{indent}"), out);
    }
}

/// Evaluates expressions against a JSON snapshot of the store.
pub trait Evaluator: Send + Sync + fmt::Debug {
    fn eval(&self, expr: &str, env: &Value) -> Result<Value>;

    fn eval_with_trace(&self, expr: &str, env: &Value) -> Result<EvalResult>;

    /// Evaluate a condition. An empty condition holds.
    fn eval_cond(&self, expr: &str, env: &Value) -> Result<bool> {
        if expr.trim().is_empty() {
            return Ok(true);
        }
        self.eval(expr, env).map(|v| truthy(&v))
    }

    /// Evaluate a non-negative count.
    fn eval_count(&self, expr: &str, env: &Value) -> Result<usize> {
        let value = self.eval(expr, env)?;
        let n = match &value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        match n {
            Some(n) if n >= 0.0 && n.fract() == 0.0 => Ok(n as usize),
            _ => Err(Error::eval(expr, format!("count must be a non-negative integer, got {value}"))),
        }
    }
}

/// Truthiness: `null`, `false`, `0`, `""`, `[]` and `{}` are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Built-in evaluator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleEvaluator;

impl Evaluator for SimpleEvaluator {
    fn eval(&self, expr: &str, env: &Value) -> Result<Value> {
        self.eval_with_trace(expr, env).map(|r| r.value)
    }

    fn eval_with_trace(&self, expr: &str, env: &Value) -> Result<EvalResult> {
        let ast = Parser::new(expr)?.parse()?;
        let trace = ast.eval(env).map_err(|m| Error::eval(expr, m))?;
        Ok(EvalResult { value: trace.value.clone(), trace })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize, usize)>> {
    let mut tokens = Vec::new();
    let mut chars: Peekable<CharIndices<'_>> = input.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        let token = match c {
            c if c.is_whitespace() => continue,
            '.' => Token::Dot,
            ',' => Token::Comma,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '&' if chars.peek().map(|p| p.1) == Some('&') => {
                chars.next();
                Token::Op("&&")
            }
            '|' if chars.peek().map(|p| p.1) == Some('|') => {
                chars.next();
                Token::Op("||")
            }
            '=' if chars.peek().map(|p| p.1) == Some('=') => {
                chars.next();
                Token::Op("==")
            }
            '!' if chars.peek().map(|p| p.1) == Some('=') => {
                chars.next();
                Token::Op("!=")
            }
            '!' => Token::Op("!"),
            '<' | '>' => {
                let eq = chars.peek().map(|p| p.1) == Some('=');
                if eq {
                    chars.next();
                }
                Token::Op(match (c, eq) {
                    ('<', false) => "<",
                    ('<', true) => "<=",
                    ('>', false) => ">",
                    _ => ">=",
                })
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                let mut closed = false;
                while let Some((_, qc)) = chars.next() {
                    if qc == '\\' {
                        if let Some((_, esc)) = chars.next() {
                            s.push(esc);
                        }
                    } else if qc == quote {
                        closed = true;
                        break;
                    } else {
                        s.push(qc);
                    }
                }
                if !closed {
                    return Err(Error::eval(input, "unterminated string"));
                }
                Token::Str(s)
            }
            c if c.is_ascii_digit() || (c == '-' && chars.peek().is_some_and(|p| p.1.is_ascii_digit())) => {
                let mut end = start + c.len_utf8();
                while let Some(&(i, d)) = chars.peek() {
                    let fraction = d == '.' && {
                        let mut ahead = chars.clone();
                        ahead.next();
                        ahead.peek().is_some_and(|p| p.1.is_ascii_digit())
                    };
                    if d.is_ascii_digit() || fraction {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let text = &input[start..end];
                let n = text.parse::<f64>().map_err(|e| Error::eval(input, format!("bad number '{text}': {e}")))?;
                Token::Num(n)
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut end = start + c.len_utf8();
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' || d == '-' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                match &input[start..end] {
                    "and" => Token::Op("&&"),
                    "or" => Token::Op("||"),
                    "not" => Token::Op("!"),
                    word => Token::Ident(word.to_string()),
                }
            }
            other => return Err(Error::eval(input, format!("unexpected character '{other}'"))),
        };
        let end = chars.peek().map_or(input.len(), |p| p.0);
        tokens.push((token, start, end));
    }

    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Segment {
    Key(String),
    Index(Box<Node>),
}

#[derive(Debug, Clone)]
enum Kind {
    Lit(Value),
    Path(String, Vec<Segment>),
    Not(Box<Node>),
    Binary(&'static str, Box<Node>, Box<Node>),
    Call(String, Vec<Node>),
}

#[derive(Debug, Clone)]
struct Node {
    text: String,
    kind: Kind,
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<(Token, usize, usize)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Result<Self> {
        Ok(Self { input, tokens: tokenize(input)?, pos: 0 })
    }

    fn parse(mut self) -> Result<Node> {
        if self.tokens.is_empty() {
            return Err(Error::eval(self.input, "empty expression"));
        }
        let node = self.or()?;
        if self.pos < self.tokens.len() {
            return Err(self.error("unexpected trailing input"));
        }
        Ok(node)
    }

    fn error(&self, message: &str) -> Error {
        let at = self.tokens.get(self.pos).map_or(self.input.len(), |t| t.1);
        Error::eval(self.input, format!("{message} at offset {at}"))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.0)
    }

    fn start(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.input.len(), |t| t.1)
    }

    fn end(&self) -> usize {
        self.pos.checked_sub(1).and_then(|i| self.tokens.get(i)).map_or(0, |t| t.2)
    }

    fn node(&self, start: usize, kind: Kind) -> Node {
        Node { text: self.input[start..self.end()].trim().to_string(), kind }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn binary(&mut self, ops: &[&'static str], next: fn(&mut Self) -> Result<Node>) -> Result<Node> {
        let start = self.start();
        let mut left = next(self)?;
        while let Some(Token::Op(op)) = self.peek().cloned() {
            if !ops.contains(&op) {
                break;
            }
            self.pos += 1;
            let right = next(self)?;
            left = self.node(start, Kind::Binary(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn or(&mut self) -> Result<Node> {
        self.binary(&["||"], Self::and)
    }

    fn and(&mut self) -> Result<Node> {
        self.binary(&["&&"], Self::comparison)
    }

    fn comparison(&mut self) -> Result<Node> {
        self.binary(&["==", "!=", "<", "<=", ">", ">="], Self::unary)
    }

    fn unary(&mut self) -> Result<Node> {
        let start = self.start();
        if self.eat(&Token::Op("!")) {
            let operand = self.unary()?;
            return Ok(self.node(start, Kind::Not(Box::new(operand))));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Node> {
        let start = self.start();
        let token = self.peek().cloned().ok_or_else(|| self.error("unexpected end"))?;
        self.pos += 1;
        let kind = match token {
            Token::Num(n) => Kind::Lit(number(n)),
            Token::Str(s) => Kind::Lit(Value::String(s)),
            Token::LParen => {
                let inner = self.or()?;
                if !self.eat(&Token::RParen) {
                    return Err(self.error("expected ')'"));
                }
                return Ok(Node { text: self.input[start..self.end()].trim().to_string(), kind: inner.kind });
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Kind::Lit(Value::Bool(true)),
                "false" => Kind::Lit(Value::Bool(false)),
                "null" | "nil" => Kind::Lit(Value::Null),
                _ if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.or()?);
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            if !self.eat(&Token::Comma) {
                                return Err(self.error("expected ',' or ')'"));
                            }
                        }
                    }
                    Kind::Call(name, args)
                }
                _ => Kind::Path(name, self.segments()?),
            },
            _ => {
                self.pos -= 1;
                return Err(self.error("unexpected token"));
            }
        };
        Ok(self.node(start, kind))
    }

    fn segments(&mut self) -> Result<Vec<Segment>> {
        let mut segments = Vec::new();
        loop {
            if self.eat(&Token::Dot) {
                match self.peek().cloned() {
                    Some(Token::Ident(key)) => {
                        self.pos += 1;
                        segments.push(Segment::Key(key));
                    }
                    Some(Token::Num(n)) if n.fract() == 0.0 && n >= 0.0 => {
                        self.pos += 1;
                        segments.push(Segment::Key(format!("{}", n as u64)));
                    }
                    _ => return Err(self.error("expected field name after '.'")),
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.or()?;
                if !self.eat(&Token::RBracket) {
                    return Err(self.error("expected ']'"));
                }
                segments.push(Segment::Index(Box::new(index)));
            } else {
                return Ok(segments);
            }
        }
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

fn lookup(value: &Value, key: &Value) -> Value {
    match (value, key) {
        (Value::Object(map), Value::String(k)) => map.get(k).cloned().unwrap_or(Value::Null),
        (Value::Array(items), Value::Number(n)) => n
            .as_f64()
            .filter(|f| *f >= 0.0 && f.fract() == 0.0)
            .and_then(|f| items.get(f as usize).cloned())
            .unwrap_or(Value::Null),
        (Value::Array(items), Value::String(k)) => {
            k.parse::<usize>().ok().and_then(|i| items.get(i).cloned()).unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn equals(a: &Value, b: &Value) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(op: &str, a: &Value, b: &Value) -> std::result::Result<bool, String> {
    let ordering = match (a, b) {
        (Value::Number(_), Value::Number(_)) => {
            as_number(a).partial_cmp(&as_number(b)).ok_or_else(|| "numbers are not comparable".to_string())?
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => return Err(format!("cannot compare {a} {op} {b}")),
    };
    Ok(match op {
        "<" => ordering.is_lt(),
        "<=" => ordering.is_le(),
        ">" => ordering.is_gt(),
        _ => ordering.is_ge(),
    })
}

fn leaf(text: &str, value: Value) -> TraceNode {
    TraceNode { expr: text.to_string(), value, children: Vec::new() }
}

impl Node {
    fn eval(&self, env: &Value) -> std::result::Result<TraceNode, String> {
        match &self.kind {
            Kind::Lit(v) => Ok(leaf(&self.text, v.clone())),
            Kind::Path(root, segments) => {
                let mut current = lookup(env, &Value::String(root.clone()));
                for segment in segments {
                    let key = match segment {
                        Segment::Key(k) => Value::String(k.clone()),
                        Segment::Index(node) => node.eval(env)?.value,
                    };
                    current = lookup(&current, &key);
                }
                Ok(leaf(&self.text, current))
            }
            Kind::Not(operand) => {
                let inner = operand.eval(env)?;
                let value = Value::Bool(!truthy(&inner.value));
                Ok(TraceNode { expr: self.text.clone(), value, children: vec![inner] })
            }
            Kind::Binary(op, left, right) => {
                let l = left.eval(env)?;
                let short = match *op {
                    "&&" if !truthy(&l.value) => Some(false),
                    "||" if truthy(&l.value) => Some(true),
                    _ => None,
                };
                if let Some(result) = short {
                    return Ok(TraceNode {
                        expr: self.text.clone(),
                        value: Value::Bool(result),
                        children: vec![l],
                    });
                }
                let r = right.eval(env)?;
                let value = match *op {
                    "&&" | "||" => truthy(&r.value),
                    "==" => equals(&l.value, &r.value),
                    "!=" => !equals(&l.value, &r.value),
                    cmp => compare(cmp, &l.value, &r.value)?,
                };
                Ok(TraceNode { expr: self.text.clone(), value: Value::Bool(value), children: vec![l, r] })
            }
            Kind::Call(name, args) => {
                let args = args.iter().map(|a| a.eval(env)).collect::<std::result::Result<Vec<_>, _>>()?;
                let value = match (name.as_str(), args.as_slice()) {
                    ("len", [arg]) => {
                        let n = match &arg.value {
                            Value::Array(a) => a.len(),
                            Value::Object(o) => o.len(),
                            Value::String(s) => s.chars().count(),
                            Value::Null => 0,
                            other => return Err(format!("len() of {other}")),
                        };
                        Value::from(n)
                    }
                    _ => return Err(format!("unknown function {name}/{}", args.len())),
                };
                Ok(TraceNode { expr: self.text.clone(), value, children: args })
            }
        }
    }
}
