//! Step condition evaluator.
//!
//! Conditions are small boolean expressions over the results of earlier
//! steps and the execution context, e.g.
//! `steps.s1.status === 'completed' && steps.scout.result.name != null`.
//! The grammar is closed: literals, member paths rooted at `steps` or
//! `context`, comparisons, `!`, `&&`, `||` and parentheses. Nothing in an
//! expression can reach host code.
//!
//! [`evaluate`] reports failures as [`ConditionError`]. The executor goes
//! through [`is_met`], which turns any failure into "not met" and logs it.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::state_machine::{Step, StepStatus};

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionError {
    #[error("empty condition")]
    Empty,

    #[error("unexpected character `{ch}` at {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unterminated string starting at {0}")]
    UnterminatedString(usize),

    #[error("invalid number `{0}`")]
    InvalidNumber(String),

    #[error("unexpected {found} at {pos}")]
    UnexpectedToken { found: String, pos: usize },

    #[error("unexpected end of condition")]
    UnexpectedEnd,

    #[error("condition nests deeper than {MAX_DEPTH} levels")]
    TooDeep,

    #[error("unknown identifier `{0}`")]
    UnknownIdentifier(String),

    #[error("no earlier step with id or name `{0}`")]
    UnknownStep(String),

    #[error("cannot read `{member}` of {on}")]
    BadMemberAccess { member: String, on: &'static str },

    #[error("cannot compare {left} {op} {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },
}

/// What a condition can see of one earlier step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepView {
    pub id: String,
    pub name: Option<String>,
    pub status: StepStatus,
    pub result: Value,
}

impl StepView {
    fn to_value(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "status": self.status,
            "result": self.result,
        })
    }
}

impl From<&Step> for StepView {
    fn from(step: &Step) -> Self {
        Self {
            id: step.id.clone(),
            name: step.name.clone(),
            status: step.status,
            result: step.result.clone().unwrap_or(Value::Null),
        }
    }
}

/// Lookup table of earlier steps, addressable by id and by name.
#[derive(Debug, Clone, Default)]
pub struct StepLookup {
    entries: HashMap<String, StepView>,
}

impl StepLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: &Step) {
        let view = StepView::from(step);
        if let Some(name) = &view.name {
            self.entries.insert(name.clone(), view.clone());
        }
        self.entries.insert(view.id.clone(), view);
    }

    pub fn get(&self, key: &str) -> Option<&StepView> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Fail-closed entry point: any evaluation error means "not met".
pub fn is_met(expression: &str, steps: &StepLookup, context: &Value) -> bool {
    match evaluate(expression, steps, context) {
        Ok(met) => met,
        Err(e) => {
            warn!(condition = expression, error = %e, "Condition could not be evaluated, treating as not met");
            false
        }
    }
}

/// Parses and evaluates `expression`, reducing the value by truthiness.
pub fn evaluate(expression: &str, steps: &StepLookup, context: &Value) -> Result<bool, ConditionError> {
    let expr = parse(expression)?;
    let scope = Scope { steps, context };
    Ok(truthy(&scope.eval(&expr)?))
}

// ---- lexer ----

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Not,
    And,
    Or,
    Op(CmpOp),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("identifier `{s}`"),
            Token::Str(s) => format!("string '{s}'"),
            Token::Num(n) => format!("number {n}"),
            Token::Dot => "`.`".into(),
            Token::LBracket => "`[`".into(),
            Token::RBracket => "`]`".into(),
            Token::LParen => "`(`".into(),
            Token::RParen => "`)`".into(),
            Token::Not => "`!`".into(),
            Token::And => "`&&`".into(),
            Token::Or => "`||`".into(),
            Token::Op(op) => format!("`{}`", op.symbol()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<(Token, usize)>, ConditionError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '.' if !next.is_some_and(|n| n.is_ascii_digit()) => {
                tokens.push((Token::Dot, start));
                i += 1;
            }
            '[' => {
                tokens.push((Token::LBracket, start));
                i += 1;
            }
            ']' => {
                tokens.push((Token::RBracket, start));
                i += 1;
            }
            '(' => {
                tokens.push((Token::LParen, start));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, start));
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push((Token::And, start));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push((Token::Or, start));
                i += 2;
            }
            '=' | '!' => {
                // `===`/`==` and `!==`/`!=` mean the same thing here.
                let op_len = match (next, chars.get(i + 2).copied()) {
                    (Some('='), Some('=')) => 3,
                    (Some('='), _) => 2,
                    _ => 1,
                };
                match (c, op_len) {
                    ('!', 1) => tokens.push((Token::Not, start)),
                    ('=', 1) => return Err(ConditionError::UnexpectedChar { ch: c, pos: start }),
                    ('=', _) => tokens.push((Token::Op(CmpOp::Eq), start)),
                    _ => tokens.push((Token::Op(CmpOp::Ne), start)),
                }
                i += op_len;
            }
            '<' | '>' => {
                let or_equal = next == Some('=');
                let op = match (c, or_equal) {
                    ('<', false) => CmpOp::Lt,
                    ('<', true) => CmpOp::Le,
                    ('>', false) => CmpOp::Gt,
                    _ => CmpOp::Ge,
                };
                tokens.push((Token::Op(op), start));
                i += if or_equal { 2 } else { 1 };
            }
            '\'' | '"' => {
                let (s, end) = read_string(&chars, i)?;
                tokens.push((Token::Str(s), start));
                i = end;
            }
            c if c.is_ascii_digit() || c == '.' || (c == '-' && next.is_some_and(|n| n.is_ascii_digit() || n == '.')) => {
                let mut end = i + 1;
                while end < chars.len() && (chars[end].is_ascii_digit() || chars[end] == '.') {
                    end += 1;
                }
                let text: String = chars[i..end].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ConditionError::InvalidNumber(text.clone()))?;
                tokens.push((Token::Num(n), start));
                i = end;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut end = i + 1;
                while end < chars.len()
                    && (chars[end].is_alphanumeric() || chars[end] == '_' || chars[end] == '$')
                {
                    end += 1;
                }
                tokens.push((Token::Ident(chars[i..end].iter().collect()), start));
                i = end;
            }
            other => return Err(ConditionError::UnexpectedChar { ch: other, pos: start }),
        }
    }
    Ok(tokens)
}

fn read_string(chars: &[char], open: usize) -> Result<(String, usize), ConditionError> {
    let quote = chars[open];
    let mut out = String::new();
    let mut i = open + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or(ConditionError::UnterminatedString(open))?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => *other,
                });
                i += 2;
            }
            c if c == quote => return Ok((out, i + 1)),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(ConditionError::UnterminatedString(open))
}

// ---- parser ----

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(String, Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

fn parse(src: &str) -> Result<Expr, ConditionError> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err(ConditionError::Empty);
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.or()?;
    match parser.peek() {
        None => Ok(expr),
        Some((tok, pos)) => Err(ConditionError::UnexpectedToken {
            found: tok.describe(),
            pos: *pos,
        }),
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&(Token, usize)> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<(Token, usize), ConditionError> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ConditionError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(tok)
    }

    fn eat(&mut self, want: &Token) -> bool {
        if self.peek().is_some_and(|(t, _)| t == want) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn descend(&mut self) -> Result<(), ConditionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ConditionError::TooDeep);
        }
        Ok(())
    }

    fn or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.unary()?;
        while self.eat(&Token::And) {
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        if self.eat(&Token::Not) {
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, ConditionError> {
        let left = self.primary()?;
        if let Some((Token::Op(op), _)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.primary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr, ConditionError> {
        let (tok, pos) = self.next()?;
        match tok {
            Token::Num(n) => Ok(Expr::Literal(serde_json::json!(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                self.descend()?;
                let inner = self.or()?;
                self.depth -= 1;
                match self.next()? {
                    (Token::RParen, _) => Ok(inner),
                    (other, pos) => Err(ConditionError::UnexpectedToken {
                        found: other.describe(),
                        pos,
                    }),
                }
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "undefined" => Ok(Expr::Literal(Value::Null)),
                _ => self.path(name),
            },
            other => Err(ConditionError::UnexpectedToken {
                found: other.describe(),
                pos,
            }),
        }
    }

    fn path(&mut self, root: String) -> Result<Expr, ConditionError> {
        let mut members = Vec::new();
        loop {
            if self.eat(&Token::Dot) {
                match self.next()? {
                    (Token::Ident(member), _) => members.push(member),
                    (other, pos) => {
                        return Err(ConditionError::UnexpectedToken {
                            found: other.describe(),
                            pos,
                        });
                    }
                }
            } else if self.eat(&Token::LBracket) {
                let member = match self.next()? {
                    (Token::Str(s), _) => s,
                    (Token::Num(n), _) if n >= 0.0 && n.fract() == 0.0 => format!("{n}"),
                    (other, pos) => {
                        return Err(ConditionError::UnexpectedToken {
                            found: other.describe(),
                            pos,
                        });
                    }
                };
                match self.next()? {
                    (Token::RBracket, _) => members.push(member),
                    (other, pos) => {
                        return Err(ConditionError::UnexpectedToken {
                            found: other.describe(),
                            pos,
                        });
                    }
                }
            } else {
                return Ok(Expr::Path(root, members));
            }
        }
    }
}

// ---- evaluation ----

struct Scope<'a> {
    steps: &'a StepLookup,
    context: &'a Value,
}

impl Scope<'_> {
    fn eval(&self, expr: &Expr) -> Result<Value, ConditionError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(root, members) => self.resolve(root, members),
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&self.eval(inner)?))),
            Expr::And(l, r) => {
                let left = self.eval(l)?;
                if !truthy(&left) {
                    return Ok(left);
                }
                self.eval(r)
            }
            Expr::Or(l, r) => {
                let left = self.eval(l)?;
                if truthy(&left) {
                    return Ok(left);
                }
                self.eval(r)
            }
            Expr::Compare(op, l, r) => compare(*op, &self.eval(l)?, &self.eval(r)?).map(Value::Bool),
        }
    }

    fn resolve(&self, root: &str, members: &[String]) -> Result<Value, ConditionError> {
        let (mut current, rest) = match root {
            "context" => (self.context.clone(), members),
            "steps" => match members.split_first() {
                None => (self.steps_object(), members),
                Some((key, rest)) => {
                    let view = self
                        .steps
                        .get(key)
                        .ok_or_else(|| ConditionError::UnknownStep(key.clone()))?;
                    (view.to_value(), rest)
                }
            },
            other => return Err(ConditionError::UnknownIdentifier(other.to_string())),
        };

        for member in rest {
            current = match current {
                Value::Object(mut map) => map.remove(member).unwrap_or(Value::Null),
                Value::Array(mut items) => match member.parse::<usize>() {
                    Ok(i) if i < items.len() => items.swap_remove(i),
                    _ if member == "length" => serde_json::json!(items.len()),
                    _ => Value::Null,
                },
                other => {
                    return Err(ConditionError::BadMemberAccess {
                        member: member.clone(),
                        on: type_name(&other),
                    });
                }
            };
        }
        Ok(current)
    }

    fn steps_object(&self) -> Value {
        Value::Object(
            self.steps
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.to_value()))
                .collect(),
        )
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, ConditionError> {
    match op {
        CmpOp::Eq => Ok(json_eq(left, right)),
        CmpOp::Ne => Ok(!json_eq(left, right)),
        _ => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => {
                    let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                    a.partial_cmp(&b)
                }
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => {
                    return Err(ConditionError::TypeMismatch {
                        op: op.symbol(),
                        left: type_name(left),
                        right: type_name(right),
                    });
                }
            };
            let Some(ordering) = ordering else {
                return Ok(false);
            };
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
    }
}

fn json_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
