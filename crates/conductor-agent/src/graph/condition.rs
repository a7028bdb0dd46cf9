//! Boolean condition expressions for conditional edges.
//!
//! A small sandboxed language: the source is tokenized, parsed into an AST
//! and evaluated against a [`FieldResolver`]. Nothing is ever executed.
//!
//! ```text
//! expr       := or
//! or         := and ( ("||" | "or") and )*
//! and        := unary ( ("&&" | "and") unary )*
//! unary      := ("!" | "not") unary | comparison
//! comparison := primary ( op primary )?
//! op         := "==" | "!=" | "<" | "<=" | ">" | ">=" | "contains"
//! primary    := number | string | true | false | null | field | "(" expr ")"
//! field      := ident ( "." ident )*
//! ```

use serde_json::Value;

use conductor_core::error::{ConductorError, Result};

/// Supplies values for dotted field paths. Unknown paths resolve to `null`.
pub trait FieldResolver {
    fn resolve(&self, path: &[String]) -> Value;
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Field(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
}

/// A parsed condition, reusable across evaluations.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ConductorError::Expression("empty expression".into()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(ConductorError::Expression(format!(
                "unexpected token {:?} in '{}'",
                tok, source
            )));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn evaluate(&self, resolver: &dyn FieldResolver) -> Result<bool> {
        eval(&self.expr, resolver).map(|v| truthy(&v))
    }
}

/// Parse and evaluate in one go. Any parse or evaluation error reads as `false`.
pub fn evaluate_condition(source: &str, resolver: &dyn FieldResolver) -> bool {
    match Condition::parse(source).and_then(|c| c.evaluate(resolver)) {
        Ok(met) => met,
        Err(e) => {
            tracing::debug!(condition = %source, error = %e, "Condition treated as not met");
            false
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
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
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (tok, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Op(CmpOp::Eq), 2),
                    ('!', Some('=')) => (Token::Op(CmpOp::Ne), 2),
                    ('<', Some('=')) => (Token::Op(CmpOp::Le), 2),
                    ('>', Some('=')) => (Token::Op(CmpOp::Ge), 2),
                    ('<', _) => (Token::Op(CmpOp::Lt), 1),
                    ('>', _) => (Token::Op(CmpOp::Gt), 1),
                    ('!', _) => (Token::Not, 1),
                    _ => {
                        return Err(ConductorError::Expression(format!(
                            "unexpected '=' at {}",
                            i
                        )))
                    }
                };
                tokens.push(tok);
                i += width;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(ConductorError::Expression(format!(
                        "expected '{}{}' at {}",
                        c, c, i
                    )));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(ConductorError::Expression(
                                "unterminated string literal".into(),
                            ))
                        }
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                s.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| {
                    ConductorError::Expression(format!("invalid number '{}'", text))
                })?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '-'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "contains" => Token::Op(CmpOp::Contains),
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(ConductorError::Expression(format!(
                    "unexpected character '{}' at {}",
                    other, i
                )))
            }
        }
    }
    Ok(tokens)
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
        self.pos += 1;
        tok
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_primary()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::from(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => Ok(Expr::Field(
                name.split('.').map(String::from).collect(),
            )),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ConductorError::Expression("missing ')'".into())),
                }
            }
            Some(tok) => Err(ConductorError::Expression(format!(
                "unexpected token {:?}",
                tok
            ))),
            None => Err(ConductorError::Expression(
                "unexpected end of expression".into(),
            )),
        }
    }
}

fn eval(expr: &Expr, resolver: &dyn FieldResolver) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Field(path) => Ok(resolver.resolve(path)),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, resolver)?))),
        Expr::And(l, r) => {
            if !truthy(&eval(l, resolver)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(r, resolver)?)))
        }
        Expr::Or(l, r) => {
            if truthy(&eval(l, resolver)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(r, resolver)?)))
        }
        Expr::Compare(l, op, r) => {
            let left = eval(l, resolver)?;
            let right = eval(r, resolver)?;
            compare(&left, *op, &right).map(Value::Bool)
        }
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> Result<bool> {
    match op {
        CmpOp::Eq => Ok(loosely_equal(left, right)),
        CmpOp::Ne => Ok(!loosely_equal(left, right)),
        CmpOp::Contains => Ok(match (left, right) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|i| loosely_equal(i, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        }),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => {
                    let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                    a.partial_cmp(&b)
                }
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            let Some(ordering) = ordering else {
                return Err(ConductorError::Expression(format!(
                    "cannot order {} and {}",
                    type_name(left),
                    type_name(right)
                )));
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

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

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

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
