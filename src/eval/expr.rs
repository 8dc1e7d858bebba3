//! A restricted expression language for cards that need more than template
//! substitution.
//!
//! The grammar covers attribute access, single-key subscripts, arithmetic
//! and literal comparisons over context values:
//!
//! ```text
//! comparison  := additive (("==" | "!=" | "<" | "<=" | ">" | ">=") additive)?
//! additive    := multiplicative (("+" | "-") multiplicative)*
//! multiplicative := unary (("*" | "/") unary)*
//! unary       := "-" unary | postfix
//! postfix     := primary ("." ident | "[" comparison "]")*
//! primary     := ident | int | float | string | "true" | "false" | "null"
//!              | "(" comparison ")"
//! ```
//!
//! There are no function calls, no assignments and no access to anything
//! outside the [`Context`] the expression is evaluated against.

use super::{Context, EvalError, Value};

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Plus,
    Minus,
    Star,
    Slash,
    EqEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier {name:?}"),
            Token::Int(i) => format!("integer {i}"),
            Token::Float(f) => format!("float {f}"),
            Token::Str(s) => format!("string {s:?}"),
            Token::Plus => "'+'".into(),
            Token::Minus => "'-'".into(),
            Token::Star => "'*'".into(),
            Token::Slash => "'/'".into(),
            Token::EqEq => "'=='".into(),
            Token::Ne => "'!='".into(),
            Token::Lt => "'<'".into(),
            Token::Le => "'<='".into(),
            Token::Gt => "'>'".into(),
            Token::Ge => "'>='".into(),
            Token::Dot => "'.'".into(),
            Token::LBracket => "'['".into(),
            Token::RBracket => "']'".into(),
            Token::LParen => "'('".into(),
            Token::RParen => "')'".into(),
        }
    }
}

fn lex(src: &str) -> Result<Vec<(Token, usize)>, EvalError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut at = 0;

    while at < chars.len() {
        let ch = chars[at];
        match ch {
            c if c.is_whitespace() => at += 1,
            '+' => {
                tokens.push((Token::Plus, at));
                at += 1;
            }
            '-' => {
                tokens.push((Token::Minus, at));
                at += 1;
            }
            '*' => {
                tokens.push((Token::Star, at));
                at += 1;
            }
            '/' => {
                tokens.push((Token::Slash, at));
                at += 1;
            }
            '.' => {
                tokens.push((Token::Dot, at));
                at += 1;
            }
            '[' => {
                tokens.push((Token::LBracket, at));
                at += 1;
            }
            ']' => {
                tokens.push((Token::RBracket, at));
                at += 1;
            }
            '(' => {
                tokens.push((Token::LParen, at));
                at += 1;
            }
            ')' => {
                tokens.push((Token::RParen, at));
                at += 1;
            }
            '=' => {
                if chars.get(at + 1) == Some(&'=') {
                    tokens.push((Token::EqEq, at));
                    at += 2;
                } else {
                    return Err(EvalError::UnexpectedChar { ch, at });
                }
            }
            '!' => {
                if chars.get(at + 1) == Some(&'=') {
                    tokens.push((Token::Ne, at));
                    at += 2;
                } else {
                    return Err(EvalError::UnexpectedChar { ch, at });
                }
            }
            '<' => {
                if chars.get(at + 1) == Some(&'=') {
                    tokens.push((Token::Le, at));
                    at += 2;
                } else {
                    tokens.push((Token::Lt, at));
                    at += 1;
                }
            }
            '>' => {
                if chars.get(at + 1) == Some(&'=') {
                    tokens.push((Token::Ge, at));
                    at += 2;
                } else {
                    tokens.push((Token::Gt, at));
                    at += 1;
                }
            }
            '\'' | '"' => {
                let quote = ch;
                let start = at;
                let mut text = String::new();
                at += 1;
                loop {
                    match chars.get(at) {
                        Some(&c) if c == quote => {
                            at += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = chars.get(at + 1).ok_or(EvalError::UnexpectedEnd)?;
                            text.push(*escaped);
                            at += 2;
                        }
                        Some(&c) => {
                            text.push(c);
                            at += 1;
                        }
                        None => return Err(EvalError::UnexpectedEnd),
                    }
                }
                tokens.push((Token::Str(text), start));
            }
            c if c.is_ascii_digit() => {
                let start = at;
                while at < chars.len() && chars[at].is_ascii_digit() {
                    at += 1;
                }
                let mut is_float = false;
                if chars.get(at) == Some(&'.')
                    && chars.get(at + 1).is_some_and(|c| c.is_ascii_digit())
                {
                    is_float = true;
                    at += 1;
                    while at < chars.len() && chars[at].is_ascii_digit() {
                        at += 1;
                    }
                }
                let text: String = chars[start..at].iter().collect();
                let token = if is_float {
                    Token::Float(text.parse().map_err(|_| EvalError::UnexpectedToken {
                        found: format!("number {text:?}"),
                        at: start,
                    })?)
                } else {
                    Token::Int(text.parse().map_err(|_| EvalError::UnexpectedToken {
                        found: format!("number {text:?}"),
                        at: start,
                    })?)
                };
                tokens.push((token, start));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = at;
                while at < chars.len() && (chars[at].is_ascii_alphanumeric() || chars[at] == '_') {
                    at += 1;
                }
                let text: String = chars[start..at].iter().collect();
                tokens.push((Token::Ident(text), start));
            }
            _ => return Err(EvalError::UnexpectedChar { ch, at }),
        }
    }

    Ok(tokens)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        }
    }
}

/// A parsed expression, ready to evaluate against a [`Context`].
///
/// The node tree is opaque; expressions are built with [`Expr::parse`] and
/// consumed with [`Expr::eval`].
#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    root: Node,
}

#[derive(Clone, Debug, PartialEq)]
enum Node {
    Literal(Value),
    Ident(String),
    Attr(Box<Node>, String),
    Index(Box<Node>, Box<Node>),
    Neg(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    at: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.at).map(|(token, _)| token)
    }

    fn bump(&mut self) -> Result<(Token, usize), EvalError> {
        let entry = self
            .tokens
            .get(self.at)
            .cloned()
            .ok_or(EvalError::UnexpectedEnd)?;
        self.at += 1;
        Ok(entry)
    }

    fn expect(&mut self, expected: Token) -> Result<(), EvalError> {
        let (token, offset) = self.bump()?;
        if token == expected {
            Ok(())
        } else {
            Err(EvalError::UnexpectedToken {
                found: token.describe(),
                at: offset,
            })
        }
    }

    fn comparison(&mut self) -> Result<Node, EvalError> {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Some(Token::EqEq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            _ => return Ok(lhs),
        };
        self.bump()?;
        let rhs = self.additive()?;
        Ok(Node::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn additive(&mut self) -> Result<Node, EvalError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.bump()?;
            let rhs = self.multiplicative()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> Result<Node, EvalError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.bump()?;
            let rhs = self.unary()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Node, EvalError> {
        if self.peek() == Some(&Token::Minus) {
            self.bump()?;
            return Ok(Node::Neg(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Node, EvalError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.bump()?;
                    let (token, offset) = self.bump()?;
                    let Token::Ident(field) = token else {
                        return Err(EvalError::UnexpectedToken {
                            found: token.describe(),
                            at: offset,
                        });
                    };
                    expr = Node::Attr(Box::new(expr), field);
                }
                Some(Token::LBracket) => {
                    self.bump()?;
                    let key = self.comparison()?;
                    self.expect(Token::RBracket)?;
                    expr = Node::Index(Box::new(expr), Box::new(key));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> Result<Node, EvalError> {
        let (token, offset) = self.bump()?;
        match token {
            Token::Ident(name) => Ok(match name.as_str() {
                "true" => Node::Literal(Value::Bool(true)),
                "false" => Node::Literal(Value::Bool(false)),
                "null" => Node::Literal(Value::Null),
                _ => Node::Ident(name),
            }),
            Token::Int(i) => Ok(Node::Literal(Value::Int(i))),
            Token::Float(f) => Ok(Node::Literal(Value::Float(f))),
            Token::Str(s) => Ok(Node::Literal(Value::Str(s))),
            Token::LParen => {
                let inner = self.comparison()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            other => Err(EvalError::UnexpectedToken {
                found: other.describe(),
                at: offset,
            }),
        }
    }
}

impl Expr {
    /// Parse `src` into an expression tree.
    pub fn parse(src: &str) -> Result<Self, EvalError> {
        let mut parser = Parser {
            tokens: lex(src)?,
            at: 0,
        };
        let root = parser.comparison()?;
        if let Some((token, offset)) = parser.tokens.get(parser.at) {
            return Err(EvalError::UnexpectedToken {
                found: token.describe(),
                at: *offset,
            });
        }
        Ok(Expr { root })
    }

    /// Evaluate against `context`. Identifiers resolve to context bindings;
    /// unknown names and bad paths are errors.
    pub fn eval(&self, context: &Context) -> Result<Value, EvalError> {
        self.root.eval(context)
    }
}

impl Node {
    fn eval(&self, context: &Context) -> Result<Value, EvalError> {
        match self {
            Node::Literal(value) => Ok(value.clone()),
            Node::Ident(name) => context.lookup(name).cloned(),
            Node::Attr(base, field) => base.eval(context)?.attr(field).cloned(),
            Node::Index(base, key) => {
                let base = base.eval(context)?;
                let key = key.eval(context)?;
                base.index(&key).cloned()
            }
            Node::Neg(inner) => match inner.eval(context)? {
                Value::Int(i) => Ok(Value::Int(-i)),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(EvalError::BadOperands {
                    op: "-",
                    lhs: other.type_name(),
                    rhs: "nothing",
                }),
            },
            Node::Binary(op, lhs, rhs) => {
                let lhs = lhs.eval(context)?;
                let rhs = rhs.eval(context)?;
                apply(*op, &lhs, &rhs)
            }
        }
    }
}

fn apply(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    use std::cmp::Ordering;

    let mismatch = || EvalError::BadOperands {
        op: op.symbol(),
        lhs: lhs.type_name(),
        rhs: rhs.type_name(),
    };

    match op {
        BinOp::Add => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
            _ => numeric(lhs, rhs)
                .map(|(a, b)| Value::Float(a + b))
                .ok_or_else(mismatch),
        },
        BinOp::Sub => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a - b)),
            _ => numeric(lhs, rhs)
                .map(|(a, b)| Value::Float(a - b))
                .ok_or_else(mismatch),
        },
        BinOp::Mul => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a * b)),
            _ => numeric(lhs, rhs)
                .map(|(a, b)| Value::Float(a * b))
                .ok_or_else(mismatch),
        },
        // Division always promotes to float; header consumers that want an
        // integer set an explicit card type.
        BinOp::Div => numeric(lhs, rhs)
            .map(|(a, b)| Value::Float(a / b))
            .ok_or_else(mismatch),
        BinOp::Eq | BinOp::Ne => {
            let equal = match (lhs, rhs) {
                (Value::Null, Value::Null) => true,
                (Value::Bool(a), Value::Bool(b)) => a == b,
                (Value::Str(a), Value::Str(b)) => a == b,
                _ => match numeric(lhs, rhs) {
                    Some((a, b)) => a == b,
                    None => return Err(mismatch()),
                },
            };
            Ok(Value::Bool(if op == BinOp::Eq { equal } else { !equal }))
        }
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (lhs, rhs) {
                (Value::Str(a), Value::Str(b)) => a.cmp(b),
                _ => match numeric(lhs, rhs) {
                    Some((a, b)) => a.partial_cmp(&b).ok_or_else(mismatch)?,
                    None => return Err(mismatch()),
                },
            };
            Ok(Value::Bool(match op {
                BinOp::Lt => ordering == Ordering::Less,
                BinOp::Le => ordering != Ordering::Greater,
                BinOp::Gt => ordering == Ordering::Greater,
                BinOp::Ge => ordering != Ordering::Less,
                _ => unreachable!(),
            }))
        }
    }
}

fn numeric(lhs: &Value, rhs: &Value) -> Option<(f64, f64)> {
    Some((lhs.as_f64()?, rhs.as_f64()?))
}
