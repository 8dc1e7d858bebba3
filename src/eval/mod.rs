//! Context values and the restricted evaluation engine behind deferred
//! header cards.
//!
//! Header models defer their values until an exposure exists. At that point
//! every card is resolved against a [`Context`]: a string-keyed tree of
//! [`Value`] nodes built from the exposure, the camera that took it, and any
//! extra bindings the caller supplies. Two evaluation forms operate on the
//! context:
//!
//! - [`Template`]s substitute `{path}` placeholders inside a string.
//! - [`Expr`]s are parsed, restricted expressions (`__camera__.status[gain]
//!   * 2`) with no general evaluation capability.

use std::collections::BTreeMap;
use thiserror::Error;

mod expr;
mod template;

pub use expr::Expr;
pub use template::Template;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("unexpected character {ch:?} at offset {at}")]
    UnexpectedChar { ch: char, at: usize },
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("unexpected token {found} at offset {at}")]
    UnexpectedToken { found: String, at: usize },
    #[error("unknown name: {0}")]
    UnknownName(String),
    #[error("value of type {on} has no field {field:?}")]
    MissingField { on: &'static str, field: String },
    #[error("cannot index value of type {on} with {key}")]
    BadIndex { on: &'static str, key: String },
    #[error("index {index} out of bounds for list of length {len}")]
    OutOfBounds { index: i64, len: usize },
    #[error("operator {op} is not defined for {lhs} and {rhs}")]
    BadOperands {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },
    #[error("cannot render value of type {0} into a string")]
    Unrenderable(&'static str),
    #[error("unclosed placeholder in template {0:?}")]
    UnclosedPlaceholder(String),
    #[error("unmatched '}}' in template {0:?}")]
    UnmatchedBrace(String),
    #[error("invalid format spec {0:?}")]
    BadFormatSpec(String),
    #[error("format spec {spec:?} cannot be applied to {on}")]
    BadFormatValue { spec: String, on: &'static str },
}

/// A value the evaluation engine can produce or traverse.
///
/// `Str`, `Int`, `Float`, `Bool` and `Null` are the FITS-legal card scalars.
/// `Map` and `List` only appear as interior nodes of the context tree, never
/// in an evaluated card.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    Map(BTreeMap<String, Value>),
    List(Vec<Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "str",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Null => "null",
            Value::Map(_) => "map",
            Value::List(_) => "list",
        }
    }

    /// Whether this value may appear in an evaluated card.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::Map(_) | Value::List(_))
    }

    /// Field lookup, defined for `Map` values only.
    pub fn attr(&self, field: &str) -> Result<&Value, EvalError> {
        match self {
            Value::Map(map) => map.get(field).ok_or_else(|| EvalError::MissingField {
                on: "map",
                field: field.to_string(),
            }),
            other => Err(EvalError::MissingField {
                on: other.type_name(),
                field: field.to_string(),
            }),
        }
    }

    /// Single-key subscript access: string keys on maps, integer indices on
    /// lists.
    pub fn index(&self, key: &Value) -> Result<&Value, EvalError> {
        match (self, key) {
            (Value::Map(map), Value::Str(name)) => {
                map.get(name).ok_or_else(|| EvalError::MissingField {
                    on: "map",
                    field: name.clone(),
                })
            }
            (Value::List(items), Value::Int(index)) => {
                let at = usize::try_from(*index).map_err(|_| EvalError::OutOfBounds {
                    index: *index,
                    len: items.len(),
                })?;
                items.get(at).ok_or(EvalError::OutOfBounds {
                    index: *index,
                    len: items.len(),
                })
            }
            (on, key) => Err(EvalError::BadIndex {
                on: on.type_name(),
                key: format!("{} key", key.type_name()),
            }),
        }
    }

    /// Stringify a scalar for template interpolation.
    ///
    /// Floats keep a decimal point (`1.0`, not `1`) so a rendered number
    /// parses back to the type it came from. `Null`, `Map` and `List` do not
    /// render.
    pub fn render(&self) -> Result<String, EvalError> {
        match self {
            Value::Str(s) => Ok(s.clone()),
            Value::Int(i) => Ok(i.to_string()),
            Value::Float(f) => Ok(render_float(*f)),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(EvalError::Unrenderable(other.type_name())),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

fn render_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// The bindings a card, template or expression is evaluated against.
///
/// Exposure evaluation inserts the reserved `__exposure__` and `__camera__`
/// keys after any caller bindings, so callers can never shadow them.
#[derive(Clone, Debug, Default)]
pub struct Context {
    bindings: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.bindings.insert(name.into(), value.into());
    }

    /// Consuming insert, for building contexts inline.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub(crate) fn lookup(&self, name: &str) -> Result<&Value, EvalError> {
        self.bindings
            .get(name)
            .ok_or_else(|| EvalError::UnknownName(name.to_string()))
    }
}
