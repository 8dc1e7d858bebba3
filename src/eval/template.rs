//! `{placeholder}` string templates.
//!
//! A placeholder names a context binding followed by a chain of `.field`
//! attribute accesses and `[key]` single-key subscripts, with an optional
//! format spec after `:`. Literal braces are escaped by doubling.
//!
//! ```text
//! "{__camera__.name}-{num:04d}.fits"
//! "temp is {__camera__.status[ccd_temp]}"
//! ```

use super::{Context, EvalError, Value};

#[derive(Clone, Debug, PartialEq)]
enum Part {
    Literal(String),
    Field {
        path: Path,
        spec: Option<FormatSpec>,
    },
}

#[derive(Clone, Debug, PartialEq)]
struct Path {
    root: String,
    segments: Vec<Segment>,
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Attr(String),
    Key(String),
    Index(i64),
}

/// The supported format specs: `0Nd` zero-padded integers and `.Nf`
/// fixed-point floats.
#[derive(Clone, Debug, PartialEq)]
enum FormatSpec {
    ZeroInt { width: usize },
    Fixed { precision: usize },
}

/// A parsed template string.
#[derive(Clone, Debug, PartialEq)]
pub struct Template {
    src: String,
    parts: Vec<Part>,
}

impl Template {
    pub fn parse(src: &str) -> Result<Self, EvalError> {
        let mut parts: Vec<Part> = Vec::new();
        let mut literal = String::new();
        let mut chars = src.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '{' => {
                    if chars.peek() == Some(&'{') {
                        chars.next();
                        literal.push('{');
                        continue;
                    }
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    let mut field = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => field.push(c),
                            None => {
                                return Err(EvalError::UnclosedPlaceholder(src.to_string()));
                            }
                        }
                    }
                    parts.push(parse_field(&field)?);
                }
                '}' => {
                    if chars.peek() == Some(&'}') {
                        chars.next();
                        literal.push('}');
                    } else {
                        return Err(EvalError::UnmatchedBrace(src.to_string()));
                    }
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }

        Ok(Template {
            src: src.to_string(),
            parts,
        })
    }

    /// The original template text.
    pub fn source(&self) -> &str {
        &self.src
    }

    /// Whether the template contains no placeholders.
    pub fn is_literal(&self) -> bool {
        self.parts
            .iter()
            .all(|part| matches!(part, Part::Literal(_)))
    }

    /// The root names referenced by the placeholders, in order of
    /// appearance.
    pub fn roots(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|part| match part {
            Part::Field { path, .. } => Some(path.root.as_str()),
            Part::Literal(_) => None,
        })
    }

    /// Render the template against `context`.
    pub fn render(&self, context: &Context) -> Result<String, EvalError> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Field { path, spec } => {
                    let value = path.resolve(context)?;
                    match spec {
                        None => out.push_str(&value.render()?),
                        Some(spec) => out.push_str(&spec.apply(value)?),
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Path {
    fn resolve<'a>(&self, context: &'a Context) -> Result<&'a Value, EvalError> {
        let mut value = context.lookup(&self.root)?;
        for segment in &self.segments {
            value = match segment {
                Segment::Attr(field) => value.attr(field)?,
                Segment::Key(key) => value.index(&Value::Str(key.clone()))?,
                Segment::Index(index) => value.index(&Value::Int(*index))?,
            };
        }
        Ok(value)
    }
}

impl FormatSpec {
    fn parse(spec: &str) -> Result<Self, EvalError> {
        let bad = || EvalError::BadFormatSpec(spec.to_string());

        if let Some(digits) = spec.strip_prefix('0').and_then(|s| s.strip_suffix('d')) {
            let width: usize = digits.parse().map_err(|_| bad())?;
            return Ok(FormatSpec::ZeroInt { width });
        }
        if let Some(digits) = spec.strip_prefix('.').and_then(|s| s.strip_suffix('f')) {
            let precision: usize = digits.parse().map_err(|_| bad())?;
            return Ok(FormatSpec::Fixed { precision });
        }
        Err(bad())
    }

    fn apply(&self, value: &Value) -> Result<String, EvalError> {
        match (self, value) {
            (FormatSpec::ZeroInt { width }, Value::Int(i)) => {
                Ok(format!("{i:0width$}", width = *width))
            }
            (FormatSpec::Fixed { precision }, value) => match value.as_f64() {
                Some(f) => Ok(format!("{f:.precision$}", precision = *precision)),
                None => Err(EvalError::BadFormatValue {
                    spec: self.describe(),
                    on: value.type_name(),
                }),
            },
            (spec, value) => Err(EvalError::BadFormatValue {
                spec: spec.describe(),
                on: value.type_name(),
            }),
        }
    }

    fn describe(&self) -> String {
        match self {
            FormatSpec::ZeroInt { width } => format!("0{width}d"),
            FormatSpec::Fixed { precision } => format!(".{precision}f"),
        }
    }
}

fn parse_field(field: &str) -> Result<Part, EvalError> {
    let (path_text, spec_text) = match field.split_once(':') {
        Some((path, spec)) => (path, Some(spec)),
        None => (field, None),
    };

    let bad = |found: &str| EvalError::UnexpectedToken {
        found: format!("{found:?} in placeholder {field:?}"),
        at: 0,
    };

    let mut chars = path_text.chars().peekable();
    let root = take_ident(&mut chars);
    if root.is_empty() {
        return Err(bad(path_text));
    }

    let mut segments = Vec::new();
    while let Some(&ch) = chars.peek() {
        match ch {
            '.' => {
                chars.next();
                let field_name = take_ident(&mut chars);
                if field_name.is_empty() {
                    return Err(bad("."));
                }
                segments.push(Segment::Attr(field_name));
            }
            '[' => {
                chars.next();
                let mut key = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(c) => key.push(c),
                        None => return Err(bad("[")),
                    }
                }
                let key = key.trim().trim_matches(|c| c == '\'' || c == '"');
                if key.is_empty() {
                    return Err(bad("[]"));
                }
                match key.parse::<i64>() {
                    Ok(index) => segments.push(Segment::Index(index)),
                    Err(_) => segments.push(Segment::Key(key.to_string())),
                }
            }
            other => return Err(bad(&other.to_string())),
        }
    }

    let spec = spec_text.map(FormatSpec::parse).transpose()?;

    Ok(Part::Field {
        path: Path { root, segments },
        spec,
    })
}

fn take_ident(chars: &mut std::iter::Peekable<std::str::Chars>) -> String {
    let mut ident = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_alphanumeric() || c == '_' {
            ident.push(c);
            chars.next();
        } else {
            break;
        }
    }
    ident
}
