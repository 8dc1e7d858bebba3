//! Single header cards and their composition units.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use super::{BoxError, CardError, DefaultCardSet};
use crate::eval::{Context, Expr, Template, Value};
use crate::exposure::Exposure;

/// Signature for callable card values. Arguments are the card's `fargs`,
/// resolved against the context before the call.
pub type CardFn = Arc<dyn Fn(&[Value]) -> Result<Value, BoxError> + Send + Sync>;

/// The value of a [`Card`] before evaluation.
///
/// Exactly one evaluation mode holds per card, carried by the variant:
/// literal passthrough, template substitution, expression evaluation, or
/// callable invocation.
#[derive(Clone)]
pub enum CardValue {
    /// Used unchanged (after casting).
    Literal(Value),
    /// A `{...}` template, substituted against the context. Parsing is
    /// deferred to evaluation so a malformed template routes through the
    /// card's default like any other resolution failure.
    Template(String),
    /// A parsed expression, evaluated with the context keys as bindings.
    Expr(Expr),
    /// A callable invoked with resolved `fargs`.
    Callable { f: CardFn, fargs: Vec<CardValue> },
}

impl fmt::Debug for CardValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CardValue::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            CardValue::Template(raw) => f.debug_tuple("Template").field(raw).finish(),
            CardValue::Expr(expr) => f.debug_tuple("Expr").field(expr).finish(),
            CardValue::Callable { fargs, .. } => {
                f.debug_struct("Callable").field("fargs", fargs).finish()
            }
        }
    }
}

impl From<Value> for CardValue {
    fn from(value: Value) -> Self {
        CardValue::Literal(value)
    }
}

impl From<&str> for CardValue {
    fn from(raw: &str) -> Self {
        CardValue::Template(raw.to_string())
    }
}

impl From<String> for CardValue {
    fn from(raw: String) -> Self {
        CardValue::Template(raw)
    }
}

impl From<Expr> for CardValue {
    fn from(expr: Expr) -> Self {
        CardValue::Expr(expr)
    }
}

macro_rules! literal_card_value {
    ($($ty:ty),*) => {
        $(impl From<$ty> for CardValue {
            fn from(value: $ty) -> Self {
                CardValue::Literal(value.into())
            }
        })*
    };
}

literal_card_value!(i64, i32, u32, f64, bool);

impl CardValue {
    fn resolve(&self, card: &str, context: &Context) -> Result<Value, CardError> {
        let evaluation = |source: BoxError| CardError::Evaluation {
            card: card.to_string(),
            source,
        };

        match self {
            CardValue::Literal(value) => Ok(value.clone()),
            CardValue::Template(raw) => {
                let template = Template::parse(raw).map_err(|e| evaluation(e.into()))?;
                let rendered = template.render(context).map_err(|e| evaluation(e.into()))?;
                Ok(Value::Str(rendered))
            }
            CardValue::Expr(expr) => expr.eval(context).map_err(|e| evaluation(e.into())),
            CardValue::Callable { f, fargs } => {
                let args = fargs
                    .iter()
                    .map(|arg| arg.resolve(card, context))
                    .collect::<Result<Vec<_>, _>>()?;
                f(&args).map_err(evaluation)
            }
        }
    }
}

/// Target type for explicit card casting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CardType {
    Str,
    Int,
    Float,
    Bool,
}

impl fmt::Display for CardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CardType::Str => "str",
            CardType::Int => "int",
            CardType::Float => "float",
            CardType::Bool => "bool",
        })
    }
}

/// The result of evaluating a [`Card`]: a concrete keyword, scalar value
/// and comment. Never mutated after creation.
#[derive(Clone, Debug, PartialEq)]
pub struct EvaluatedCard {
    name: String,
    value: Value,
    comment: String,
}

impl EvaluatedCard {
    pub fn new(name: impl Into<String>, value: impl Into<Value>, comment: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            comment: comment.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }
}

/// A single deferred header keyword.
///
/// The value is resolved when [`Card::evaluate`] runs, against a context
/// holding `__exposure__`, `__camera__` and any caller bindings. See
/// [`CardValue`] for the evaluation modes.
///
/// Casting: an explicit [`CardType`] wins; otherwise, when `autocast` is
/// on and the resolved value is a string, the card tries integer, then
/// float, then `true`/`false`, and keeps the string if none parse. The
/// precedence means `"1"` becomes integer 1, never a boolean; downstream
/// header consumers rely on this. `autocast` defaults to on unless an
/// explicit type or an expression value is set.
#[derive(Clone, Debug)]
pub struct Card {
    name: String,
    value: CardValue,
    comment: String,
    cast: Option<CardType>,
    autocast: Option<bool>,
    default: Option<Value>,
}

impl Card {
    /// Create a card. String values are treated as templates; literals and
    /// parsed expressions pass through [`CardValue`] conversions.
    ///
    /// Keyword names are uppercased and trimmed to the FITS limit of eight
    /// characters (with a warning).
    pub fn new(name: &str, value: impl Into<CardValue>) -> Self {
        let mut name = name.to_uppercase();
        if name.len() > 8 {
            warn!(card = %name, "trimming keyword to 8 characters");
            name.truncate(8);
        }

        Self {
            name,
            value: value.into(),
            comment: String::new(),
            cast: None,
            autocast: None,
            default: None,
        }
    }

    /// Create a card whose value is a source expression, parsed now.
    /// Parse failure is a construction error.
    pub fn expr(name: &str, source: &str) -> Result<Self, CardError> {
        let expr = Expr::parse(source).map_err(|e| CardError::Evaluation {
            card: name.to_uppercase(),
            source: e.into(),
        })?;
        Ok(Self::new(name, CardValue::Expr(expr)))
    }

    /// Create a card whose value is computed by `f` at evaluation time.
    /// `fargs` are resolved against the context and passed to `f`.
    pub fn call<F>(name: &str, f: F, fargs: Vec<CardValue>) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        Self::new(
            name,
            CardValue::Callable {
                f: Arc::new(f),
                fargs,
            },
        )
    }

    /// Resolve a default card from the installed catalog. Unknown names are
    /// a construction-time error.
    pub fn named(name: &str) -> Result<Self, CardError> {
        DefaultCardSet::global().card(name)
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Fallback value used when resolution or casting fails.
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Force the evaluated value to `target`. Integer casts of numeric text
    /// truncate toward zero (`"-30.7"` becomes -30).
    pub fn with_cast(mut self, target: CardType) -> Self {
        self.cast = Some(target);
        self
    }

    pub fn with_autocast(mut self, autocast: bool) -> Self {
        self.autocast = Some(autocast);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn value(&self) -> &CardValue {
        &self.value
    }

    fn autocast_enabled(&self) -> bool {
        self.autocast
            .unwrap_or(self.cast.is_none() && !matches!(self.value, CardValue::Expr(_)))
    }

    /// Evaluate the card for `exposure`, with `extra` bindings merged under
    /// the reserved context keys.
    pub fn evaluate(&self, exposure: &Exposure, extra: &Context) -> Result<EvaluatedCard, CardError> {
        self.evaluate_in(&exposure.context(extra))
    }

    pub(crate) fn evaluate_in(&self, context: &Context) -> Result<EvaluatedCard, CardError> {
        let raw = match self.value.resolve(&self.name, context) {
            Ok(value) => value,
            Err(err) => match &self.default {
                Some(default) => {
                    warn!(card = %self.name, error = %err, "card failed, using default");
                    default.clone()
                }
                None => return Err(err),
            },
        };

        let value = self.finish(raw)?;
        if !value.is_scalar() {
            return Err(CardError::NotScalar {
                card: self.name.clone(),
                found: value.type_name(),
            });
        }

        Ok(EvaluatedCard {
            name: self.name.clone(),
            value,
            comment: self.comment.clone(),
        })
    }

    fn finish(&self, raw: Value) -> Result<Value, CardError> {
        match self.apply_cast(raw) {
            Ok(value) => Ok(value),
            Err(err) => match &self.default {
                Some(default) => self.apply_cast(default.clone()),
                None => Err(err),
            },
        }
    }

    fn apply_cast(&self, raw: Value) -> Result<Value, CardError> {
        match self.cast {
            Some(target) => cast(&self.name, raw, target),
            None if self.autocast_enabled() => Ok(autocast(raw)),
            None => Ok(raw),
        }
    }
}

fn cast(card: &str, value: Value, target: CardType) -> Result<Value, CardError> {
    let failed = |value: &Value| CardError::Cast {
        card: card.to_string(),
        value: format!("{value:?}"),
        target,
    };

    match target {
        CardType::Int => match &value {
            Value::Int(_) => Ok(value),
            Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
            Value::Bool(b) => Ok(Value::Int(*b as i64)),
            Value::Str(s) => {
                let s = s.trim();
                if let Ok(i) = s.parse::<i64>() {
                    Ok(Value::Int(i))
                } else if let Ok(f) = s.parse::<f64>() {
                    Ok(Value::Int(f.trunc() as i64))
                } else {
                    Err(failed(&value))
                }
            }
            _ => Err(failed(&value)),
        },
        CardType::Float => match &value {
            Value::Float(_) => Ok(value),
            Value::Int(i) => Ok(Value::Float(*i as f64)),
            Value::Bool(b) => Ok(Value::Float(*b as i64 as f64)),
            Value::Str(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| failed(&value)),
            _ => Err(failed(&value)),
        },
        CardType::Bool => match &value {
            Value::Bool(_) => Ok(value),
            Value::Int(i) => Ok(Value::Bool(*i != 0)),
            Value::Float(f) => Ok(Value::Bool(*f != 0.0)),
            Value::Str(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
            Value::Str(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
            _ => Err(failed(&value)),
        },
        CardType::Str => match value.render() {
            Ok(s) => Ok(Value::Str(s)),
            Err(_) => Err(failed(&value)),
        },
    }
}

/// Reparse string values: integer, then float, then boolean, else keep the
/// string. Non-strings pass through.
fn autocast(value: Value) -> Value {
    let Value::Str(s) = &value else {
        return value;
    };

    let trimmed = s.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        Value::Int(i)
    } else if let Ok(f) = trimmed.parse::<f64>() {
        Value::Float(f)
    } else if trimmed.eq_ignore_ascii_case("true") {
        Value::Bool(true)
    } else if trimmed.eq_ignore_ascii_case("false") {
        Value::Bool(false)
    } else {
        value
    }
}

/// A card-producing unit computed at evaluation time.
///
/// Implementations compute values from the exposure and context — WCS
/// solutions, site telemetry, weather queries — and return entries that are
/// expanded exactly like a [`CardGroup`]'s. Returning an empty vector is
/// legal and contributes nothing. Errors are not swallowed: a macro that
/// talks to an external service must surface its failures, so they
/// propagate tagged with [`MacroCard::label`].
pub trait MacroCard: Send + Sync {
    /// Identity used in error messages.
    fn label(&self) -> &str;

    fn cards(&self, exposure: &Exposure, context: &Context) -> Result<Vec<Entry>, BoxError>;
}

/// One entry of a [`CardGroup`] or header model.
#[derive(Clone)]
pub enum Entry {
    Card(Card),
    Group(CardGroup),
    Macro(Arc<dyn MacroCard>),
    /// A no-op placeholder, skipped on evaluation. Supports conditional
    /// inclusion without reshaping the model.
    Skip,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Card(card) => f.debug_tuple("Card").field(card).finish(),
            Entry::Group(group) => f.debug_tuple("Group").field(group).finish(),
            Entry::Macro(m) => f.debug_tuple("Macro").field(&m.label()).finish(),
            Entry::Skip => f.write_str("Skip"),
        }
    }
}

impl Entry {
    pub fn from_macro(m: impl MacroCard + 'static) -> Self {
        Entry::Macro(Arc::new(m))
    }

    /// Resolve a default-card name into a card entry. Unknown names fail
    /// here, at construction.
    pub fn named(name: &str) -> Result<Self, CardError> {
        Ok(Entry::Card(Card::named(name)?))
    }

    pub(crate) fn expand(
        &self,
        exposure: &Exposure,
        context: &Context,
        out: &mut Vec<EvaluatedCard>,
    ) -> Result<(), CardError> {
        match self {
            Entry::Card(card) => out.push(card.evaluate_in(context)?),
            Entry::Group(group) => group.expand_into(exposure, context, out)?,
            Entry::Macro(m) => {
                let entries = m
                    .cards(exposure, context)
                    .map_err(|source| CardError::Macro {
                        label: m.label().to_string(),
                        source,
                    })?;
                for entry in entries {
                    entry.expand(exposure, context, out)?;
                }
            }
            Entry::Skip => {}
        }
        Ok(())
    }
}

impl From<Card> for Entry {
    fn from(card: Card) -> Self {
        Entry::Card(card)
    }
}

impl From<CardGroup> for Entry {
    fn from(group: CardGroup) -> Self {
        Entry::Group(group)
    }
}

impl<V: Into<CardValue>> From<(&str, V)> for Entry {
    fn from((name, value): (&str, V)) -> Self {
        Entry::Card(Card::new(name, value))
    }
}

impl<V: Into<CardValue>> From<(&str, V, &str)> for Entry {
    fn from((name, value, comment): (&str, V, &str)) -> Self {
        Entry::Card(Card::new(name, value).with_comment(comment))
    }
}

impl<E: Into<Entry>> From<Option<E>> for Entry {
    fn from(entry: Option<E>) -> Self {
        match entry {
            Some(entry) => entry.into(),
            None => Entry::Skip,
        }
    }
}

/// An ordered, reusable collection of cards, expanded in place wherever the
/// group appears in a header model.
#[derive(Clone, Debug, Default)]
pub struct CardGroup {
    name: Option<String>,
    entries: Vec<Entry>,
}

impl CardGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group label, for bookkeeping only: it emits no header line.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with(mut self, entry: impl Into<Entry>) -> Self {
        self.entries.push(entry.into());
        self
    }

    /// Append a default card by catalog name.
    pub fn with_named(mut self, name: &str) -> Result<Self, CardError> {
        self.entries.push(Entry::named(name)?);
        Ok(self)
    }

    pub fn with_macro(mut self, m: impl MacroCard + 'static) -> Self {
        self.entries.push(Entry::from_macro(m));
        self
    }

    pub fn push(&mut self, entry: impl Into<Entry>) {
        self.entries.push(entry.into());
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Expand every entry in declared order into a flat card sequence.
    pub fn expand(
        &self,
        exposure: &Exposure,
        extra: &Context,
    ) -> Result<Vec<EvaluatedCard>, CardError> {
        let context = exposure.context(extra);
        let mut out = Vec::with_capacity(self.entries.len());
        self.expand_into(exposure, &context, &mut out)?;
        Ok(out)
    }

    pub(crate) fn expand_into(
        &self,
        exposure: &Exposure,
        context: &Context,
        out: &mut Vec<EvaluatedCard>,
    ) -> Result<(), CardError> {
        for entry in &self.entries {
            entry.expand(exposure, context, out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exposure::{CameraContext, Exposure};
    use rstest::rstest;

    fn exposure() -> Exposure {
        let camera = CameraContext::new("test").with_model("X");
        Exposure::new(camera)
    }

    #[rstest]
    #[case("5", Value::Int(5))]
    #[case("5.0", Value::Float(5.0))]
    #[case("-30.7", Value::Float(-30.7))]
    #[case("true", Value::Bool(true))]
    #[case("False", Value::Bool(false))]
    #[case("object", Value::Str("object".into()))]
    fn autocast_precedence(#[case] raw: &str, #[case] expected: Value) {
        let card = Card::new("TEST", raw);
        let evaluated = card.evaluate(&exposure(), &Context::new()).unwrap();
        assert_eq!(evaluated.value(), &expected);
    }

    #[test]
    fn autocast_never_reads_one_as_bool() {
        let card = Card::new("TEST", "1");
        let evaluated = card.evaluate(&exposure(), &Context::new()).unwrap();
        assert_eq!(evaluated.value(), &Value::Int(1));
    }

    #[test]
    fn explicit_int_cast_truncates_toward_zero() {
        let card = Card::new("SETPOINT", "-30.7").with_cast(CardType::Int);
        let evaluated = card.evaluate(&exposure(), &Context::new()).unwrap();
        assert_eq!(evaluated.value(), &Value::Int(-30));
    }

    #[test]
    fn missing_placeholder_falls_back_to_default() {
        let card = Card::new("FALLBACK", "{missing.attr}").with_default(42);
        let evaluated = card.evaluate(&exposure(), &Context::new()).unwrap();
        assert_eq!(evaluated.value(), &Value::Int(42));
    }

    #[test]
    fn missing_placeholder_without_default_names_the_card() {
        let card = Card::new("NOFALL", "{missing.attr}");
        let err = card.evaluate(&exposure(), &Context::new()).unwrap_err();
        assert!(err.to_string().contains("NOFALL"));
    }

    #[test]
    fn cast_failure_uses_default() {
        let card = Card::new("GAIN", "high")
            .with_cast(CardType::Int)
            .with_default(0);
        let evaluated = card.evaluate(&exposure(), &Context::new()).unwrap();
        assert_eq!(evaluated.value(), &Value::Int(0));
    }

    #[test]
    fn cast_failure_without_default_errors() {
        let card = Card::new("GAIN", "high").with_cast(CardType::Int);
        assert!(matches!(
            card.evaluate(&exposure(), &Context::new()),
            Err(CardError::Cast { .. })
        ));
    }

    #[test]
    fn comment_is_never_evaluated() {
        let card = Card::new("SITE", "apo").with_comment("site is {not.a.template}");
        let evaluated = card.evaluate(&exposure(), &Context::new()).unwrap();
        assert_eq!(evaluated.comment(), "site is {not.a.template}");
    }

    #[test]
    fn callable_receives_resolved_fargs() {
        let card = Card::call(
            "SUM",
            |args| {
                let total: i64 = args
                    .iter()
                    .map(|v| match v {
                        Value::Int(i) => *i,
                        _ => 0,
                    })
                    .sum();
                Ok(Value::Int(total))
            },
            vec![CardValue::from(2i64), CardValue::from("3")],
        );
        // The template farg "3" resolves to the string "3"; the callable
        // sees it before autocasting, so only the literal 2 contributes.
        let evaluated = card.evaluate(&exposure(), &Context::new()).unwrap();
        assert_eq!(evaluated.value(), &Value::Int(2));
    }

    #[test]
    fn expression_cards_read_the_context() {
        let card = Card::expr("DOUBLED", "bin * 2").unwrap();
        let extra = Context::new().with("bin", 4);
        let evaluated = card.evaluate(&exposure(), &extra).unwrap();
        assert_eq!(evaluated.value(), &Value::Int(8));
    }

    #[test]
    fn expression_parse_error_at_construction() {
        assert!(Card::expr("BAD", "1 +").is_err());
    }

    #[test]
    fn long_names_are_trimmed() {
        let card = Card::new("OBSERVATORY", "apo");
        assert_eq!(card.name(), "OBSERVAT");
    }

    #[test]
    fn group_expands_in_declared_order() {
        let group = CardGroup::new()
            .with(("FIRST", 1i64))
            .with(("SECOND", "{__camera__.model}", "camera model"));
        let cards = group.expand(&exposure(), &Context::new()).unwrap();
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].name(), "FIRST");
        assert_eq!(cards[1].value(), &Value::Str("X".into()));
        assert_eq!(cards[1].comment(), "camera model");
    }

    #[test]
    fn skip_entries_emit_nothing() {
        let group = CardGroup::new()
            .with(("A", 1i64))
            .with(None::<Card>)
            .with(("B", 2i64));
        let cards = group.expand(&exposure(), &Context::new()).unwrap();
        let names: Vec<_> = cards.iter().map(|c| c.name()).collect();
        assert_eq!(names, ["A", "B"]);
    }

    struct FailingMacro;

    impl MacroCard for FailingMacro {
        fn label(&self) -> &str {
            "weather"
        }

        fn cards(&self, _: &Exposure, _: &Context) -> Result<Vec<Entry>, BoxError> {
            Err("service unreachable".into())
        }
    }

    #[test]
    fn macro_errors_carry_the_label() {
        let group = CardGroup::new().with_macro(FailingMacro);
        let err = group.expand(&exposure(), &Context::new()).unwrap_err();
        match err {
            CardError::Macro { label, source } => {
                assert_eq!(label, "weather");
                assert_eq!(source.to_string(), "service unreachable");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
