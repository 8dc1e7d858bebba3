//! Deferred FITS header cards and the structural models built from them.
//!
//! A [`Card`] holds a keyword whose value is resolved at exposure time:
//! a literal, a `{...}` template, a parsed expression, or a callable.
//! Cards compose into [`CardGroup`]s and [`MacroCard`]s, which expand in
//! place when a [`HeaderModel`] is evaluated. An [`Extension`] couples a
//! header model with a data-source policy, and a [`FitsModel`] orders
//! extensions into the structure of one output file.
//!
//! Evaluation is synchronous and pure: the same model can be evaluated
//! repeatedly and concurrently across independent exposures.

use thiserror::Error;

mod card;
mod defaults;
mod model;
mod solar;
mod wcs;

pub use card::{Card, CardFn, CardGroup, CardType, CardValue, Entry, EvaluatedCard, MacroCard};
pub use defaults::DefaultCardSet;
pub use model::{Algorithm, Compression, Extension, ExtensionData, FitsModel, Hdu, HeaderModel};
pub use solar::SolarCards;
pub use wcs::{Wcs, WcsCards};

/// Boxed error type carried by callables and macros, so external failures
/// (device queries, weather services) surface with their original detail.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum CardError {
    /// Resolution failed and the card declares no default.
    #[error("failed evaluating card {card}: {source}")]
    Evaluation { card: String, source: BoxError },
    /// The resolved value could not be coerced to the requested type.
    #[error("cannot cast {value} to {target} for card {card}")]
    Cast {
        card: String,
        value: String,
        target: CardType,
    },
    /// The evaluated value is not a FITS-legal scalar.
    #[error("card {card} evaluated to non-scalar {found}")]
    NotScalar { card: String, found: &'static str },
    /// A default-card name was not found in the catalog.
    #[error("unknown default card {0:?}")]
    UnknownDefaultCard(String),
    /// A macro failed; the cause is carried unmodified.
    #[error("macro {label} failed: {source}")]
    Macro { label: String, source: BoxError },
    /// The default-card catalog was installed twice.
    #[error("default card catalog is already installed")]
    CatalogInstalled,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("FITS model has no extensions")]
    EmptyModel,
    #[error("extension {extension} requires a data buffer the exposure does not provide")]
    MissingData { extension: String },
    #[error(transparent)]
    Card(#[from] CardError),
}
