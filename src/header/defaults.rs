//! The default-card catalog.
//!
//! Common keywords (EXPTIME, CAMNAME, ...) carry well-known templates and
//! comments, so header models reference them by name alone. The catalog is
//! process-wide and immutable: either the builtin set, or a custom set
//! installed exactly once during setup before any model is constructed.
//! Concurrent reads need no locking.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use super::{Card, CardError};

static GLOBAL: OnceLock<DefaultCardSet> = OnceLock::new();

/// An immutable name → card catalog.
#[derive(Clone, Debug, Default)]
pub struct DefaultCardSet {
    cards: BTreeMap<String, Card>,
}

impl DefaultCardSet {
    /// An empty catalog, for building a custom set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The builtin catalog: exposure timing, stacking, camera identity.
    pub fn builtin() -> Self {
        Self::empty()
            .with(
                Card::new("EXPTIME", "{__exposure__.exptime}")
                    .with_comment("Exposure time of single integration [s]"),
            )
            .with(
                Card::new("EXPTIMEN", "{__exposure__.exptime_n}")
                    .with_comment("Total exposure time [s]"),
            )
            .with(
                Card::new("STACK", "{__exposure__.stack}")
                    .with_comment("Number of stacked frames")
                    .with_default(1),
            )
            .with(
                Card::new("STACKFUN", "{__exposure__.stack_function}")
                    .with_comment("Function used for stacking")
                    .with_default("NA"),
            )
            .with(
                Card::new("OBSTIME", "{__exposure__.obstime.isot}")
                    .with_comment("Time of the start of the exposure [UTC]"),
            )
            .with(
                Card::new("IMAGETYP", "{__exposure__.image_type}")
                    .with_comment("The image type of the file"),
            )
            .with(
                Card::new("CAMNAME", "{__camera__.name}")
                    .with_comment("Camera name")
                    .with_default("NA"),
            )
            .with(
                Card::new("CAMUID", "{__camera__.uid}")
                    .with_comment("Camera UID")
                    .with_default("NA"),
            )
            .with(
                Card::new("VCAM", "{__camera__.version}")
                    .with_comment("Version of the camera library")
                    .with_default("NA"),
            )
    }

    /// Register a card under its (uppercased) name.
    pub fn with(mut self, card: Card) -> Self {
        self.cards.insert(card.name().to_string(), card);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Card> {
        self.cards.get(&name.to_uppercase())
    }

    /// Clone the card registered under `name`.
    pub fn card(&self, name: &str) -> Result<Card, CardError> {
        self.get(name)
            .cloned()
            .ok_or_else(|| CardError::UnknownDefaultCard(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cards.keys().map(String::as_str)
    }

    /// Install this set as the process-wide catalog. Must run before the
    /// first catalog access; afterwards the catalog cannot change.
    pub fn install(self) -> Result<(), CardError> {
        GLOBAL.set(self).map_err(|_| CardError::CatalogInstalled)
    }

    /// The process-wide catalog, defaulting to [`DefaultCardSet::builtin`].
    pub fn global() -> &'static DefaultCardSet {
        GLOBAL.get_or_init(DefaultCardSet::builtin)
    }
}
