//! Header, extension and file-level models.

use std::collections::BTreeMap;

use super::{Card, CardError, Entry, EvaluatedCard, MacroCard, ModelError, WcsCards};
use crate::eval::{Context, Value};
use crate::exposure::{Exposure, ImageData};

/// An ordered sequence of header entries defining one extension's header.
///
/// Evaluation preserves declaration order and permits duplicate keywords;
/// deduplication, if wanted, belongs to the consumer.
#[derive(Clone, Debug, Default)]
pub struct HeaderModel {
    entries: Vec<Entry>,
}

impl HeaderModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// The builtin header: camera identity, image type, timing and
    /// stacking keywords.
    pub fn basic() -> Self {
        let mut model = Self::new();
        for name in [
            "VCAM", "CAMNAME", "CAMUID", "IMAGETYP", "EXPTIME", "EXPTIMEN", "STACK", "STACKFUN",
        ] {
            // The builtin catalog always carries these names.
            if let Ok(entry) = Entry::named(name) {
                model.push(entry);
            }
        }
        model
            .with(Card::new("TIMESYS", "UTC").with_comment("The time scale system"))
            .with(
                Card::new("DATE-OBS", "{__exposure__.obstime.isot}")
                    .with_comment("Date (in TIMESYS) the exposure started"),
            )
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

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evaluate the model into the flat, ordered header-line sequence for
    /// one extension.
    pub fn evaluate(
        &self,
        exposure: &Exposure,
        extra: &Context,
    ) -> Result<Vec<EvaluatedCard>, CardError> {
        let context = exposure.context(extra);
        self.evaluate_in(exposure, &context)
    }

    pub(crate) fn evaluate_in(
        &self,
        exposure: &Exposure,
        context: &Context,
    ) -> Result<Vec<EvaluatedCard>, CardError> {
        let mut out = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            entry.expand(exposure, context, &mut out)?;
        }
        Ok(out)
    }
}

/// Where an extension's data unit comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum ExtensionData {
    /// The exposure's primary data array. Its absence at evaluation time is
    /// an error: header-only extensions must say so with [`ExtensionData::Empty`].
    Raw,
    /// No data unit; a header-only extension.
    Empty,
    /// A named auxiliary buffer on the exposure.
    Named(String),
    /// A buffer owned by the model itself.
    Owned(ImageData),
}

/// Tile-compression algorithms understood by FITS writers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    Rice1,
    Gzip1,
    Gzip2,
    Plio1,
    Hcompress1,
}

impl Algorithm {
    /// The ZCMPTYPE spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Rice1 => "RICE_1",
            Algorithm::Gzip1 => "GZIP_1",
            Algorithm::Gzip2 => "GZIP_2",
            Algorithm::Plio1 => "PLIO_1",
            Algorithm::Hcompress1 => "HCOMPRESS_1",
        }
    }
}

/// Compression request forwarded to the FITS writer. `params` (tile shape,
/// quantization, ...) are opaque to this crate.
#[derive(Clone, Debug, PartialEq)]
pub struct Compression {
    pub algorithm: Algorithm,
    pub params: BTreeMap<String, Value>,
}

impl Compression {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// One FITS extension: a header model plus a data-source policy.
#[derive(Clone, Debug)]
pub struct Extension {
    name: String,
    header: HeaderModel,
    data: ExtensionData,
    compression: Option<Compression>,
}

impl Extension {
    pub fn new(name: impl Into<String>, header: HeaderModel, data: ExtensionData) -> Self {
        Self {
            name: name.into(),
            header,
            data,
            compression: None,
        }
    }

    pub fn compressed(mut self, compression: Compression) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &HeaderModel {
        &self.header
    }

    pub fn is_compressed(&self) -> bool {
        self.compression.is_some()
    }

    /// Evaluate this extension for `exposure`. The header is evaluated
    /// before any data is attached, so a card failure aborts the extension
    /// whole.
    pub fn to_hdu(&self, exposure: &Exposure, extra: &Context) -> Result<Hdu, ModelError> {
        let context = exposure.context(extra);
        self.to_hdu_in(exposure, &context, false)
    }

    fn to_hdu_in(
        &self,
        exposure: &Exposure,
        context: &Context,
        primary: bool,
    ) -> Result<Hdu, ModelError> {
        let cards = self.header.evaluate_in(exposure, context)?;

        let missing = || ModelError::MissingData {
            extension: self.name.clone(),
        };
        let data = match &self.data {
            ExtensionData::Raw => Some(exposure.data().ok_or_else(missing)?.clone()),
            ExtensionData::Empty => None,
            ExtensionData::Named(buffer) => {
                Some(exposure.buffer(buffer).ok_or_else(missing)?.clone())
            }
            ExtensionData::Owned(data) => Some(data.clone()),
        };

        Ok(Hdu {
            name: self.name.clone(),
            primary,
            cards,
            data,
            compression: self.compression.clone(),
        })
    }
}

/// One evaluated header-and-data unit, ready for an external FITS writer.
#[derive(Clone, Debug)]
pub struct Hdu {
    name: String,
    primary: bool,
    cards: Vec<EvaluatedCard>,
    data: Option<ImageData>,
    compression: Option<Compression>,
}

impl Hdu {
    /// An empty primary HDU, synthesized ahead of compressed extensions.
    pub fn empty_primary() -> Self {
        Self {
            name: "PRIMARY".to_string(),
            primary: true,
            cards: Vec::new(),
            data: None,
            compression: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn cards(&self) -> &[EvaluatedCard] {
        &self.cards
    }

    pub fn data(&self) -> Option<&ImageData> {
        self.data.as_ref()
    }

    pub fn compression(&self) -> Option<&Compression> {
        self.compression.as_ref()
    }
}

/// The ordered extension sequence of one output file.
#[derive(Clone, Debug)]
pub struct FitsModel {
    extensions: Vec<Extension>,
}

impl FitsModel {
    /// Build a model from its extensions. An empty model is rejected at
    /// evaluation time.
    pub fn new(extensions: Vec<Extension>) -> Self {
        Self { extensions }
    }

    /// A single uncompressed extension holding the raw data and the basic
    /// header.
    pub fn basic() -> Self {
        Self::new(vec![Extension::new(
            "PRIMARY",
            HeaderModel::basic().with_macro(WcsCards),
            ExtensionData::Raw,
        )])
    }

    /// Like [`FitsModel::basic`] but Rice-compressed.
    pub fn basic_compressed() -> Self {
        Self::new(vec![
            Extension::new(
                "PRIMARY",
                HeaderModel::basic().with_macro(WcsCards),
                ExtensionData::Raw,
            )
            .compressed(Compression::new(Algorithm::Rice1)),
        ])
    }

    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    /// Evaluate every extension in order.
    ///
    /// A compressed extension cannot be the file's primary HDU; when the
    /// first extension requests compression, an empty primary is
    /// synthesized ahead of it and every later index shifts by one.
    pub fn to_hdu_list(
        &self,
        exposure: &Exposure,
        extra: &Context,
    ) -> Result<Vec<Hdu>, ModelError> {
        if self.extensions.is_empty() {
            return Err(ModelError::EmptyModel);
        }

        let context = exposure.context(extra);
        let mut hdus = Vec::with_capacity(self.extensions.len() + 1);

        for (index, extension) in self.extensions.iter().enumerate() {
            let mut primary = index == 0;
            if primary && extension.is_compressed() {
                hdus.push(Hdu::empty_primary());
                primary = false;
            }
            hdus.push(extension.to_hdu_in(exposure, &context, primary)?);
        }

        Ok(hdus)
    }
}

impl Default for FitsModel {
    fn default() -> Self {
        Self::basic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exposure::CameraContext;
    use crate::header::BoxError;

    fn exposure_with_data() -> Exposure {
        Exposure::new(CameraContext::new("test"))
            .with_data(ImageData::zeros(4, 2))
            .with_exptime(0.5)
            .with_image_type(crate::exposure::ImageType::Object)
    }

    struct PairMacro;

    impl MacroCard for PairMacro {
        fn label(&self) -> &str {
            "pair"
        }

        fn cards(&self, _: &Exposure, _: &Context) -> Result<Vec<Entry>, BoxError> {
            Ok(vec![("B", 1i64).into(), ("C", 2i64).into()])
        }
    }

    #[test]
    fn macro_expansion_preserves_order() {
        let model = HeaderModel::new()
            .with(("A", 0i64))
            .with_macro(PairMacro)
            .with(("D", 3i64));
        let cards = model
            .evaluate(&exposure_with_data(), &Context::new())
            .unwrap();
        let names: Vec<_> = cards.iter().map(|c| c.name()).collect();
        assert_eq!(names, ["A", "B", "C", "D"]);
    }

    #[test]
    fn duplicate_keywords_survive() {
        let model = HeaderModel::new().with(("SAME", 1i64)).with(("SAME", 2i64));
        let cards = model
            .evaluate(&exposure_with_data(), &Context::new())
            .unwrap();
        assert_eq!(cards.len(), 2);
    }

    #[test]
    fn compressed_first_extension_gets_an_empty_primary() {
        let model = FitsModel::new(vec![
            Extension::new("DATA", HeaderModel::new(), ExtensionData::Raw)
                .compressed(Compression::new(Algorithm::Rice1)),
        ]);
        let hdus = model
            .to_hdu_list(&exposure_with_data(), &Context::new())
            .unwrap();
        assert_eq!(hdus.len(), 2);
        assert!(hdus[0].is_primary());
        assert!(hdus[0].data().is_none());
        assert!(!hdus[1].is_primary());
        assert!(hdus[1].compression().is_some());
    }

    #[test]
    fn uncompressed_first_extension_stays_primary() {
        let model = FitsModel::basic();
        let hdus = model
            .to_hdu_list(&exposure_with_data(), &Context::new())
            .unwrap();
        assert_eq!(hdus.len(), 1);
        assert!(hdus[0].is_primary());
        assert!(hdus[0].data().is_some());
    }

    #[test]
    fn empty_model_is_rejected() {
        let model = FitsModel::new(Vec::new());
        assert!(matches!(
            model.to_hdu_list(&exposure_with_data(), &Context::new()),
            Err(ModelError::EmptyModel)
        ));
    }

    #[test]
    fn raw_extension_without_data_is_an_error() {
        let exposure = Exposure::new(CameraContext::new("test"));
        let model = FitsModel::new(vec![Extension::new(
            "DATA",
            HeaderModel::new(),
            ExtensionData::Raw,
        )]);
        assert!(matches!(
            model.to_hdu_list(&exposure, &Context::new()),
            Err(ModelError::MissingData { .. })
        ));
    }

    #[test]
    fn header_only_extension_is_explicit() {
        let exposure = Exposure::new(CameraContext::new("test"));
        let model = FitsModel::new(vec![Extension::new(
            "META",
            HeaderModel::new().with(("PURPOSE", "telemetry")),
            ExtensionData::Empty,
        )]);
        let hdus = model.to_hdu_list(&exposure, &Context::new()).unwrap();
        assert!(hdus[0].data().is_none());
        assert_eq!(hdus[0].cards().len(), 1);
    }

    #[test]
    fn named_buffer_selection() {
        let exposure = Exposure::new(CameraContext::new("test"))
            .with_buffer("overscan", ImageData::zeros(4, 1));
        let model = FitsModel::new(vec![Extension::new(
            "OVERSCAN",
            HeaderModel::new(),
            ExtensionData::Named("overscan".into()),
        )]);
        let hdus = model.to_hdu_list(&exposure, &Context::new()).unwrap();
        assert_eq!(hdus[0].data().unwrap().height(), 1);
    }

    #[test]
    fn card_failure_aborts_the_extension_before_data() {
        let model = FitsModel::new(vec![Extension::new(
            "DATA",
            HeaderModel::new().with(("BROKEN", "{nope.nope}")),
            ExtensionData::Raw,
        )]);
        assert!(model
            .to_hdu_list(&exposure_with_data(), &Context::new())
            .is_err());
    }
}
