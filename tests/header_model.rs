use std::collections::BTreeMap;

use skycam::eval::{Context, Value};
use skycam::header::{
    Algorithm, BoxError, Card, CardGroup, Compression, Entry, Extension, ExtensionData, FitsModel,
    HeaderModel, MacroCard,
};
use skycam::prelude::*;

fn observing_camera() -> CameraContext {
    let mut status = BTreeMap::new();
    status.insert("ccd_temp".to_string(), Value::Float(-95.2));
    status.insert("setpoint".to_string(), Value::Float(-95.0));

    CameraContext::new("east")
        .with_uid("EAST_001")
        .with_version("2.1.0")
        .with_model("X")
        .with_status(status)
}

fn observing_exposure() -> Exposure {
    Exposure::new(observing_camera())
        .with_data(ImageData::zeros(16, 16))
        .with_exptime(900.0)
        .with_stack(2, StackFunction::Median)
        .with_image_type(ImageType::Object)
}

#[test]
fn default_cards_resolve_against_a_live_exposure() {
    let model = HeaderModel::basic();
    let cards = model
        .evaluate(&observing_exposure(), &Context::new())
        .unwrap();

    let by_name = |name: &str| {
        cards
            .iter()
            .find(|c| c.name() == name)
            .unwrap_or_else(|| panic!("missing {name}"))
    };

    assert_eq!(by_name("CAMNAME").value(), &Value::Str("east".into()));
    assert_eq!(by_name("CAMUID").value(), &Value::Str("EAST_001".into()));
    assert_eq!(by_name("VCAM").value(), &Value::Str("2.1.0".into()));
    assert_eq!(by_name("IMAGETYP").value(), &Value::Str("object".into()));
    assert_eq!(by_name("EXPTIME").value(), &Value::Float(900.0));
    assert_eq!(by_name("EXPTIMEN").value(), &Value::Float(1800.0));
    assert_eq!(by_name("STACK").value(), &Value::Int(2));
    assert_eq!(by_name("STACKFUN").value(), &Value::Str("median".into()));
    assert_eq!(by_name("TIMESYS").value(), &Value::Str("UTC".into()));
}

#[test]
fn group_round_trip_from_names_and_tuples() {
    let group = CardGroup::new()
        .with_named("CAMNAME")
        .unwrap()
        .with(("MODEL", "{__camera__.model}", "desc"));

    let cards = group
        .expand(&observing_exposure(), &Context::new())
        .unwrap();

    assert_eq!(cards.len(), 2);
    assert_eq!(cards[0].name(), "CAMNAME");
    assert_eq!(cards[1].name(), "MODEL");
    assert_eq!(cards[1].value(), &Value::Str("X".into()));
    assert_eq!(cards[1].comment(), "desc");
}

#[test]
fn caller_bindings_reach_the_cards() {
    let mut weather = BTreeMap::new();
    weather.insert("humidity".to_string(), Value::Float(0.37));
    let extra = Context::new().with("weather", Value::Map(weather));

    let model = HeaderModel::new().with(
        Card::new("HUMIDITY", "{weather[humidity]}").with_comment("Relative humidity"),
    );
    let cards = model.evaluate(&observing_exposure(), &extra).unwrap();

    assert_eq!(cards[0].value(), &Value::Float(0.37));
}

struct SiteCards;

impl MacroCard for SiteCards {
    fn label(&self) -> &str {
        "site"
    }

    fn cards(&self, exposure: &Exposure, _: &Context) -> Result<Vec<Entry>, BoxError> {
        // Conditional inclusion: a bias frame records no airmass line.
        let airmass = match exposure.image_type() {
            Some(ImageType::Object) => Some(Card::new("AIRMASS", 1.08)),
            _ => None,
        };
        Ok(vec![
            ("OBSERVAT", "LCO", "Observatory").into(),
            airmass.into(),
        ])
    }
}

#[test]
fn macro_cards_expand_in_place_and_in_order() {
    let model = HeaderModel::new()
        .with(("BEFORE", 1i64))
        .with_macro(SiteCards)
        .with(("AFTER", 2i64));

    let cards = model
        .evaluate(&observing_exposure(), &Context::new())
        .unwrap();
    let names: Vec<_> = cards.iter().map(|c| c.name()).collect();
    assert_eq!(names, ["BEFORE", "OBSERVAT", "AIRMASS", "AFTER"]);

    // The bias exposure skips the conditional entry.
    let bias = Exposure::new(observing_camera())
        .with_data(ImageData::zeros(16, 16))
        .with_exptime(0.0)
        .with_image_type(ImageType::Bias);
    let cards = model.evaluate(&bias, &Context::new()).unwrap();
    let names: Vec<_> = cards.iter().map(|c| c.name()).collect();
    assert_eq!(names, ["BEFORE", "OBSERVAT", "AFTER"]);
}

#[test]
fn sole_compressed_extension_gains_an_empty_primary() {
    let model = FitsModel::new(vec![
        Extension::new("DATA", HeaderModel::basic(), ExtensionData::Raw)
            .compressed(Compression::new(Algorithm::Rice1).with_param("tile_rows", 1)),
    ]);

    let hdus = model
        .to_hdu_list(&observing_exposure(), &Context::new())
        .unwrap();

    assert_eq!(hdus.len(), 2);
    assert!(hdus[0].is_primary());
    assert!(hdus[0].cards().is_empty());
    assert!(hdus[0].data().is_none());

    let compressed = &hdus[1];
    assert!(!compressed.is_primary());
    let compression = compressed.compression().unwrap();
    assert_eq!(compression.algorithm.as_str(), "RICE_1");
    assert_eq!(compression.params.get("tile_rows"), Some(&Value::Int(1)));
}

#[test]
fn multi_extension_model_selects_buffers_by_name() {
    let exposure = observing_exposure().with_buffer("mask", ImageData::zeros(16, 16));

    let model = FitsModel::new(vec![
        Extension::new("PRIMARY", HeaderModel::basic(), ExtensionData::Raw),
        Extension::new(
            "MASK",
            HeaderModel::new().with(("MASKTYP", "badpix")),
            ExtensionData::Named("mask".into()),
        ),
        Extension::new(
            "TELEM",
            HeaderModel::new().with(("SETPOINT", "{__camera__.status[setpoint]}")),
            ExtensionData::Empty,
        ),
    ]);

    let hdus = model.to_hdu_list(&exposure, &Context::new()).unwrap();

    assert_eq!(hdus.len(), 3);
    assert!(hdus[0].is_primary());
    assert!(hdus[1].data().is_some());
    assert!(hdus[2].data().is_none());
    assert_eq!(hdus[2].cards()[0].value(), &Value::Float(-95.0));
}

#[test]
fn an_unusable_card_aborts_the_whole_write() {
    let model = FitsModel::new(vec![Extension::new(
        "PRIMARY",
        HeaderModel::new()
            .with(("OK", 1i64))
            .with(Card::new("DOME", "{dome.azimuth}")),
        ExtensionData::Raw,
    )]);

    let err = model
        .to_hdu_list(&observing_exposure(), &Context::new())
        .unwrap_err();

    // The failure names the offending card so the integrator can find the
    // model entry.
    assert!(err.to_string().contains("DOME"));
}

#[test]
fn expression_cards_compute_from_camera_status() {
    let model = HeaderModel::new().with(
        Card::expr("TEMPDIF", "__camera__.status['ccd_temp'] - __camera__.status['setpoint']")
            .unwrap()
            .with_comment("CCD minus set point [C]"),
    );

    let cards = model
        .evaluate(&observing_exposure(), &Context::new())
        .unwrap();
    let Value::Float(delta) = cards[0].value() else {
        panic!("expected a float");
    };
    assert!((delta - -0.2).abs() < 1e-9);
}

#[test]
fn wcs_macro_defaults_and_overrides() {
    let model = HeaderModel::new().with_macro(skycam::header::WcsCards);

    // Without astrometry the identity set appears.
    let cards = model
        .evaluate(&observing_exposure(), &Context::new())
        .unwrap();
    assert!(cards.iter().any(|c| c.name() == "CTYPE1"));
    let crval1 = cards.iter().find(|c| c.name() == "CRVAL1").unwrap();
    assert_eq!(crval1.value(), &Value::Float(0.0));
}
