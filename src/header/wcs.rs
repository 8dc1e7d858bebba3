//! World coordinate system cards.

use nalgebra::Matrix2;
use uom::si::{angle::degree, f64::Angle};

use super::{BoxError, Card, Entry, MacroCard};
use crate::eval::Context;
use crate::exposure::Exposure;

/// An astrometric solution for one exposure: projection types, reference
/// pixel, reference sky coordinate and the CD rotation/scale matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct Wcs {
    ctype: [String; 2],
    crpix: [f64; 2],
    crval: [Angle; 2],
    cd: Matrix2<f64>,
}

impl Wcs {
    pub fn new(ctype: [&str; 2], crpix: [f64; 2], crval: [Angle; 2], cd: Matrix2<f64>) -> Self {
        Self {
            ctype: [ctype[0].to_string(), ctype[1].to_string()],
            crpix,
            crval,
            cd,
        }
    }

    /// The default solution used when an exposure carries no astrometry:
    /// gnomonic axes, unit CD matrix, zero reference point.
    pub fn identity() -> Self {
        Self::new(
            ["RA---TAN", "DEC--TAN"],
            [0.0, 0.0],
            [Angle::new::<degree>(0.0), Angle::new::<degree>(0.0)],
            Matrix2::identity(),
        )
    }

    pub fn ctype(&self) -> [&str; 2] {
        [&self.ctype[0], &self.ctype[1]]
    }

    pub fn crpix(&self) -> [f64; 2] {
        self.crpix
    }

    pub fn crval(&self) -> [Angle; 2] {
        self.crval
    }

    pub fn cd(&self) -> &Matrix2<f64> {
        &self.cd
    }
}

impl Default for Wcs {
    fn default() -> Self {
        Self::identity()
    }
}

/// Emits the standard WCS card set from the exposure's astrometric
/// solution, or the [`Wcs::identity`] set when the exposure has none.
#[derive(Clone, Copy, Debug, Default)]
pub struct WcsCards;

impl MacroCard for WcsCards {
    fn label(&self) -> &str {
        "wcs"
    }

    fn cards(&self, exposure: &Exposure, _context: &Context) -> Result<Vec<Entry>, BoxError> {
        let fallback = Wcs::identity();
        let wcs = exposure.wcs().unwrap_or(&fallback);

        let [ctype1, ctype2] = wcs.ctype();
        let [crpix1, crpix2] = wcs.crpix();
        let [crval1, crval2] = wcs.crval();
        let cd = wcs.cd();

        Ok(vec![
            Card::new("CTYPE1", ctype1)
                .with_comment("Projection type for axis 1")
                .into(),
            Card::new("CTYPE2", ctype2)
                .with_comment("Projection type for axis 2")
                .into(),
            Card::new("CRPIX1", crpix1)
                .with_comment("Reference pixel on axis 1")
                .into(),
            Card::new("CRPIX2", crpix2)
                .with_comment("Reference pixel on axis 2")
                .into(),
            Card::new("CRVAL1", crval1.get::<degree>())
                .with_comment("Sky coordinate at reference pixel [deg]")
                .into(),
            Card::new("CRVAL2", crval2.get::<degree>())
                .with_comment("Sky coordinate at reference pixel [deg]")
                .into(),
            Card::new("CD1_1", cd[(0, 0)]).with_comment("CD matrix element").into(),
            Card::new("CD1_2", cd[(0, 1)]).with_comment("CD matrix element").into(),
            Card::new("CD2_1", cd[(1, 0)]).with_comment("CD matrix element").into(),
            Card::new("CD2_2", cd[(1, 1)]).with_comment("CD matrix element").into(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::Value;
    use crate::exposure::CameraContext;
    use crate::header::HeaderModel;

    #[test]
    fn missing_wcs_emits_the_identity_set() {
        let exposure = Exposure::new(CameraContext::new("test"));
        let model = HeaderModel::new().with_macro(WcsCards);
        let cards = model.evaluate(&exposure, &Context::new()).unwrap();

        assert_eq!(cards.len(), 10);
        assert_eq!(cards[0].name(), "CTYPE1");
        assert_eq!(cards[0].value(), &Value::Str("RA---TAN".into()));
        let cd11 = cards.iter().find(|c| c.name() == "CD1_1").unwrap();
        assert_eq!(cd11.value(), &Value::Float(1.0));
    }

    #[test]
    fn exposure_wcs_wins_over_the_fallback() {
        let wcs = Wcs::new(
            ["RA---TAN", "DEC--TAN"],
            [1024.5, 1024.5],
            [Angle::new::<degree>(121.2), Angle::new::<degree>(-29.0)],
            Matrix2::identity() * 2.78e-4,
        );
        let exposure = Exposure::new(CameraContext::new("test")).with_wcs(wcs);
        let model = HeaderModel::new().with_macro(WcsCards);
        let cards = model.evaluate(&exposure, &Context::new()).unwrap();

        let crval1 = cards.iter().find(|c| c.name() == "CRVAL1").unwrap();
        let Value::Float(deg) = crval1.value() else {
            panic!("expected a float CRVAL1");
        };
        // Round-trips through radians internally.
        assert!((deg - 121.2).abs() < 1e-9);
    }
}
