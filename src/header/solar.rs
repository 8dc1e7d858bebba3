//! Solar-position cards.

use spa::{SolarPos, StdFloatOps};
use uom::si::{angle::degree, f64::Angle};

use super::{BoxError, Card, Entry, MacroCard};
use crate::eval::Context;
use crate::exposure::Exposure;

/// Emits SUNALT/SUNAZ computed for the observing site at the exposure's
/// start time.
///
/// A concrete example of a macro that computes values instead of reading
/// them: the solar ephemeris runs when the header is evaluated, and a
/// failure (an epoch outside the algorithm's range) propagates as a macro
/// error rather than producing an incomplete header.
#[derive(Clone, Copy, Debug)]
pub struct SolarCards {
    lat: Angle,
    lon: Angle,
}

impl SolarCards {
    /// Site latitude (north positive) and longitude (east positive).
    pub fn new(lat: Angle, lon: Angle) -> Self {
        Self { lat, lon }
    }

    pub fn lat(&self) -> Angle {
        self.lat
    }

    pub fn lon(&self) -> Angle {
        self.lon
    }
}

impl MacroCard for SolarCards {
    fn label(&self) -> &str {
        "solar"
    }

    fn cards(&self, exposure: &Exposure, _context: &Context) -> Result<Vec<Entry>, BoxError> {
        let position: SolarPos = spa::solar_position::<StdFloatOps>(
            exposure.obstime(),
            self.lat.get::<degree>(),
            self.lon.get::<degree>(),
        )
        .map_err(|err| format!("solar position failed: {err:?}"))?;

        let altitude = 90.0 - position.zenith_angle;

        Ok(vec![
            Card::new("SUNALT", altitude)
                .with_comment("Altitude of the Sun at obstime [deg]")
                .into(),
            Card::new("SUNAZ", position.azimuth)
                .with_comment("Azimuth of the Sun at obstime [deg]")
                .into(),
        ])
    }
}
