//! Camera abstraction and deferred FITS metadata for astronomical
//! instruments.
//!
//! `skycam` wraps a vendor camera SDK behind one uniform surface — connect,
//! expose, read status, stream events — and drives everything an exposure
//! needs on the way to disk: frame stacking, deferred header evaluation,
//! FITS extension assembly, and sequential filename generation.
//!
//! The centerpiece is the header engine. Header keywords are declared once,
//! as [`header::Card`]s whose values are templates, restricted expressions
//! or callables, and resolved per exposure against a runtime context:
//!
//! ```
//! use skycam::eval::Context;
//! use skycam::exposure::{CameraContext, Exposure};
//! use skycam::header::{Card, HeaderModel};
//!
//! let model = HeaderModel::new()
//!     .with_named("CAMNAME")?
//!     .with(Card::new("SETPOINT", "{__camera__.status[setpoint]}")
//!         .with_comment("Cooler set point [C]")
//!         .with_default(-20));
//!
//! let camera = CameraContext::new("east");
//! let exposure = Exposure::new(camera);
//! let cards = model.evaluate(&exposure, &Context::new())?;
//! assert_eq!(cards[0].value().render()?, "east");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Binary FITS serialization, the TCP command protocol and the vendor SDKs
//! themselves are external collaborators: the engine produces ordered
//! [`header::Hdu`] units and hands them to a [`exposure::FitsWriter`]
//! implementation.

pub mod camera;
pub mod eval;
pub mod events;
pub mod exposure;
pub mod header;
pub mod namer;

pub mod prelude {
    pub use crate::camera::{Camera, CameraDevice, ExposeRequest};
    pub use crate::eval::{Context, Value};
    pub use crate::events::{CameraEvent, EventNotifier};
    pub use crate::exposure::{
        CameraContext, Exposure, FitsWriter, ImageData, ImageType, StackFunction, WriteOptions,
    };
    pub use crate::header::{
        Card, CardGroup, Entry, EvaluatedCard, Extension, ExtensionData, FitsModel, HeaderModel,
        MacroCard,
    };
    pub use crate::namer::ImageNamer;
}
