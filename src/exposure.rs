//! Exposures: image data, timing, and the evaluation context they supply.
//!
//! An [`Exposure`] couples the frames read from a camera with the metadata
//! the header engine consumes. It renders itself (and a snapshot of the
//! owning camera) into the `__exposure__`/`__camera__` context bindings,
//! evaluates its FITS model into [`Hdu`] units, and hands the actual file
//! write to an external [`FitsWriter`] on the blocking pool so header
//! evaluation never suspends and event delivery never stalls.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, warn};

use crate::eval::{Context, Value};
use crate::header::{BoxError, FitsModel, Hdu, ModelError, Wcs};

#[derive(Debug, Error)]
pub enum ExposureError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("exposure filename not set")]
    MissingFilename,
    #[error("no frames to stack")]
    EmptyStack,
    #[error("stacked frames have different dimensions")]
    FrameMismatch,
    #[error("pixel buffer length {len} does not match {width}x{height}")]
    BadDimensions {
        width: usize,
        height: usize,
        len: usize,
    },
    #[error("failed creating directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed writing exposure to {path}: {source}")]
    Write { path: PathBuf, source: BoxError },
}

/// A single sensor readout, row-major, at the camera's native bit depth.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageData {
    width: usize,
    height: usize,
    pixels: Vec<u16>,
}

impl ImageData {
    pub fn new(width: usize, height: usize, pixels: Vec<u16>) -> Result<Self, ExposureError> {
        if pixels.len() != width * height {
            return Err(ExposureError::BadDimensions {
                width,
                height,
                len: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }
}

/// The kind of image an exposure produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ImageType {
    Bias,
    Dark,
    Flat,
    Object,
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImageType::Bias => "bias",
            ImageType::Dark => "dark",
            ImageType::Flat => "flat",
            ImageType::Object => "object",
        })
    }
}

/// How stacked integrations are combined into one frame.
///
/// Combination always widens the accumulator (u64 for sums, f64 for means
/// and medians) before narrowing back to the native depth with saturation,
/// so stacking near the sensor ceiling cannot wrap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum StackFunction {
    Sum,
    Mean,
    Median,
}

impl StackFunction {
    /// The name recorded in the STACKFUN keyword.
    pub fn name(&self) -> &'static str {
        match self {
            StackFunction::Sum => "sum",
            StackFunction::Mean => "mean",
            StackFunction::Median => "median",
        }
    }

    /// Combine `frames` pixel by pixel into one image.
    pub fn combine(&self, frames: &[ImageData]) -> Result<ImageData, ExposureError> {
        let first = frames.first().ok_or(ExposureError::EmptyStack)?;
        if frames
            .iter()
            .any(|f| f.width != first.width || f.height != first.height)
        {
            return Err(ExposureError::FrameMismatch);
        }
        if frames.len() == 1 {
            return Ok(first.clone());
        }

        let pixels: Vec<u16> = (0..first.pixels.len())
            .into_par_iter()
            .map(|i| match self {
                StackFunction::Sum => {
                    let total: u64 = frames.iter().map(|f| f.pixels[i] as u64).sum();
                    total.min(u16::MAX as u64) as u16
                }
                StackFunction::Mean => {
                    let total: f64 = frames.iter().map(|f| f.pixels[i] as f64).sum();
                    narrow(total / frames.len() as f64)
                }
                StackFunction::Median => {
                    let mut column: Vec<u16> = frames.iter().map(|f| f.pixels[i]).collect();
                    column.sort_unstable();
                    let mid = column.len() / 2;
                    if column.len() % 2 == 1 {
                        column[mid]
                    } else {
                        narrow((column[mid - 1] as f64 + column[mid] as f64) / 2.0)
                    }
                }
            })
            .collect();

        Ok(ImageData {
            width: first.width,
            height: first.height,
            pixels,
        })
    }
}

impl fmt::Display for StackFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn narrow(value: f64) -> u16 {
    value.round().clamp(0.0, u16::MAX as f64) as u16
}

/// A snapshot of the camera that took an exposure: what `__camera__`
/// exposes to the header engine and the namer.
#[derive(Clone, Debug, Default)]
pub struct CameraContext {
    name: String,
    uid: Option<String>,
    version: Option<String>,
    model: Option<String>,
    status: BTreeMap<String, Value>,
}

impl CameraContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_status(mut self, status: BTreeMap<String, Value>) -> Self {
        self.status = status;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn status(&self) -> &BTreeMap<String, Value> {
        &self.status
    }

    pub(crate) fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), Value::Str(self.name.clone()));
        map.insert("uid".to_string(), Value::from(self.uid.clone()));
        map.insert("version".to_string(), Value::from(self.version.clone()));
        map.insert("model".to_string(), Value::from(self.model.clone()));
        map.insert("status".to_string(), Value::Map(self.status.clone()));
        Value::Map(map)
    }
}

/// Options forwarded to the [`FitsWriter`].
#[derive(Clone, Debug)]
pub struct WriteOptions {
    /// Replace an existing file instead of failing.
    pub overwrite: bool,
    /// Ask the writer to add CHECKSUM/DATASUM cards to every HDU.
    pub checksum: bool,
    /// Try the write a second time after a failure. Useful on network
    /// volumes where transient failures are common.
    pub retry: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            checksum: true,
            retry: true,
        }
    }
}

/// The external collaborator that serializes evaluated HDUs to disk.
///
/// Implementations own the FITS binary format entirely. Two contract
/// points: `options.checksum` asks for CHECKSUM/DATASUM cards on every
/// HDU, and any implementation that mutates a compressed extension's
/// header after the data unit is physically written must recompute those
/// cards in a second pass, or downstream viewers will reject the file.
pub trait FitsWriter: Send + Sync {
    fn write(&self, path: &Path, hdus: &[Hdu], options: &WriteOptions) -> Result<(), BoxError>;
}

/// One exposure: the image read from a camera plus everything the header
/// engine needs to describe it.
#[derive(Clone, Debug)]
pub struct Exposure {
    camera: CameraContext,
    data: Option<ImageData>,
    buffers: BTreeMap<String, ImageData>,
    obstime: DateTime<Utc>,
    exptime: Option<f64>,
    exptime_n: Option<f64>,
    stack_count: u32,
    stack_function: Option<StackFunction>,
    image_type: Option<ImageType>,
    wcs: Option<Wcs>,
    fits_model: Option<Arc<FitsModel>>,
    filename: Option<PathBuf>,
    extra_hdus: Vec<(Hdu, Option<usize>)>,
}

impl Exposure {
    /// A new exposure for `camera`, with `obstime` set to now.
    pub fn new(camera: CameraContext) -> Self {
        Self {
            camera,
            data: None,
            buffers: BTreeMap::new(),
            obstime: Utc::now(),
            exptime: None,
            exptime_n: None,
            stack_count: 1,
            stack_function: None,
            image_type: None,
            wcs: None,
            fits_model: None,
            filename: None,
            extra_hdus: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: ImageData) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach a named auxiliary buffer (overscan strips, bad-pixel masks)
    /// for extensions that select data by name.
    pub fn with_buffer(mut self, name: impl Into<String>, data: ImageData) -> Self {
        self.buffers.insert(name.into(), data);
        self
    }

    pub fn with_obstime(mut self, obstime: DateTime<Utc>) -> Self {
        self.obstime = obstime;
        self
    }

    pub fn with_exptime(mut self, seconds: f64) -> Self {
        self.exptime = Some(seconds);
        self
    }

    pub fn with_exptime_n(mut self, seconds: f64) -> Self {
        self.exptime_n = Some(seconds);
        self
    }

    pub fn with_stack(mut self, count: u32, function: StackFunction) -> Self {
        self.stack_count = count;
        self.stack_function = Some(function);
        self
    }

    pub fn with_image_type(mut self, image_type: ImageType) -> Self {
        self.image_type = Some(image_type);
        self
    }

    pub fn with_wcs(mut self, wcs: Wcs) -> Self {
        self.wcs = Some(wcs);
        self
    }

    pub fn with_fits_model(mut self, model: Arc<FitsModel>) -> Self {
        self.fits_model = Some(model);
        self
    }

    pub fn with_filename(mut self, filename: impl Into<PathBuf>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Append an already-evaluated HDU after the model's output, optionally
    /// at a fixed index.
    pub fn add_hdu(&mut self, hdu: Hdu, index: Option<usize>) {
        self.extra_hdus.push((hdu, index));
    }

    pub fn camera(&self) -> &CameraContext {
        &self.camera
    }

    pub fn data(&self) -> Option<&ImageData> {
        self.data.as_ref()
    }

    pub fn buffer(&self, name: &str) -> Option<&ImageData> {
        self.buffers.get(name)
    }

    pub fn obstime(&self) -> DateTime<Utc> {
        self.obstime
    }

    pub fn exptime(&self) -> Option<f64> {
        self.exptime
    }

    /// Total exposure time. Defaults to `exptime * stack_count` when not
    /// set explicitly.
    pub fn exptime_n(&self) -> Option<f64> {
        self.exptime_n
            .or_else(|| self.exptime.map(|e| e * self.stack_count as f64))
    }

    pub fn stack_count(&self) -> u32 {
        self.stack_count
    }

    pub fn stack_function(&self) -> Option<StackFunction> {
        self.stack_function
    }

    pub fn image_type(&self) -> Option<ImageType> {
        self.image_type
    }

    pub fn wcs(&self) -> Option<&Wcs> {
        self.wcs.as_ref()
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    /// Build the evaluation context for this exposure: caller bindings
    /// first, then the reserved `__exposure__`/`__camera__` keys, which
    /// always win.
    pub fn context(&self, extra: &Context) -> Context {
        let mut context = extra.clone();
        context.insert("__exposure__", self.to_value());
        context.insert("__camera__", self.camera.to_value());
        context
    }

    fn to_value(&self) -> Value {
        let mut obstime = BTreeMap::new();
        let unix = self.obstime.timestamp() as f64
            + self.obstime.timestamp_subsec_micros() as f64 / 1e6;
        let mjd = unix / 86400.0 + 40587.0;
        obstime.insert(
            "isot".to_string(),
            Value::Str(self.obstime.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()),
        );
        obstime.insert("mjd".to_string(), Value::Float(mjd));
        obstime.insert("jd".to_string(), Value::Float(mjd + 2400000.5));
        obstime.insert("unix".to_string(), Value::Float(unix));

        let mut map = BTreeMap::new();
        map.insert("obstime".to_string(), Value::Map(obstime));
        map.insert("exptime".to_string(), Value::from(self.exptime));
        map.insert("exptime_n".to_string(), Value::from(self.exptime_n()));
        map.insert("stack".to_string(), Value::Int(self.stack_count as i64));
        map.insert(
            "stack_function".to_string(),
            Value::from(self.stack_function.map(|f| f.name())),
        );
        map.insert(
            "image_type".to_string(),
            Value::from(self.image_type.map(|t| t.to_string())),
        );
        Value::Map(map)
    }

    /// Evaluate the exposure's FITS model (or the basic one) into ordered
    /// HDUs, then splice in any extra HDUs.
    pub fn to_hdu_list(&self, extra: &Context) -> Result<Vec<Hdu>, ExposureError> {
        let mut hdus = match &self.fits_model {
            Some(model) => model.to_hdu_list(self, extra)?,
            None => FitsModel::basic().to_hdu_list(self, extra)?,
        };

        for (hdu, index) in &self.extra_hdus {
            match index {
                Some(at) => hdus.insert((*at).min(hdus.len()), hdu.clone()),
                None => hdus.push(hdu.clone()),
            }
        }

        Ok(hdus)
    }

    /// Write the exposure through `writer`.
    ///
    /// Header evaluation is completed synchronously here; only the writer
    /// call runs on the blocking pool, so a failing card aborts before
    /// anything touches disk. With `options.retry`, a failed write is
    /// attempted once more before giving up.
    pub async fn write(
        &self,
        writer: Arc<dyn FitsWriter>,
        extra: &Context,
        options: WriteOptions,
    ) -> Result<(), ExposureError> {
        let path = self
            .filename
            .clone()
            .ok_or(ExposureError::MissingFilename)?;
        let hdus = Arc::new(self.to_hdu_list(extra)?);

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| ExposureError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let attempts = if options.retry { 2 } else { 1 };
        let mut last: BoxError = "write was never attempted".into();

        for attempt in 1..=attempts {
            let writer = Arc::clone(&writer);
            let task_hdus = Arc::clone(&hdus);
            let target = path.clone();
            let task_options = options.clone();

            let result =
                tokio::task::spawn_blocking(move || writer.write(&target, &task_hdus, &task_options))
                    .await;

            match result {
                Ok(Ok(())) => {
                    debug!(path = %path.display(), hdus = hdus.len(), "exposure written");
                    return Ok(());
                }
                Ok(Err(err)) => {
                    warn!(path = %path.display(), attempt, error = %err, "exposure write failed");
                    last = err;
                }
                Err(join) => {
                    warn!(path = %path.display(), attempt, "writer task failed");
                    last = Box::new(join);
                }
            }
        }

        Err(ExposureError::Write { path, source: last })
    }
}
