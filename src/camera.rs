//! The camera abstraction: one uniform surface over a vendor SDK.
//!
//! Integrators implement [`CameraDevice`] (and whichever capability traits
//! the hardware supports) against the vendor library; [`Camera`] drives the
//! lifecycle on top of it: connection guards, exposure sequencing with
//! event notification, frame stacking, and assembly of the [`Exposure`]
//! that feeds the header engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::eval::{Context, Value};
use crate::events::{CameraEvent, Event, EventNotifier};
use crate::exposure::{
    CameraContext, Exposure, ExposureError, FitsWriter, ImageData, ImageType, StackFunction,
    WriteOptions,
};
use crate::header::FitsModel;

/// Free-form connection settings forwarded to the device implementation.
pub type ConnectionParams = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera {0} is already connected")]
    AlreadyConnected(String),
    #[error("camera {0} is not connected")]
    NotConnected(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("device error: {0}")]
    Device(String),
    #[error(transparent)]
    Exposure(#[from] ExposureError),
}

/// Parameters of one exposure request.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExposeRequest {
    exptime: f64,
    image_type: ImageType,
    stack_count: u32,
    stack_function: StackFunction,
}

impl ExposeRequest {
    pub fn new(exptime: f64, image_type: ImageType) -> Self {
        Self {
            exptime,
            image_type,
            stack_count: 1,
            stack_function: StackFunction::Median,
        }
    }

    /// Take `count` integrations and combine them with `function`.
    pub fn with_stack(mut self, count: u32, function: StackFunction) -> Self {
        self.stack_count = count;
        self.stack_function = function;
        self
    }

    pub fn exptime(&self) -> f64 {
        self.exptime
    }

    pub fn image_type(&self) -> ImageType {
        self.image_type
    }

    pub fn stack_count(&self) -> u32 {
        self.stack_count
    }

    pub fn stack_function(&self) -> StackFunction {
        self.stack_function
    }
}

/// The seam an integrator implements against the vendor SDK.
///
/// One call to [`CameraDevice::expose`] is a single integration: shutter
/// handling, integration and readout. Stacking, events and exposure
/// assembly live in [`Camera`].
#[async_trait]
pub trait CameraDevice: Send + Sync {
    /// The device's unique identifier, once known.
    fn uid(&self) -> Option<String> {
        None
    }

    /// Hardware model designation.
    fn model(&self) -> Option<String> {
        None
    }

    /// A snapshot of device telemetry, exposed to the header engine as
    /// `__camera__.status`.
    fn status(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    async fn connect(&mut self, params: &ConnectionParams) -> Result<(), CameraError>;

    async fn disconnect(&mut self) -> Result<(), CameraError>;

    /// Perform one integration and return the frame.
    async fn expose(&mut self, request: &ExposeRequest) -> Result<ImageData, CameraError>;
}

/// Manual shutter control, for hardware whose firmware does not handle the
/// shutter during exposures.
#[async_trait]
pub trait ShutterDevice: CameraDevice {
    async fn set_shutter_internal(&mut self, open: bool) -> Result<(), CameraError>;

    async fn get_shutter_internal(&self) -> Result<bool, CameraError>;
}

/// Cooling control.
#[async_trait]
pub trait CoolerDevice: CameraDevice {
    /// Command a new set point and return immediately.
    async fn set_temperature_internal(&mut self, celsius: f64) -> Result<(), CameraError>;

    /// The temperature the cooler regulates.
    async fn get_temperature_internal(&self) -> Result<f64, CameraError>;
}

/// Image area and binning selection. Areas are 1-indexed
/// `(x0, x1, y0, y1)`.
#[async_trait]
pub trait ImageAreaDevice: CameraDevice {
    async fn get_image_area_internal(&self) -> Result<(u32, u32, u32, u32), CameraError>;

    /// `None` restores the full frame.
    async fn set_image_area_internal(
        &mut self,
        area: Option<(u32, u32, u32, u32)>,
    ) -> Result<(), CameraError>;

    async fn get_binning_internal(&self) -> Result<(u32, u32), CameraError>;

    async fn set_binning_internal(&mut self, hbin: u32, vbin: u32) -> Result<(), CameraError>;
}

/// A camera: a [`CameraDevice`] plus the lifecycle driven on top of it.
#[derive(Debug)]
pub struct Camera<D> {
    name: String,
    device: D,
    notifier: EventNotifier,
    connected: bool,
    version: Option<String>,
    fits_model: Option<Arc<FitsModel>>,
}

impl<D: CameraDevice> Camera<D> {
    pub fn new(name: impl Into<String>, device: D) -> Self {
        Self {
            name: name.into(),
            device,
            notifier: EventNotifier::new(),
            connected: false,
            version: None,
            fits_model: None,
        }
    }

    /// The vendor library version, recorded in the VCAM keyword.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// The FITS model attached to every exposure this camera takes.
    pub fn with_fits_model(mut self, model: FitsModel) -> Self {
        self.fits_model = Some(Arc::new(model));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn notifier(&self) -> &EventNotifier {
        &self.notifier
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.notifier.subscribe()
    }

    /// The snapshot of this camera that exposures carry into header
    /// evaluation.
    pub fn context_snapshot(&self) -> CameraContext {
        let mut context = CameraContext::new(&self.name).with_status(self.device.status());
        if let Some(uid) = self.device.uid() {
            context = context.with_uid(uid);
        }
        if let Some(version) = &self.version {
            context = context.with_version(version.clone());
        }
        if let Some(model) = self.device.model() {
            context = context.with_model(model);
        }
        context
    }

    fn event(&self, kind: CameraEvent) -> Event {
        let mut event = Event::new(kind).with("name", self.name.as_str());
        if let Some(uid) = self.device.uid() {
            event = event.with("uid", uid);
        }
        event
    }

    pub async fn connect(&mut self, params: &ConnectionParams) -> Result<(), CameraError> {
        if self.connected {
            return Err(CameraError::AlreadyConnected(self.name.clone()));
        }

        match self.device.connect(params).await {
            Ok(()) => {
                self.connected = true;
                if self.device.uid().is_none() {
                    warn!(camera = %self.name, "camera connected but reports no UID");
                }
                info!(camera = %self.name, "camera connected");
                self.notifier.notify(self.event(CameraEvent::Connected));
                Ok(())
            }
            Err(err) => {
                self.notifier.notify(
                    self.event(CameraEvent::ConnectFailed)
                        .with("error", err.to_string()),
                );
                Err(err)
            }
        }
    }

    pub async fn disconnect(&mut self) -> Result<(), CameraError> {
        if !self.connected {
            return Err(CameraError::NotConnected(self.name.clone()));
        }

        match self.device.disconnect().await {
            Ok(()) => {
                self.connected = false;
                info!(camera = %self.name, "camera disconnected");
                self.notifier.notify(self.event(CameraEvent::Disconnected));
                Ok(())
            }
            Err(err) => {
                self.notifier.notify(
                    self.event(CameraEvent::DisconnectFailed)
                        .with("error", err.to_string()),
                );
                Err(err)
            }
        }
    }

    /// Run one exposure request through the full lifecycle and return the
    /// assembled [`Exposure`], ready to write.
    ///
    /// Events fire in order: flushing, integrating (one series covering
    /// every stacked integration), reading, read. A device or stacking
    /// failure fires `ExposureFailed` with the error message before it
    /// propagates.
    pub async fn expose(&mut self, request: &ExposeRequest) -> Result<Exposure, CameraError> {
        if !self.connected {
            return Err(CameraError::NotConnected(self.name.clone()));
        }

        let obstime = Utc::now();
        self.notifier
            .notify(self.event(CameraEvent::ExposureFlushing));
        self.notifier.notify(
            self.event(CameraEvent::ExposureIntegrating)
                .with("exptime", request.exptime())
                .with("image_type", request.image_type().to_string())
                .with("stack", request.stack_count()),
        );

        let mut frames = Vec::with_capacity(request.stack_count() as usize);
        for _ in 0..request.stack_count() {
            match self.device.expose(request).await {
                Ok(frame) => frames.push(frame),
                Err(err) => {
                    self.notify_failed(&err);
                    return Err(err);
                }
            }
        }

        self.notifier
            .notify(self.event(CameraEvent::ExposureReading));

        let data = match frames.len() {
            1 => frames.remove(0),
            _ => match request.stack_function().combine(&frames) {
                Ok(data) => data,
                Err(err) => {
                    let err = CameraError::from(err);
                    self.notify_failed(&err);
                    return Err(err);
                }
            },
        };

        let mut exposure = Exposure::new(self.context_snapshot())
            .with_obstime(obstime)
            .with_data(data)
            .with_exptime(request.exptime())
            .with_stack(request.stack_count(), request.stack_function())
            .with_image_type(request.image_type());
        if let Some(model) = &self.fits_model {
            exposure = exposure.with_fits_model(Arc::clone(model));
        }

        self.notifier.notify(self.event(CameraEvent::ExposureRead));

        Ok(exposure)
    }

    fn notify_failed(&self, err: &CameraError) {
        self.notifier.notify(
            self.event(CameraEvent::ExposureFailed)
                .with("error", err.to_string()),
        );
    }

    /// Write `exposure` through `writer`, announcing progress to
    /// listeners.
    ///
    /// Emits `ExposureWriting` before the write and `ExposureWritten` with
    /// the filename on success; a failure emits `ExposureFailed` with the
    /// error message (which names the offending card or macro) before it
    /// propagates.
    pub async fn write_exposure(
        &self,
        exposure: &Exposure,
        writer: Arc<dyn FitsWriter>,
        extra: &Context,
        options: WriteOptions,
    ) -> Result<(), CameraError> {
        self.notifier
            .notify(self.event(CameraEvent::ExposureWriting));

        match exposure.write(writer, extra, options).await {
            Ok(()) => {
                let mut event = self.event(CameraEvent::ExposureWritten);
                if let Some(filename) = exposure.filename() {
                    event = event.with("filename", filename.display().to_string());
                }
                self.notifier.notify(event);
                Ok(())
            }
            Err(err) => {
                let err = CameraError::from(err);
                self.notify_failed(&err);
                Err(err)
            }
        }
    }

    /// Take a zero-second bias frame.
    pub async fn bias(&mut self) -> Result<Exposure, CameraError> {
        self.expose(&ExposeRequest::new(0.0, ImageType::Bias)).await
    }

    pub async fn dark(&mut self, exptime: f64) -> Result<Exposure, CameraError> {
        self.expose(&ExposeRequest::new(exptime, ImageType::Dark))
            .await
    }

    pub async fn flat(&mut self, exptime: f64) -> Result<Exposure, CameraError> {
        self.expose(&ExposeRequest::new(exptime, ImageType::Flat))
            .await
    }

    /// Take a science frame.
    pub async fn object(&mut self, exptime: f64) -> Result<Exposure, CameraError> {
        self.expose(&ExposeRequest::new(exptime, ImageType::Object))
            .await
    }
}

impl<D: ShutterDevice> Camera<D> {
    pub async fn get_shutter(&self) -> Result<bool, CameraError> {
        self.device.get_shutter_internal().await
    }

    /// Move the shutter. The move is skipped when the shutter already is
    /// in the commanded position, unless `force` is set.
    pub async fn set_shutter(&mut self, open: bool, force: bool) -> Result<(), CameraError> {
        if !force && self.device.get_shutter_internal().await? == open {
            return Ok(());
        }
        self.device.set_shutter_internal(open).await
    }

    pub async fn open_shutter(&mut self) -> Result<(), CameraError> {
        self.set_shutter(true, false).await
    }

    pub async fn close_shutter(&mut self) -> Result<(), CameraError> {
        self.set_shutter(false, false).await
    }
}

impl<D: CoolerDevice> Camera<D> {
    pub async fn temperature(&self) -> Result<f64, CameraError> {
        self.device.get_temperature_internal().await
    }

    /// Command a new set point and wait until the cooler reaches it.
    ///
    /// Emits `NewSetPoint` once the command is accepted and
    /// `SetPointReached` when the temperature settles within 0.1 C of the
    /// goal. Polls the device twice a second until then.
    pub async fn set_temperature(&mut self, celsius: f64) -> Result<(), CameraError> {
        self.device.set_temperature_internal(celsius).await?;
        self.notifier.notify(
            self.event(CameraEvent::NewSetPoint)
                .with("temperature", celsius),
        );

        loop {
            let current = self.device.get_temperature_internal().await?;
            if (current - celsius).abs() <= 0.1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        self.notifier.notify(
            self.event(CameraEvent::SetPointReached)
                .with("temperature", celsius),
        );
        Ok(())
    }
}

impl<D: ImageAreaDevice> Camera<D> {
    /// The imaging area as 1-indexed `(x0, x1, y0, y1)`.
    pub async fn image_area(&self) -> Result<(u32, u32, u32, u32), CameraError> {
        self.device.get_image_area_internal().await
    }

    /// Set the imaging area; `None` restores the full frame.
    pub async fn set_image_area(
        &mut self,
        area: Option<(u32, u32, u32, u32)>,
    ) -> Result<(), CameraError> {
        self.device.set_image_area_internal(area).await
    }

    pub async fn binning(&self) -> Result<(u32, u32), CameraError> {
        self.device.get_binning_internal().await
    }

    /// Set the binning. `vbin` defaults to `hbin`.
    pub async fn set_binning(&mut self, hbin: u32, vbin: Option<u32>) -> Result<(), CameraError> {
        self.device
            .set_binning_internal(hbin, vbin.unwrap_or(hbin))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockDevice {
        level: u16,
        shutter_open: bool,
        shutter_moves: u32,
    }

    impl MockDevice {
        fn new() -> Self {
            Self {
                level: 100,
                shutter_open: false,
                shutter_moves: 0,
            }
        }
    }

    #[async_trait]
    impl CameraDevice for MockDevice {
        fn uid(&self) -> Option<String> {
            Some("DEV_12345".to_string())
        }

        fn status(&self) -> BTreeMap<String, Value> {
            let mut status = BTreeMap::new();
            status.insert("level".to_string(), Value::Int(self.level as i64));
            status
        }

        async fn connect(&mut self, _: &ConnectionParams) -> Result<(), CameraError> {
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), CameraError> {
            Ok(())
        }

        async fn expose(&mut self, _: &ExposeRequest) -> Result<ImageData, CameraError> {
            // Each integration reads a brighter frame, so stacking is
            // observable.
            self.level += 10;
            Ok(ImageData::new(2, 2, vec![self.level; 4])?)
        }
    }

    #[async_trait]
    impl ShutterDevice for MockDevice {
        async fn set_shutter_internal(&mut self, open: bool) -> Result<(), CameraError> {
            self.shutter_open = open;
            self.shutter_moves += 1;
            Ok(())
        }

        async fn get_shutter_internal(&self) -> Result<bool, CameraError> {
            Ok(self.shutter_open)
        }
    }

    async fn connected_camera() -> Camera<MockDevice> {
        let mut camera = Camera::new("mock", MockDevice::new()).with_version("1.2.3");
        camera.connect(&ConnectionParams::new()).await.unwrap();
        camera
    }

    #[tokio::test]
    async fn double_connect_is_rejected() {
        let mut camera = connected_camera().await;
        assert!(matches!(
            camera.connect(&ConnectionParams::new()).await,
            Err(CameraError::AlreadyConnected(_))
        ));
    }

    #[tokio::test]
    async fn expose_requires_a_connection() {
        let mut camera = Camera::new("mock", MockDevice::new());
        assert!(matches!(
            camera.object(1.0).await,
            Err(CameraError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn expose_emits_the_lifecycle_events() {
        let mut camera = connected_camera().await;
        let mut rx = camera.subscribe();

        camera.object(1.5).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        assert_eq!(
            kinds,
            [
                CameraEvent::ExposureFlushing,
                CameraEvent::ExposureIntegrating,
                CameraEvent::ExposureReading,
                CameraEvent::ExposureRead,
            ]
        );
    }

    #[tokio::test]
    async fn exposure_carries_the_camera_snapshot() {
        let mut camera = connected_camera().await;
        let exposure = camera.object(2.0).await.unwrap();

        assert_eq!(exposure.camera().name(), "mock");
        assert_eq!(exposure.camera().uid(), Some("DEV_12345"));
        assert_eq!(exposure.exptime(), Some(2.0));
        assert_eq!(exposure.image_type(), Some(ImageType::Object));
        assert!(exposure.data().is_some());
    }

    #[tokio::test]
    async fn stacked_exposures_combine_frames() {
        let mut camera = connected_camera().await;
        let request =
            ExposeRequest::new(1.0, ImageType::Object).with_stack(3, StackFunction::Median);
        let exposure = camera.expose(&request).await.unwrap();

        // Frames read 110, 120, 130; the median lands in the middle.
        assert_eq!(exposure.data().unwrap().pixels(), &[120; 4]);
        assert_eq!(exposure.stack_count(), 3);
        assert_eq!(exposure.exptime_n(), Some(3.0));
    }

    #[tokio::test]
    async fn shutter_move_is_skipped_when_in_position() {
        let mut camera = connected_camera().await;

        camera.open_shutter().await.unwrap();
        assert_eq!(camera.device().shutter_moves, 1);

        // Already open: no second command.
        camera.open_shutter().await.unwrap();
        assert_eq!(camera.device().shutter_moves, 1);

        camera.set_shutter(true, true).await.unwrap();
        assert_eq!(camera.device().shutter_moves, 2);
    }
}
