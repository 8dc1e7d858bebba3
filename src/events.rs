//! Camera lifecycle events and their fan-out.
//!
//! Cameras announce state transitions (connection, exposure progress,
//! cooler set points) through an [`EventNotifier`]. Delivery uses a
//! broadcast channel: any number of listeners subscribe independently, a
//! notifier with no listeners drops events silently, and `notify` never
//! blocks the camera's line of execution.

use std::collections::BTreeMap;
use std::fmt;

use tokio::sync::broadcast;
use tracing::trace;

use crate::eval::Value;

/// Camera state transitions announced to listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum CameraEvent {
    Connected,
    ConnectFailed,
    Disconnected,
    DisconnectFailed,
    ExposureFlushing,
    ExposureIntegrating,
    ExposureReading,
    ExposureRead,
    ExposureFailed,
    ExposureWriting,
    ExposureWritten,
    NewSetPoint,
    SetPointReached,
}

impl CameraEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraEvent::Connected => "connected",
            CameraEvent::ConnectFailed => "connect_failed",
            CameraEvent::Disconnected => "disconnected",
            CameraEvent::DisconnectFailed => "disconnect_failed",
            CameraEvent::ExposureFlushing => "flushing",
            CameraEvent::ExposureIntegrating => "integrating",
            CameraEvent::ExposureReading => "reading",
            CameraEvent::ExposureRead => "read",
            CameraEvent::ExposureFailed => "failed",
            CameraEvent::ExposureWriting => "writing",
            CameraEvent::ExposureWritten => "written",
            CameraEvent::NewSetPoint => "new_set_point",
            CameraEvent::SetPointReached => "set_point_reached",
        }
    }
}

impl fmt::Display for CameraEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event plus the information associated with it.
#[derive(Clone, Debug)]
pub struct Event {
    kind: CameraEvent,
    payload: BTreeMap<String, Value>,
}

impl Event {
    pub fn new(kind: CameraEvent) -> Self {
        Self {
            kind,
            payload: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(name.into(), value.into());
        self
    }

    pub fn kind(&self) -> CameraEvent {
        self.kind
    }

    pub fn payload(&self) -> &BTreeMap<String, Value> {
        &self.payload
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}

/// Fans events out to every subscribed listener.
#[derive(Clone, Debug)]
pub struct EventNotifier {
    tx: broadcast::Sender<Event>,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    /// `capacity` bounds how far a slow listener may lag before it starts
    /// missing events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Send `event` to every listener. Never blocks; an event with no
    /// listeners is dropped.
    pub fn notify(&self, event: Event) {
        trace!(event = %event.kind(), "camera event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_without_listeners_is_silent() {
        let notifier = EventNotifier::new();
        notifier.notify(Event::new(CameraEvent::Connected));
    }

    #[tokio::test]
    async fn listeners_receive_events_in_order() {
        let notifier = EventNotifier::new();
        let mut rx = notifier.subscribe();

        notifier.notify(Event::new(CameraEvent::ExposureIntegrating).with("exptime", 2.0));
        notifier.notify(Event::new(CameraEvent::ExposureRead));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind(), CameraEvent::ExposureIntegrating);
        assert_eq!(first.get("exptime"), Some(&Value::Float(2.0)));
        assert_eq!(rx.recv().await.unwrap().kind(), CameraEvent::ExposureRead);
    }

    #[tokio::test]
    async fn independent_listeners_see_the_same_events() {
        let notifier = EventNotifier::new();
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();

        notifier.notify(Event::new(CameraEvent::Disconnected));

        assert_eq!(a.recv().await.unwrap().kind(), CameraEvent::Disconnected);
        assert_eq!(b.recv().await.unwrap().kind(), CameraEvent::Disconnected);
    }
}
