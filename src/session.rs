//! Acquisition of BMS frames over an abstract notification transport.
//!
//! A session connects to one device, subscribes to notifications, writes the fixed
//! [`REQUEST_SEQUENCE`] and decodes every notification that arrives during the listen
//! window. Decode and connection failures never abort other devices, they are
//! reported as [`ErrorRecord`]s through the same channel as the readings.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use dalyble_lib::session::{acquire, SessionConfig, Transport};
//! # async fn run(transport: Arc<dyn Transport>) {
//! let devices = vec!["41:19:06:01:65:82".to_string()];
//! let events = acquire(transport, &devices, &SessionConfig::default()).await;
//! println!("{} events", events.len());
//! # }
//! ```

use crate::protocol::{self, DecodedFrame, REQUEST_SEQUENCE};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;

#[cfg(feature = "serde")]
use serde::Serialize;

pub const DEFAULT_WRITE_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_LISTEN_WINDOW: Duration = Duration::from_secs(10);

/// Errors raised at the transport boundary.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The device could not be found.
    #[error("device '{0}' not found")]
    NotFound(String),
    /// The adapter, a service or a characteristic is missing.
    #[error("{0} not available")]
    Unavailable(String),
    /// An I/O error from the underlying link.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// An error from the `bluest` crate.
    #[cfg(feature = "ble")]
    #[error("BLE error: {0}")]
    Ble(#[from] bluest::Error),
}

/// Raw notification buffers in arrival order.
pub type Notifications<'a> = BoxStream<'a, Result<Vec<u8>, TransportError>>;

/// Opens connections to devices.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Box<dyn Connection>, TransportError>;
}

/// An established link to one device.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Subscribes to notifications. Dropping the stream unsubscribes.
    async fn subscribe(&self) -> Result<Notifications<'_>, TransportError>;

    /// Writes a request to the device.
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// The step that produced an error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize), serde(rename_all = "snake_case"))]
pub enum Stage {
    Connection,
    Framing,
    Decode,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Stage::Connection => write!(f, "connection"),
            Stage::Framing => write!(f, "framing"),
            Stage::Decode => write!(f, "decode"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct ErrorRecord {
    pub device: String,
    pub stage: Stage,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Reading {
    pub device: String,
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub reading: DecodedFrame,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize), serde(untagged))]
pub enum EventPayload {
    Reading(Reading),
    Error(ErrorRecord),
}

impl EventPayload {
    pub fn device(&self) -> &str {
        match self {
            EventPayload::Reading(reading) => &reading.device,
            EventPayload::Error(error) => &error.device,
        }
    }
}

/// An event as handed to the egress sink.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Event {
    pub event: EventPayload,
    /// Milliseconds since the UNIX epoch
    pub time: i64,
}

impl Event {
    pub fn now(event: EventPayload) -> Self {
        Self {
            event,
            time: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Pause after each request write
    pub write_delay: Duration,
    /// How long notifications are accepted after the last write
    pub listen_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            write_delay: DEFAULT_WRITE_DELAY,
            listen_window: DEFAULT_LISTEN_WINDOW,
        }
    }
}

/// Acquisition of a single device.
#[derive(Debug)]
pub struct AcquisitionSession {
    device: String,
    config: SessionConfig,
    events: mpsc::UnboundedSender<Event>,
}

impl AcquisitionSession {
    pub fn new(
        device: impl Into<String>,
        config: SessionConfig,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            device: device.into(),
            config,
            events,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Runs the session to the end of its listen window.
    ///
    /// A failure to connect, subscribe or write produces exactly one connection
    /// error record and ends the session.
    pub async fn run<T>(&self, transport: &T)
    where
        T: Transport + ?Sized,
    {
        log::info!("[{}] connecting", self.device);
        let connection = match transport.connect(&self.device).await {
            Ok(connection) => connection,
            Err(err) => {
                self.report(Stage::Connection, &err);
                return;
            }
        };
        log::debug!("[{}] connected", self.device);

        if let Err(err) = self.listen(connection.as_ref()).await {
            self.report(Stage::Connection, &err);
        }
        if let Err(err) = connection.disconnect().await {
            log::warn!("[{}] disconnect failed: {err}", self.device);
        }
        log::info!("[{}] session finished", self.device);
    }

    async fn listen(&self, connection: &dyn Connection) -> Result<(), TransportError> {
        let mut notifications = connection.subscribe().await?;

        for request in REQUEST_SEQUENCE.iter() {
            log::trace!("[{}] write bytes: {request:02X?}", self.device);
            connection.write(request).await?;
            tokio::time::sleep(self.config.write_delay).await;
        }

        let deadline = Instant::now() + self.config.listen_window;
        loop {
            match tokio::time::timeout_at(deadline, notifications.next()).await {
                Err(_) => {
                    log::debug!("[{}] listen window elapsed", self.device);
                    break;
                }
                Ok(None) => {
                    log::debug!("[{}] end of notification stream", self.device);
                    break;
                }
                Ok(Some(Ok(bytes))) => self.process(&bytes),
                Ok(Some(Err(err))) => return Err(err),
            }
        }
        Ok(())
    }

    /// Decodes one notification, every frame result becomes an event.
    pub fn process(&self, bytes: &[u8]) {
        log::trace!("[{}] notification: {bytes:02X?}", self.device);
        match protocol::decode_notification(bytes) {
            Err(err) => self.report(Stage::Framing, &err),
            Ok(results) => {
                for result in results {
                    match result {
                        Ok(frame) => {
                            log::info!("[{}] decoded {}", self.device, frame.command());
                            self.send(EventPayload::Reading(Reading {
                                device: self.device.clone(),
                                reading: frame,
                            }));
                        }
                        Err(err) => self.report(Stage::Decode, &err),
                    }
                }
            }
        }
    }

    fn report(&self, stage: Stage, error: &impl fmt::Display) {
        log::warn!("[{}] {stage} error: {error}", self.device);
        self.send(EventPayload::Error(ErrorRecord {
            device: self.device.clone(),
            stage,
            error: error.to_string(),
        }));
    }

    fn send(&self, event: EventPayload) {
        if self.events.send(Event::now(event)).is_err() {
            log::warn!("[{}] event receiver dropped, event lost", self.device);
        }
    }
}

/// Runs one session per device concurrently and returns all events once every
/// session has finished.
pub async fn acquire<T>(transport: Arc<T>, devices: &[String], config: &SessionConfig) -> Vec<Event>
where
    T: Transport + ?Sized + 'static,
{
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let mut tasks = JoinSet::new();

    for device in devices {
        let session = AcquisitionSession::new(device.clone(), config.clone(), sender.clone());
        let transport = Arc::clone(&transport);
        tasks.spawn(async move {
            let outcome = AssertUnwindSafe(session.run(transport.as_ref()))
                .catch_unwind()
                .await;
            if outcome.is_err() {
                log::error!("[{}] acquisition task panicked", session.device());
                session.report(Stage::Connection, &"acquisition task panicked");
            }
        });
    }
    drop(sender);

    while let Some(result) = tasks.join_next().await {
        if let Err(err) = result {
            log::error!("Acquisition task failed: {err}");
        }
    }

    let mut events = Vec::new();
    while let Some(event) = receiver.recv().await {
        events.push(event);
    }
    log::debug!(
        "Acquired {} events from {} devices",
        events.len(),
        devices.len()
    );
    events
}
