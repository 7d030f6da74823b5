use async_trait::async_trait;
use dalyble_lib::protocol::{Command, DecodedFrame, REQUEST_SEQUENCE};
use dalyble_lib::session::{
    acquire, Connection, ErrorRecord, Event, EventPayload, Notifications, SessionConfig, Stage,
    Transport, TransportError,
};
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

const CONFIGURATION_CAPTURE: &str = "d203520c1c0c80000100100000000000020000000000000e100dac0e100a2809c4022f023f01aa019a6ef06d607b707d0000640069000a00050069006e000a000501f40320000a000f0d4800140001000100310057c197";
const RUNTIME_CAPTURE: &str = "d2037c0c740c7f0c7f0c7f0c7f0c800c800c7f0c7e0c7e0c7e0c800c7e0c7e0c7e0c7c0000000000000000000000000000000000000000000000000000000000000000003f003f00ff00ff00ff00ff00ff00ff01ff753000570c800c74003f003f0000010d0010000200020000000100010c7e000c0000000000800000000065a9";

#[derive(Debug, Clone, Copy)]
enum End {
    /// The stream ends after the scripted notifications.
    Close,
    /// The stream stays open until the listen window elapses.
    Pending,
    /// The link breaks after the scripted notifications.
    Fail,
}

#[derive(Debug, Clone)]
enum Script {
    Notify {
        notifications: Vec<Vec<u8>>,
        end: End,
    },
    Panic,
}

#[derive(Debug, Default)]
struct Recorder {
    writes: Mutex<Vec<(String, Vec<u8>)>>,
    disconnects: Mutex<Vec<String>>,
}

#[derive(Default)]
struct MockTransport {
    scripts: HashMap<String, Script>,
    recorder: Arc<Recorder>,
}

impl MockTransport {
    fn with(mut self, device: &str, script: Script) -> Self {
        self.scripts.insert(device.to_string(), script);
        self
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &str) -> Result<Box<dyn Connection>, TransportError> {
        match self.scripts.get(address) {
            None => Err(TransportError::NotFound(address.to_string())),
            Some(Script::Panic) => panic!("adapter crashed"),
            Some(Script::Notify { notifications, end }) => Ok(Box::new(MockConnection {
                device: address.to_string(),
                notifications: notifications.clone(),
                end: *end,
                recorder: Arc::clone(&self.recorder),
            })),
        }
    }
}

struct MockConnection {
    device: String,
    notifications: Vec<Vec<u8>>,
    end: End,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn subscribe(&self) -> Result<Notifications<'_>, TransportError> {
        let items = stream::iter(
            self.notifications
                .clone()
                .into_iter()
                .map(Ok::<_, TransportError>),
        );
        Ok(match self.end {
            End::Close => items.boxed(),
            End::Pending => items.chain(stream::pending()).boxed(),
            End::Fail => items
                .chain(stream::once(async {
                    Err(TransportError::Io(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "link lost",
                    )))
                }))
                .boxed(),
        })
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.recorder
            .writes
            .lock()
            .unwrap()
            .push((self.device.clone(), bytes.to_vec()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.recorder
            .disconnects
            .lock()
            .unwrap()
            .push(self.device.clone());
        Ok(())
    }
}

fn capture(hex: &str) -> Vec<u8> {
    hex::decode(hex).unwrap()
}

fn devices(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn events_of<'a>(events: &'a [Event], device: &str) -> Vec<&'a EventPayload> {
    events
        .iter()
        .map(|event| &event.event)
        .filter(|event| event.device() == device)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn readings_and_errors_keep_arrival_order() {
    let transport = MockTransport::default().with(
        "bms1",
        Script::Notify {
            notifications: vec![
                capture(CONFIGURATION_CAPTURE),
                vec![0x01, 0x02, 0x03],
                capture(RUNTIME_CAPTURE),
            ],
            end: End::Close,
        },
    );

    let events = acquire(
        Arc::new(transport),
        &devices(&["bms1"]),
        &SessionConfig::default(),
    )
    .await;

    let events = events_of(&events, "bms1");
    assert_eq!(events.len(), 3);
    let EventPayload::Reading(first) = events[0] else {
        panic!("expected configuration reading, got {:?}", events[0]);
    };
    assert_eq!(first.reading.command(), Command::SetInfo);
    assert_eq!(
        events[1],
        &EventPayload::Error(ErrorRecord {
            device: "bms1".into(),
            stage: Stage::Framing,
            error: "no frame starting with D2 03 found".into(),
        })
    );
    let EventPayload::Reading(third) = events[2] else {
        panic!("expected runtime reading, got {:?}", events[2]);
    };
    let DecodedFrame::Runtime(runtime) = &third.reading else {
        panic!("expected runtime frame");
    };
    assert_eq!(runtime.total_voltage, 51.1);
    assert_eq!(runtime.cycle_count, 2);
}

#[tokio::test(start_paused = true)]
async fn connection_failure_is_isolated() {
    let transport = MockTransport::default().with(
        "bms1",
        Script::Notify {
            notifications: vec![capture(CONFIGURATION_CAPTURE)],
            end: End::Close,
        },
    );
    let recorder = Arc::clone(&transport.recorder);

    let events = acquire(
        Arc::new(transport),
        &devices(&["missing", "bms1"]),
        &SessionConfig::default(),
    )
    .await;

    assert_eq!(
        events_of(&events, "missing"),
        [&EventPayload::Error(ErrorRecord {
            device: "missing".into(),
            stage: Stage::Connection,
            error: "device 'missing' not found".into(),
        })]
    );
    assert_eq!(events_of(&events, "bms1").len(), 1);
    assert_eq!(*recorder.disconnects.lock().unwrap(), ["bms1"]);
}

#[tokio::test(start_paused = true)]
async fn requests_are_written_in_order() {
    let transport = MockTransport::default().with(
        "bms1",
        Script::Notify {
            notifications: Vec::new(),
            end: End::Close,
        },
    );
    let recorder = Arc::clone(&transport.recorder);

    let events = acquire(
        Arc::new(transport),
        &devices(&["bms1"]),
        &SessionConfig::default(),
    )
    .await;

    assert!(events.is_empty());
    let writes: Vec<Vec<u8>> = recorder
        .writes
        .lock()
        .unwrap()
        .iter()
        .map(|(_, bytes)| bytes.clone())
        .collect();
    assert_eq!(writes, REQUEST_SEQUENCE.map(|request| request.to_vec()));
}

#[tokio::test(start_paused = true)]
async fn listen_window_ends_open_stream() {
    let transport = MockTransport::default().with(
        "bms1",
        Script::Notify {
            notifications: vec![capture(RUNTIME_CAPTURE)],
            end: End::Pending,
        },
    );
    let config = SessionConfig {
        write_delay: Duration::from_millis(100),
        listen_window: Duration::from_secs(10),
    };

    let started = Instant::now();
    let events = acquire(Arc::new(transport), &devices(&["bms1"]), &config).await;

    assert_eq!(events.len(), 1);
    assert!(started.elapsed() >= Duration::from_millis(10_200));
    assert!(started.elapsed() < Duration::from_secs(11));
}

#[tokio::test(start_paused = true)]
async fn broken_link_reports_connection_error() {
    let transport = MockTransport::default().with(
        "bms1",
        Script::Notify {
            notifications: vec![capture(CONFIGURATION_CAPTURE)],
            end: End::Fail,
        },
    );
    let recorder = Arc::clone(&transport.recorder);

    let events = acquire(
        Arc::new(transport),
        &devices(&["bms1"]),
        &SessionConfig::default(),
    )
    .await;

    let events = events_of(&events, "bms1");
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], EventPayload::Reading(_)));
    assert_eq!(
        events[1],
        &EventPayload::Error(ErrorRecord {
            device: "bms1".into(),
            stage: Stage::Connection,
            error: "IO error: link lost".into(),
        })
    );
    assert_eq!(*recorder.disconnects.lock().unwrap(), ["bms1"]);
}

#[tokio::test(start_paused = true)]
async fn panicking_session_becomes_error_record() {
    let transport = MockTransport::default()
        .with("crash", Script::Panic)
        .with(
            "bms1",
            Script::Notify {
                notifications: vec![capture(CONFIGURATION_CAPTURE)],
                end: End::Close,
            },
        );

    let events = acquire(
        Arc::new(transport),
        &devices(&["crash", "bms1"]),
        &SessionConfig::default(),
    )
    .await;

    assert_eq!(
        events_of(&events, "crash"),
        [&EventPayload::Error(ErrorRecord {
            device: "crash".into(),
            stage: Stage::Connection,
            error: "acquisition task panicked".into(),
        })]
    );
    assert_eq!(events_of(&events, "bms1").len(), 1);
}

#[cfg(feature = "serde")]
#[tokio::test(start_paused = true)]
async fn events_serialize_for_egress() {
    let transport = MockTransport::default().with(
        "bms1",
        Script::Notify {
            notifications: vec![capture(RUNTIME_CAPTURE)],
            end: End::Close,
        },
    );

    let events = acquire(
        Arc::new(transport),
        &devices(&["bms1", "missing"]),
        &SessionConfig::default(),
    )
    .await;
    assert_eq!(events.len(), 2);

    let json: Vec<serde_json::Value> = events
        .iter()
        .map(|event| serde_json::to_value(event).unwrap())
        .collect();
    let reading = json
        .iter()
        .find(|event| event["event"]["device"] == "bms1")
        .unwrap();
    assert!(reading["time"].as_i64().unwrap() > 0);
    assert_eq!(reading["event"]["command"], "RUN_INFO (7C)");
    assert_eq!(reading["event"]["status"], "Idle");
    assert_eq!(reading["event"]["cycle_count"], 2);
    assert!(reading["event"].get("reading").is_none());
    assert_eq!(reading["event"]["cell_voltages"]["1"], serde_json::json!(3.188f32));

    let error = json
        .iter()
        .find(|event| event["event"]["device"] == "missing")
        .unwrap();
    assert_eq!(error["event"]["stage"], "connection");
    assert_eq!(error["event"]["error"], "device 'missing' not found");
}
