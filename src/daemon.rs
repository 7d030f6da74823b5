use anyhow::{bail, Context, Result};
use dalyble_lib::session::{self, Event, SessionConfig, Transport};
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;

use crate::commandline::{CliArgs, MqttFormat, Output};
use crate::mqtt;

pub async fn transport(args: &CliArgs) -> Result<Arc<dyn Transport>> {
    let mut transport = dalyble_lib::ble::BleTransport::new()
        .await
        .context("Cannot open Bluetooth adapter")?;
    transport.set_discovery_timeout(args.discovery_timeout);
    Ok(Arc::new(transport))
}

/// Where acquired events go.
pub enum Sink {
    Console,
    Mqtt {
        publisher: mqtt::MqttPublisher,
        format: MqttFormat,
    },
}

impl Sink {
    pub fn open(output: &Output) -> Result<Self> {
        match output {
            Output::Console => Ok(Sink::Console),
            Output::Mqtt {
                config_file,
                format,
            } => {
                let config = mqtt::MqttConfig::load(config_file)
                    .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
                info!("Successfully loaded MQTT config from {config_file}: {config:?}");
                let publisher = mqtt::MqttPublisher::new(config)
                    .with_context(|| "Failed to create MQTT publisher")?;
                Ok(Sink::Mqtt {
                    publisher,
                    format: format.clone(),
                })
            }
        }
    }

    pub async fn emit(&self, events: &[Event]) -> Result<()> {
        match self {
            Sink::Console => {
                println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
                for event in events {
                    println!("{}", serde_json::to_string_pretty(event)?);
                }
                println!("--------------------------");
            }
            Sink::Mqtt { publisher, format } => {
                for event in events {
                    let topic = format!("{}/{}", publisher.topic(), event.event.device());
                    match format {
                        MqttFormat::Json => {
                            let payload = serde_json::to_string(event)?;
                            if let Err(e) = publisher.publish(&topic, &payload).await {
                                error!("Failed to publish data to MQTT: {e:?}");
                            }
                        }
                        MqttFormat::Simple => {
                            let value = serde_json::to_value(event)?;
                            let mut messages = Vec::new();
                            flatten_simple_format(&topic, &value, &mut messages);
                            for (topic, payload) in messages {
                                if let Err(e) = publisher.publish(&topic, &payload).await {
                                    error!("Failed to publish message to topic {topic}: {e}");
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn close(self) -> Result<()> {
        match self {
            Sink::Console => Ok(()),
            Sink::Mqtt { publisher, .. } => publisher.close().await,
        }
    }
}

/// Turns every leaf of `value` into one `(topic, payload)` message below `topic`.
fn flatten_simple_format(topic: &str, value: &serde_json::Value, messages: &mut Vec<(String, String)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                flatten_simple_format(&format!("{topic}/{k}"), v, messages);
            }
        }
        serde_json::Value::Array(arr) => {
            for (i, v) in arr.iter().enumerate() {
                flatten_simple_format(&format!("{topic}/{i}"), v, messages);
            }
        }
        serde_json::Value::String(s) => messages.push((topic.to_string(), s.clone())),
        serde_json::Value::Number(n) => messages.push((topic.to_string(), n.to_string())),
        serde_json::Value::Bool(b) => messages.push((topic.to_string(), b.to_string())),
        // Do not publish null values
        serde_json::Value::Null => {}
    }
}

/// Runs a single acquisition round and emits its events.
pub async fn run_once(
    transport: Arc<dyn Transport>,
    devices: &[String],
    config: &SessionConfig,
    sink: &Sink,
) -> Result<()> {
    if devices.is_empty() {
        bail!("No device given, use --device");
    }
    let events = session::acquire(transport, devices, config).await;
    info!("Acquired {} events", events.len());
    sink.emit(&events).await
}

pub async fn run(
    transport: Arc<dyn Transport>,
    devices: &[String],
    config: &SessionConfig,
    output: &Output,
    interval: Duration,
) -> Result<()> {
    info!("Starting daemon mode: output={output:?}, interval={interval:?}, devices={devices:?}");
    let sink = Sink::open(output)?;

    loop {
        if let Err(e) = run_once(Arc::clone(&transport), devices, config, &sink).await {
            error!("Acquisition round failed: {e:#}");
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn binary_is_built_with_ble_transport() {
        assert!(cfg!(feature = "ble"));
    }

    #[test]
    fn simple_format_publishes_leaves() {
        let value = json!({
            "event": {
                "device": "bms1",
                "stage": "decode",
                "cells": [3.1, 3.2],
                "mos": null,
                "ok": false,
            },
            "time": 1700000000000i64,
        });
        let mut messages = Vec::new();
        flatten_simple_format("dalyble/bms1", &value, &mut messages);
        messages.sort();

        let expected: Vec<(String, String)> = [
            ("dalyble/bms1/event/cells/0", "3.1"),
            ("dalyble/bms1/event/cells/1", "3.2"),
            ("dalyble/bms1/event/device", "bms1"),
            ("dalyble/bms1/event/ok", "false"),
            ("dalyble/bms1/event/stage", "decode"),
            ("dalyble/bms1/time", "1700000000000"),
        ]
        .into_iter()
        .map(|(t, p)| (t.to_string(), p.to_string()))
        .collect();
        assert_eq!(messages, expected);
    }
}
