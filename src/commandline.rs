use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use dalyble_lib::session::SessionConfig;
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Decode hex dumps of BLE notifications without connecting to a device
    Decode {
        /// Hex encoded notifications (e.g. "d203520c1c0000")
        #[arg(required = true)]
        notifications: Vec<String>,
    },
    /// Run one acquisition round on all devices and output the collected events
    Acquire {
        /// Output destination for events
        #[command(subcommand)]
        output: Output,
    },
    /// Run in daemon mode, periodically acquiring all devices
    Daemon {
        /// Output destination for events
        #[command(subcommand)]
        output: Output,
        /// Interval between acquisition rounds (e.g., "30s", "5m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "60s")]
        interval: Duration,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Output {
    /// Print events as JSON to the standard output (console).
    Console,
    /// Publish events to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "daly bms bluetooth command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// BLE address or advertised name of a BMS, comma separated or repeated
    #[arg(short = 'd', long = "device", value_delimiter = ',')]
    pub devices: Vec<String>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// How long notifications are accepted after the requests were written (e.g., "10s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "10s")]
    pub listen_window: Duration,

    /// Delay after each request write (e.g., "100ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "100ms")]
    pub write_delay: Duration,

    /// Time allowed for finding a device while scanning (e.g., "30s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "30s")]
    pub discovery_timeout: Duration,
}

impl CliArgs {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            write_delay: self.write_delay,
            listen_window: self.listen_window,
        }
    }
}
