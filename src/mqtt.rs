use anyhow::{bail, Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, QoS};
use serde::Deserialize;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_topic")]
    topic: String,
    #[serde(default = "MqttConfig::default_qos")]
    qos: u8,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(
        default = "MqttConfig::default_keep_alive_interval",
        with = "humantime_serde"
    )]
    keep_alive_interval: Duration,
    #[serde(
        default = "MqttConfig::default_reconnect_delay",
        with = "humantime_serde"
    )]
    reconnect_delay: Duration,
}

impl MqttConfig {
    fn default_port() -> u16 {
        1883
    }

    fn default_topic() -> String {
        "dalyble".into()
    }

    fn default_qos() -> u8 {
        0
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("dalyble-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_reconnect_delay() -> Duration {
        Duration::from_secs(5)
    }

    pub const DEFAULT_CONFIG_FILE: &str = "mqtt.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    fn qos_level(&self) -> Result<QoS> {
        match self.qos {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            qos => bail!("Invalid MQTT QoS level {qos}, expected 0, 1 or 2"),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options
            .set_keep_alive(self.keep_alive_interval)
            .set_clean_session(true);
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.as_deref().unwrap_or_default());
        }
        options
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
    config: MqttConfig,
    qos: QoS,
    event_loop: JoinHandle<()>,
}

impl MqttPublisher {
    /// Creates the client and spawns the task driving its event loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: MqttConfig) -> Result<Self> {
        let qos = config.qos_level()?;
        log::info!(
            "Connecting to MQTT broker: {}:{} with client_id: {}",
            config.host,
            config.port,
            config.client_id
        );
        let (client, mut connection) = AsyncClient::new(config.options(), 64);

        let reconnect_delay = config.reconnect_delay;
        let event_loop = tokio::spawn(async move {
            loop {
                match connection.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        log::debug!("Disconnected from MQTT broker");
                        break;
                    }
                    Ok(notification) => log::trace!("MQTT event: {notification:?}"),
                    Err(e) => {
                        log::warn!("MQTT connection error: {e}, retrying in {reconnect_delay:?}");
                        tokio::time::sleep(reconnect_delay).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            config,
            qos,
            event_loop,
        })
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    pub async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        log::debug!(
            "Publishing to MQTT: Topic='{}', Payload='{payload}', QoS={:?}",
            topic,
            self.qos
        );

        self.client
            .publish(topic, self.qos, false, payload.as_bytes().to_vec())
            .await
            .with_context(|| format!("Failed to publish message to MQTT topic: {}", topic))?;

        Ok(())
    }

    const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Disconnects after all queued messages were handed to the broker.
    pub async fn close(mut self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .context("Failed to disconnect from MQTT broker")?;
        if tokio::time::timeout(Self::CLOSE_TIMEOUT, &mut self.event_loop)
            .await
            .is_err()
        {
            log::warn!("MQTT event loop did not finish within {:?}", Self::CLOSE_TIMEOUT);
        }
        Ok(())
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}
