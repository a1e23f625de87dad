//! MQTT transport: sample ingestion and estimate publishing.
use std::time::{Duration, Instant};

use rumqttc::{Client, Connection, Event, Incoming, MqttOptions, QoS};

use sailtrack::config::MqttConfig;
use sailtrack::runtime::{EstimateSink, FusionContext, SinkError};
use sailtrack::NavigationSolution;

/// Delay before polling the connection again after a transport error.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_s));
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }
    options
}

/// Which sensor a topic carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensorTopic {
    Gps,
    Imu,
}

pub fn classify(config: &MqttConfig, topic: &str) -> Option<SensorTopic> {
    if topic == config.gps_topic {
        Some(SensorTopic::Gps)
    } else if topic == config.imu_topic {
        Some(SensorTopic::Imu)
    } else {
        None
    }
}

/// Feed one incoming payload to the fusion context. Returns whether a sample was accepted.
pub fn route(context: &FusionContext, config: &MqttConfig, topic: &str, payload: &[u8]) -> bool {
    match classify(config, topic) {
        Some(SensorTopic::Gps) => context.ingest_gps_payload(payload),
        Some(SensorTopic::Imu) => context.ingest_imu_payload(payload),
        None => {
            log::trace!("ignoring message on {topic}");
            false
        }
    }
}

fn subscribe(client: &Client, config: &MqttConfig) {
    for topic in [&config.gps_topic, &config.imu_topic] {
        match client.subscribe(topic.as_str(), QoS::AtMostOnce) {
            Ok(()) => log::info!("subscribed to {topic}"),
            Err(e) => log::error!("failed to subscribe to {topic}: {e}"),
        }
    }
}

/// Drive the MQTT connection until shutdown, routing sensor payloads into `context`.
///
/// Subscriptions are renewed on every ConnAck so that they survive reconnects.
pub fn run_ingestion(
    mut connection: Connection,
    client: &Client,
    context: &FusionContext,
    config: &MqttConfig,
) {
    log::info!("connecting to {}:{}", config.host, config.port);
    for notification in connection.iter() {
        if context.shutdown.is_triggered() {
            break;
        }
        match notification {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                log::info!("connected to broker ({:?})", ack.code);
                subscribe(client, config);
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                route(context, config, &publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("MQTT connection error: {e}; retrying in {RECONNECT_BACKOFF:?}");
                if context.shutdown.sleep_until(Instant::now() + RECONNECT_BACKOFF) {
                    break;
                }
            }
        }
    }
    log::info!("MQTT ingestion stopped");
}

/// Publishes navigation solutions as JSON on the output topic.
pub struct MqttSink {
    client: Client,
    topic: String,
}

impl MqttSink {
    pub fn new(client: Client, topic: String) -> Self {
        MqttSink { client, topic }
    }
}

impl EstimateSink for MqttSink {
    fn publish(&mut self, solution: &NavigationSolution) -> Result<(), SinkError> {
        let payload = serde_json::to_vec(solution)?;
        self.client
            .try_publish(self.topic.as_str(), QoS::AtMostOnce, false, payload)
            .map_err(|e| SinkError::Transport(e.to_string()))
    }
}
