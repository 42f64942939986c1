//! MQTT device bus backend.
//!
//! Topic layout:
//!
//! - `devices/{id}/state`: device state frames (retained by the broker, so
//!   the packet's retain flag distinguishes cached replays from fresh
//!   reports)
//! - `devices/{id}/cmd`: command envelopes published by the engine
//! - `devices/{id}/result`: command results published by devices

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use domo_core::{CommandEnvelope, DeviceFrame, ResultEnvelope};

use crate::{BusError, DeviceBus};

const CHANNEL_CAPACITY: usize = 256;

/// Configuration for the MQTT bus backend.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client identifier presented to the broker.
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: 1883,
            client_id: String::from("domo-engine"),
        }
    }
}

/// MQTT-backed implementation of [`DeviceBus`].
///
/// Owns the rumqttc event loop in a background task that decodes incoming
/// publishes into frames and results and fans them out over broadcast
/// channels. Malformed payloads are logged and skipped, never fatal.
pub struct MqttDeviceBus {
    client: AsyncClient,
    frames: broadcast::Sender<DeviceFrame>,
    results: broadcast::Sender<ResultEnvelope>,
}

impl MqttDeviceBus {
    /// Connect to the broker and subscribe to the device topics.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Connection`] if the initial subscriptions cannot
    /// be queued.
    pub async fn connect(config: &MqttConfig) -> Result<Self, BusError> {
        let mut options =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(std::time::Duration::from_secs(30));

        let (client, mut event_loop) = AsyncClient::new(options, CHANNEL_CAPACITY);
        client
            .subscribe("devices/+/state", QoS::AtLeastOnce)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        client
            .subscribe("devices/+/result", QoS::AtLeastOnce)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let frames = broadcast::channel(CHANNEL_CAPACITY).0;
        let results = broadcast::channel(CHANNEL_CAPACITY).0;

        let frames_tx = frames.clone();
        let results_tx = results.clone();
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        dispatch_publish(&publish, &frames_tx, &results_tx);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt event loop error, reconnecting");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            frames,
            results,
        })
    }
}

fn dispatch_publish(
    publish: &rumqttc::Publish,
    frames: &broadcast::Sender<DeviceFrame>,
    results: &broadcast::Sender<ResultEnvelope>,
) {
    let Some((device_id, channel)) = parse_topic(&publish.topic) else {
        debug!(topic = %publish.topic, "ignoring publish on unrecognized topic");
        return;
    };

    match channel {
        "state" => match serde_json::from_slice::<serde_json::Value>(&publish.payload) {
            Ok(state) => {
                let _ = frames.send(DeviceFrame {
                    device_id: device_id.to_owned(),
                    state,
                    retained: publish.retain,
                });
            }
            Err(e) => warn!(topic = %publish.topic, error = %e, "malformed state frame"),
        },
        "result" => match serde_json::from_slice::<ResultEnvelope>(&publish.payload) {
            Ok(result) => {
                let _ = results.send(result);
            }
            Err(e) => warn!(topic = %publish.topic, error = %e, "malformed result envelope"),
        },
        _ => {}
    }
}

/// Split `devices/{id}/{channel}` into its device id and channel.
fn parse_topic(topic: &str) -> Option<(&str, &str)> {
    let mut parts = topic.splitn(3, '/');
    if parts.next()? != "devices" {
        return None;
    }
    let device_id = parts.next()?;
    let channel = parts.next()?;
    if device_id.is_empty() || channel.contains('/') {
        return None;
    }
    Some((device_id, channel))
}

#[async_trait]
impl DeviceBus for MqttDeviceBus {
    async fn publish_command(&self, command: &CommandEnvelope) -> Result<(), BusError> {
        let topic = format!("devices/{}/cmd", command.device_id);
        let payload =
            serde_json::to_vec(command).map_err(|e| BusError::Publish(e.to_string()))?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    fn subscribe_frames(&self) -> broadcast::Receiver<DeviceFrame> {
        self.frames.subscribe()
    }

    fn subscribe_results(&self) -> broadcast::Receiver<ResultEnvelope> {
        self.results.subscribe()
    }
}
