//! In-memory device bus backend.

use async_trait::async_trait;
use tokio::sync::broadcast;

use domo_core::{CommandEnvelope, DeviceFrame, ResultEnvelope};

use crate::{BusError, DeviceBus};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast-channel device bus for tests and single-process setups.
///
/// Frames and results are injected with [`emit_frame`](Self::emit_frame) and
/// [`emit_result`](Self::emit_result); published commands can be observed
/// with [`subscribe_commands`](Self::subscribe_commands).
#[derive(Debug)]
pub struct MemoryDeviceBus {
    frames: broadcast::Sender<DeviceFrame>,
    results: broadcast::Sender<ResultEnvelope>,
    commands: broadcast::Sender<CommandEnvelope>,
}

impl MemoryDeviceBus {
    /// Create a new in-memory bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames: broadcast::channel(CHANNEL_CAPACITY).0,
            results: broadcast::channel(CHANNEL_CAPACITY).0,
            commands: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Inject a device state frame, as if a device reported it.
    pub fn emit_frame(&self, frame: DeviceFrame) {
        let _ = self.frames.send(frame);
    }

    /// Inject a command result, as if a device responded.
    pub fn emit_result(&self, result: ResultEnvelope) {
        let _ = self.results.send(result);
    }

    /// Observe commands published through this bus.
    pub fn subscribe_commands(&self) -> broadcast::Receiver<CommandEnvelope> {
        self.commands.subscribe()
    }
}

impl Default for MemoryDeviceBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceBus for MemoryDeviceBus {
    async fn publish_command(&self, command: &CommandEnvelope) -> Result<(), BusError> {
        // Send only fails when no subscriber exists, which is fine: nothing
        // is listening for commands in most tests.
        let _ = self.commands.send(command.clone());
        Ok(())
    }

    fn subscribe_frames(&self) -> broadcast::Receiver<DeviceFrame> {
        self.frames.subscribe()
    }

    fn subscribe_results(&self) -> broadcast::Receiver<ResultEnvelope> {
        self.results.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn frames_reach_every_subscriber() {
        let bus = MemoryDeviceBus::new();
        let mut a = bus.subscribe_frames();
        let mut b = bus.subscribe_frames();

        bus.emit_frame(DeviceFrame {
            device_id: "d1".into(),
            state: json!({"motion": true}),
            retained: false,
        });

        assert_eq!(a.recv().await.unwrap().device_id, "d1");
        assert_eq!(b.recv().await.unwrap().device_id, "d1");
    }

    #[tokio::test]
    async fn published_commands_are_observable() {
        let bus = MemoryDeviceBus::new();
        let mut commands = bus.subscribe_commands();

        bus.publish_command(&CommandEnvelope {
            correlation_id: "c1".into(),
            device_id: "d1".into(),
            command: "set_state".into(),
            args: json!({"state": "on"}),
        })
        .await
        .unwrap();

        let observed = commands.recv().await.unwrap();
        assert_eq!(observed.correlation_id, "c1");
        assert_eq!(observed.command, "set_state");
    }
}
