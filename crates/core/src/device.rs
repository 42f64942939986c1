use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A device state frame observed on the device bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceFrame {
    /// The reporting device.
    pub device_id: String,
    /// Current state payload (arbitrary JSON object).
    pub state: serde_json::Value,
    /// Whether the bus replayed this frame from its retained cache rather
    /// than observing a fresh report.
    #[serde(default)]
    pub retained: bool,
}

/// A command published to a single device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Token matching this command to its [`ResultEnvelope`].
    pub correlation_id: String,
    /// Target device.
    pub device_id: String,
    /// Command verb (e.g. `set_state`).
    pub command: String,
    /// Command arguments.
    #[serde(default)]
    pub args: serde_json::Value,
}

/// A device's response to a command, observed on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// Token copied from the originating [`CommandEnvelope`].
    pub correlation_id: String,
    /// Responding device.
    pub device_id: String,
    /// Whether the device applied the command.
    pub success: bool,
    /// Device-reported error when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Build the correlation id for a command published from a run step.
///
/// The format `run_id:step_seq:device_id` is stable: the executor registers
/// a waiter under this id before publishing and the device echoes it back
/// verbatim in the result envelope.
#[must_use]
pub fn correlation_id(run_id: Uuid, step_seq: i32, device_id: &str) -> String {
    format!("{run_id}:{step_seq}:{device_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_id_format() {
        let run_id = Uuid::nil();
        assert_eq!(
            correlation_id(run_id, 3, "d1"),
            format!("{run_id}:3:d1")
        );
    }

    #[test]
    fn frame_retained_defaults_false() {
        let frame: DeviceFrame =
            serde_json::from_str(r#"{"device_id":"d1","state":{"motion":true}}"#).unwrap();
        assert!(!frame.retained);
        assert_eq!(frame.state["motion"], true);
    }
}
