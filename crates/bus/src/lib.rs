//! Device bus transport.
//!
//! The automation engine observes device state frames and command results on
//! the bus, and publishes command envelopes to individual devices. The bus
//! itself is an external collaborator; this crate holds the [`DeviceBus`]
//! trait plus two backends: an in-memory bus for tests and single-process
//! setups, and an MQTT bus for real deployments.

pub mod memory;
pub mod mqtt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use domo_core::{CommandEnvelope, DeviceFrame, ResultEnvelope};

/// Errors surfaced by bus backends.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus could not be reached.
    #[error("bus connection error: {0}")]
    Connection(String),

    /// A publish was accepted locally but could not be handed to the bus.
    #[error("bus publish error: {0}")]
    Publish(String),
}

/// Trait for the device event bus.
///
/// Frame and result subscriptions are broadcast receivers: every subscriber
/// observes every message, and a subscriber that falls behind loses the
/// oldest messages rather than blocking the bus.
#[async_trait]
pub trait DeviceBus: Send + Sync {
    /// Publish one command envelope to its target device.
    async fn publish_command(&self, command: &CommandEnvelope) -> Result<(), BusError>;

    /// Subscribe to device state frames.
    fn subscribe_frames(&self) -> broadcast::Receiver<DeviceFrame>;

    /// Subscribe to command result envelopes.
    fn subscribe_results(&self) -> broadcast::Receiver<ResultEnvelope>;
}

pub use memory::MemoryDeviceBus;
pub use mqtt::{MqttConfig, MqttDeviceBus};
