//! Core types shared between the domo API gateway and automation engine.
//!
//! Nothing here performs I/O. The gateway and engine crates depend on this
//! crate for the contract types that cross their boundary: the role
//! hierarchy, verified token claims, run lifecycle enums, run events
//! streamed to clients, and the envelopes exchanged with the device bus.

pub mod claims;
pub mod device;
pub mod event;
pub mod path;
pub mod role;
pub mod status;

pub use claims::Claims;
pub use device::{CommandEnvelope, DeviceFrame, ResultEnvelope, correlation_id};
pub use event::{RunEvent, RunEventKind};
pub use path::{Comparator, ComparatorError, flatten, lookup_path};
pub use role::Role;
pub use status::{RunStatus, StatusParseError, StepStatus, TriggerKind};
