//! Workflow definition IR.
//!
//! [`normalize_and_validate`] is the single gatekeeper for definitions:
//! every definition persisted by the store has passed it, and no other
//! component repeats its checks. Normalization materializes per-kind
//! defaults and drops unknown fields, so validation is idempotent:
//! re-validating a normalized definition reproduces it byte for byte.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use domo_core::{Comparator, Role};

/// The only accepted definition version.
pub const VERSION: &str = "automation";

/// Default command verb for `action.send_command`.
pub const DEFAULT_COMMAND: &str = "set_state";

/// Default `result_timeout_sec` for `action.send_command`.
pub const DEFAULT_RESULT_TIMEOUT_SEC: u64 = 15;

/// Validation errors. All map to a 400 at the API boundary.
#[derive(Debug, Error)]
pub enum IrError {
    #[error("malformed definition: {0}")]
    Malformed(String),

    #[error("unsupported version '{0}', expected '{VERSION}'")]
    Version(String),

    #[error("node {index}: {message}")]
    Node { index: usize, message: String },

    #[error("edge {index}: {message}")]
    Edge { index: usize, message: String },

    #[error("definition has no trigger node")]
    NoTrigger,

    #[error("cycle detected through node '{0}'")]
    Cycle(String),
}

/// Node kinds supported by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    #[serde(rename = "trigger.manual")]
    TriggerManual,
    #[serde(rename = "trigger.device_state")]
    TriggerDeviceState,
    #[serde(rename = "trigger.schedule")]
    TriggerSchedule,
    #[serde(rename = "action.send_command")]
    SendCommand,
    #[serde(rename = "action.notify_email")]
    NotifyEmail,
    #[serde(rename = "logic.sleep")]
    Sleep,
    #[serde(rename = "logic.if")]
    If,
    #[serde(rename = "logic.for")]
    For,
}

impl NodeKind {
    /// Whether this kind starts runs rather than executing within them.
    #[must_use]
    pub fn is_trigger(self) -> bool {
        matches!(
            self,
            Self::TriggerManual | Self::TriggerDeviceState | Self::TriggerSchedule
        )
    }

    /// Stable string form, identical to the wire encoding.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TriggerManual => "trigger.manual",
            Self::TriggerDeviceState => "trigger.device_state",
            Self::TriggerSchedule => "trigger.schedule",
            Self::SendCommand => "action.send_command",
            Self::NotifyEmail => "action.notify_email",
            Self::Sleep => "logic.sleep",
            Self::If => "logic.if",
            Self::For => "logic.for",
        }
    }
}

impl FromStr for NodeKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trigger.manual" => Ok(Self::TriggerManual),
            "trigger.device_state" => Ok(Self::TriggerDeviceState),
            "trigger.schedule" => Ok(Self::TriggerSchedule),
            "action.send_command" => Ok(Self::SendCommand),
            "action.notify_email" => Ok(Self::NotifyEmail),
            "logic.sleep" => Ok(Self::Sleep),
            "logic.if" => Ok(Self::If),
            "logic.for" => Ok(Self::For),
            _ => Err(()),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Command / notification targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Targets {
    /// Explicit device ids.
    Device { ids: Vec<String> },
    /// A selector resolved through the entity registry (`tag:kitchen`).
    Selector { selector: String },
}

impl Targets {
    /// The single device id, when the target is exactly one device.
    #[must_use]
    pub fn single_device(&self) -> Option<&str> {
        match self {
            Self::Device { ids } if ids.len() == 1 => Some(&ids[0]),
            _ => None,
        }
    }
}

/// `trigger.device_state` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStateTrigger {
    /// Device id or selector the trigger watches.
    pub target: String,
    /// Dot path into the flattened state payload. Empty matches any
    /// non-empty frame.
    #[serde(default)]
    pub key: String,
    pub op: Comparator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default)]
    pub cooldown_sec: u64,
    #[serde(default = "default_true")]
    pub ignore_retained: bool,
}

/// `trigger.schedule` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTrigger {
    /// Six-field cron expression (seconds first), evaluated in UTC.
    pub cron: String,
    #[serde(default)]
    pub cooldown_sec: u64,
}

/// `action.send_command` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendCommand {
    pub targets: Targets,
    pub command: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub wait_for_result: bool,
    pub result_timeout_sec: u64,
}

/// `action.notify_email` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyEmail {
    #[serde(default)]
    pub user_ids: Vec<String>,
    #[serde(default)]
    pub roles: Vec<Role>,
    pub subject: String,
    pub message: String,
}

/// `logic.sleep` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sleep {
    pub duration_sec: u64,
}

/// `logic.if` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfCond {
    /// Dot path into the run's trigger payload.
    pub path: String,
    pub op: Comparator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// `logic.for` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForLoop {
    pub count: u64,
}

/// Empty payload for `trigger.manual`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualTrigger {}

/// Typed, validated node payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NodePayload {
    Manual(ManualTrigger),
    DeviceState(DeviceStateTrigger),
    Schedule(ScheduleTrigger),
    SendCommand(SendCommand),
    NotifyEmail(NotifyEmail),
    Sleep(Sleep),
    If(IfCond),
    For(ForLoop),
}

/// A validated node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub x: f64,
    pub y: f64,
    pub data: NodePayload,
}

/// A directed edge. Edge order is significant: `logic.if` and `logic.for`
/// semantics depend on the index of a node's outgoing edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

/// A validated workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Definition {
    pub version: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl Definition {
    /// Look up a node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing edges of a node, in declaration order.
    #[must_use]
    pub fn outgoing(&self, id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.from == id).collect()
    }

    /// Trigger nodes, in declaration order.
    pub fn triggers(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.kind.is_trigger())
    }

    /// The canonical JSON value, as persisted in the store.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn default_true() -> bool {
    true
}

// -- Raw (pre-validation) shapes ------------------------------------------

#[derive(Debug, Deserialize)]
struct RawDefinition {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default)]
    edges: Vec<Edge>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    #[serde(default)]
    id: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
    #[serde(default)]
    data: Value,
}

// -- Validation -----------------------------------------------------------

/// Parse, normalize and validate a raw definition.
pub fn normalize_and_validate(value: &Value) -> Result<Definition, IrError> {
    let raw: RawDefinition =
        serde_json::from_value(value.clone()).map_err(|e| IrError::Malformed(e.to_string()))?;

    match raw.version.as_deref().map(str::trim) {
        Some(VERSION) => {}
        other => return Err(IrError::Version(other.unwrap_or_default().to_owned())),
    }

    let mut nodes = Vec::with_capacity(raw.nodes.len());
    let mut ids = HashSet::new();
    for (index, raw_node) in raw.nodes.into_iter().enumerate() {
        let node = validate_node(index, raw_node)?;
        if !ids.insert(node.id.clone()) {
            return Err(IrError::Node {
                index,
                message: format!("duplicate node id '{}'", node.id),
            });
        }
        nodes.push(node);
    }

    for (index, edge) in raw.edges.iter().enumerate() {
        if !ids.contains(&edge.from) {
            return Err(IrError::Edge {
                index,
                message: format!("unknown source node '{}'", edge.from),
            });
        }
        if !ids.contains(&edge.to) {
            return Err(IrError::Edge {
                index,
                message: format!("unknown target node '{}'", edge.to),
            });
        }
        if edge.from == edge.to {
            return Err(IrError::Edge {
                index,
                message: format!("self edge on node '{}'", edge.from),
            });
        }
    }

    if !nodes.iter().any(|n| n.kind.is_trigger()) {
        return Err(IrError::NoTrigger);
    }

    check_acyclic(&nodes, &raw.edges)?;
    check_wait_for_result(&nodes, &raw.edges)?;

    Ok(Definition {
        version: VERSION.to_owned(),
        nodes,
        edges: raw.edges,
    })
}

fn node_err(index: usize, message: impl Into<String>) -> IrError {
    IrError::Node {
        index,
        message: message.into(),
    }
}

fn validate_node(index: usize, raw: RawNode) -> Result<Node, IrError> {
    let id = raw.id.trim().to_owned();
    if id.is_empty() {
        return Err(node_err(index, "empty node id"));
    }
    let kind = raw
        .kind
        .trim()
        .parse::<NodeKind>()
        .map_err(|()| node_err(index, format!("unknown node kind '{}'", raw.kind.trim())))?;

    let data = if raw.data.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        raw.data
    };

    let payload = match kind {
        NodeKind::TriggerManual => NodePayload::Manual(ManualTrigger {}),
        NodeKind::TriggerDeviceState => {
            let mut trigger: DeviceStateTrigger = parse_data(index, &id, data, |d| {
                default_field(d, "op", "exists");
            })?;
            trigger.target = trigger.target.trim().to_owned();
            if trigger.target.is_empty() {
                return Err(node_err(index, format!("node '{id}': empty trigger target")));
            }
            trigger.key = trigger.key.trim().to_owned();
            if trigger.op.requires_value() && trigger.value.is_none() {
                return Err(node_err(
                    index,
                    format!("node '{id}': comparator '{}' needs a value", trigger.op),
                ));
            }
            NodePayload::DeviceState(trigger)
        }
        NodeKind::TriggerSchedule => {
            let mut trigger: ScheduleTrigger = parse_data(index, &id, data, |_| {})?;
            trigger.cron = trigger.cron.trim().to_owned();
            if trigger.cron.is_empty() {
                return Err(node_err(index, format!("node '{id}': empty cron expression")));
            }
            validate_cron(&trigger.cron)
                .map_err(|e| node_err(index, format!("node '{id}': {e}")))?;
            NodePayload::Schedule(trigger)
        }
        NodeKind::SendCommand => {
            let mut command: SendCommand = parse_data(index, &id, data, |d| {
                default_field(d, "command", DEFAULT_COMMAND);
                default_num_field(d, "result_timeout_sec", DEFAULT_RESULT_TIMEOUT_SEC);
            })?;
            command.command = command.command.trim().to_owned();
            if command.command.is_empty() {
                command.command = DEFAULT_COMMAND.to_owned();
            }
            match &command.targets {
                Targets::Device { ids } => {
                    if ids.is_empty() || ids.iter().any(|i| i.trim().is_empty()) {
                        return Err(node_err(
                            index,
                            format!("node '{id}': device targets need at least one id"),
                        ));
                    }
                }
                Targets::Selector { selector } => {
                    if selector.trim().is_empty() {
                        return Err(node_err(index, format!("node '{id}': empty selector")));
                    }
                }
            }
            NodePayload::SendCommand(command)
        }
        NodeKind::NotifyEmail => {
            let mut email: NotifyEmail = parse_data(index, &id, data, |_| {})?;
            email.user_ids.retain(|u| !u.trim().is_empty());
            if email.user_ids.is_empty() && email.roles.is_empty() {
                return Err(node_err(
                    index,
                    format!("node '{id}': needs at least one user id or role target"),
                ));
            }
            if let Some(bad) = email
                .roles
                .iter()
                .find(|r| !matches!(r, Role::Admin | Role::Resident))
            {
                return Err(node_err(
                    index,
                    format!("node '{id}': role target '{bad}' not allowed"),
                ));
            }
            if email.subject.trim().is_empty() || email.message.trim().is_empty() {
                return Err(node_err(
                    index,
                    format!("node '{id}': subject and message are required"),
                ));
            }
            NodePayload::NotifyEmail(email)
        }
        NodeKind::Sleep => NodePayload::Sleep(parse_data(index, &id, data, |_| {})?),
        NodeKind::If => {
            let mut cond: IfCond = parse_data(index, &id, data, |d| {
                default_field(d, "op", "exists");
            })?;
            cond.path = cond.path.trim().to_owned();
            if cond.path.is_empty() {
                return Err(node_err(index, format!("node '{id}': empty condition path")));
            }
            if cond.op.requires_value() && cond.value.is_none() {
                return Err(node_err(
                    index,
                    format!("node '{id}': comparator '{}' needs a value", cond.op),
                ));
            }
            NodePayload::If(cond)
        }
        NodeKind::For => NodePayload::For(parse_data(index, &id, data, |_| {})?),
    };

    Ok(Node {
        id,
        kind,
        x: raw.x,
        y: raw.y,
        data: payload,
    })
}

/// Parse a node's data object into its typed payload, after applying
/// defaults the schema leaves optional.
fn parse_data<T: serde::de::DeserializeOwned>(
    index: usize,
    id: &str,
    mut data: Value,
    apply_defaults: impl FnOnce(&mut serde_json::Map<String, Value>),
) -> Result<T, IrError> {
    let Some(map) = data.as_object_mut() else {
        return Err(node_err(index, format!("node '{id}': data must be an object")));
    };
    apply_defaults(map);
    serde_json::from_value(data).map_err(|e| node_err(index, format!("node '{id}': {e}")))
}

fn default_field(map: &mut serde_json::Map<String, Value>, key: &str, value: &str) {
    map.entry(key.to_owned())
        .or_insert_with(|| Value::String(value.to_owned()));
}

fn default_num_field(map: &mut serde_json::Map<String, Value>, key: &str, value: u64) {
    map.entry(key.to_owned()).or_insert_with(|| value.into());
}

/// Validate a six-field cron expression (seconds field optional).
pub fn validate_cron(expr: &str) -> Result<croner::Cron, String> {
    croner::Cron::new(expr)
        .with_seconds_optional()
        .parse()
        .map_err(|e| format!("invalid cron expression: {e}"))
}

/// Three-color DFS cycle check. Any back-edge is an error.
fn check_acyclic(nodes: &[Node], edges: &[Edge]) -> Result<(), IrError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        adjacency.entry(&edge.from).or_default().push(&edge.to);
    }

    let mut colors: HashMap<&str, Color> =
        nodes.iter().map(|n| (n.id.as_str(), Color::White)).collect();

    for start in nodes {
        if colors[start.id.as_str()] != Color::White {
            continue;
        }
        // Iterative DFS: (node, next child index) frames.
        let mut stack: Vec<(&str, usize)> = vec![(start.id.as_str(), 0)];
        colors.insert(start.id.as_str(), Color::Gray);

        while let Some((node, child)) = stack.pop() {
            let children = adjacency.get(node).map_or(&[][..], Vec::as_slice);
            if child < children.len() {
                stack.push((node, child + 1));
                let next = children[child];
                match colors[next] {
                    Color::Gray => return Err(IrError::Cycle(next.to_owned())),
                    Color::White => {
                        colors.insert(next, Color::Gray);
                        stack.push((next, 0));
                    }
                    Color::Black => {}
                }
            } else {
                colors.insert(node, Color::Black);
            }
        }
    }
    Ok(())
}

/// `wait_for_result` is only valid on a leaf node addressing exactly one
/// device by id.
fn check_wait_for_result(nodes: &[Node], edges: &[Edge]) -> Result<(), IrError> {
    for (index, node) in nodes.iter().enumerate() {
        let NodePayload::SendCommand(command) = &node.data else {
            continue;
        };
        if !command.wait_for_result {
            continue;
        }
        if edges.iter().any(|e| e.from == node.id) {
            return Err(node_err(
                index,
                format!("node '{}': wait_for_result requires a leaf node", node.id),
            ));
        }
        if command.targets.single_device().is_none() {
            return Err(node_err(
                index,
                format!(
                    "node '{}': wait_for_result requires exactly one device id target",
                    node.id
                ),
            ));
        }
    }
    Ok(())
}
