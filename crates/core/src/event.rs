use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::{RunStatus, StepStatus};

/// A real-time event describing run progress, streamed to WebSocket
/// subscribers.
///
/// Events are fan-out only: delivery is at-most-once per subscriber and the
/// run record in the store remains the source of truth for terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// The run this event belongs to.
    pub run_id: Uuid,
    /// Emission time, Unix milliseconds.
    pub ts: i64,
    /// The type-specific payload.
    #[serde(flatten)]
    pub kind: RunEventKind,
}

/// The type-specific payload of a [`RunEvent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEventKind {
    /// The run transitioned to `running`.
    RunStarted {
        /// The workflow being executed.
        workflow_id: Uuid,
    },
    /// A run was rejected at admission because one is already in flight.
    RunRejected {
        /// The workflow whose concurrent start was rejected.
        workflow_id: Uuid,
    },
    /// The executor entered a non-trigger node.
    NodeEntered {
        node_id: String,
        node_kind: String,
        /// Persisted step identifier, when journaling succeeded.
        #[serde(skip_serializing_if = "Option::is_none")]
        step_id: Option<Uuid>,
    },
    /// A node completed.
    NodeFinished {
        node_id: String,
        status: StepStatus,
    },
    /// A node failed; the run fails fast after this event.
    NodeFailed {
        node_id: String,
        error: String,
    },
    /// A `logic.sleep` node began sleeping.
    SleepStarted {
        node_id: String,
        sleep_duration_sec: u64,
    },
    /// The run completed successfully.
    RunFinished {
        status: RunStatus,
    },
    /// The run failed.
    RunFailed {
        error: String,
    },
    /// The run was cancelled.
    RunCancelled,
}

impl RunEvent {
    /// Build an event stamped with the current wall-clock time.
    #[must_use]
    pub fn now(run_id: Uuid, kind: RunEventKind) -> Self {
        Self {
            run_id,
            ts: Utc::now().timestamp_millis(),
            kind,
        }
    }

    /// Whether this event terminates the run's event stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            RunEventKind::RunFinished { .. }
                | RunEventKind::RunFailed { .. }
                | RunEventKind::RunCancelled
        )
    }
}
