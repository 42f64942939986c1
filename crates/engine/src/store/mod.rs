//! Durable workflow, run, and step records.
//!
//! The store is the source of truth: the executor writes through on every
//! state change, and clients reconcile dropped events against it. Two
//! backends share the [`WorkflowStore`] trait: Postgres for deployments and
//! an in-memory store for tests.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use domo_core::{RunStatus, StepStatus, TriggerKind};

use crate::error::EngineError;
use crate::ir::Definition;

/// Maximum number of runs returned by a listing.
pub const MAX_RUN_LIMIT: i64 = 200;

/// A persisted workflow. The definition JSON always passes IR validation.
#[derive(Debug, Clone, Serialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    /// Normalized definition, exactly as produced by validation.
    pub definition: Value,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One execution attempt of a workflow.
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub triggered_by: TriggerKind,
    pub trigger_payload: Value,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// The record of one non-trigger node's execution within a run.
#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub id: Uuid,
    pub run_id: Uuid,
    /// Contiguous from 1 in creation order.
    pub seq: i32,
    pub node_id: String,
    pub node_kind: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Trait for the durable workflow store.
///
/// Steps are append-only and numbered per run; run status transitions are
/// monotonic and terminal states never change.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn create_workflow(
        &self,
        name: &str,
        definition: &Definition,
        created_by: &str,
    ) -> Result<Workflow, EngineError>;

    /// Replace name and definition. The caller has already re-validated.
    async fn update_workflow(
        &self,
        id: Uuid,
        name: &str,
        definition: &Definition,
    ) -> Result<Workflow, EngineError>;

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), EngineError>;

    async fn delete_workflow(&self, id: Uuid) -> Result<(), EngineError>;

    async fn list_workflows(&self) -> Result<Vec<Workflow>, EngineError>;

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, EngineError>;

    /// Create a run in `queued` with `started_at` stamped now.
    async fn create_run(
        &self,
        workflow_id: Uuid,
        triggered_by: TriggerKind,
        trigger_payload: &Value,
    ) -> Result<Run, EngineError>;

    /// Transition a queued run to `running`.
    async fn mark_run_running(&self, run_id: Uuid) -> Result<(), EngineError>;

    /// Append the next step for a run; `seq` is allocated contiguously.
    async fn append_step(
        &self,
        run_id: Uuid,
        node_id: &str,
        node_kind: &str,
    ) -> Result<Step, EngineError>;

    async fn finalize_step(
        &self,
        step_id: Uuid,
        status: StepStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<(), EngineError>;

    /// Move a run to a terminal status. A run already terminal is left
    /// untouched.
    async fn finalize_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<(), EngineError>;

    /// Recent runs for a workflow, newest first. `limit` is clamped to
    /// [`MAX_RUN_LIMIT`].
    async fn list_runs(&self, workflow_id: Uuid, limit: i64) -> Result<Vec<Run>, EngineError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, EngineError>;

    async fn get_run_with_steps(
        &self,
        run_id: Uuid,
    ) -> Result<Option<(Run, Vec<Step>)>, EngineError>;
}

/// Clamp a caller-supplied run listing limit.
#[must_use]
pub fn clamp_run_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(50).clamp(1, MAX_RUN_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_limit_is_clamped() {
        assert_eq!(clamp_run_limit(None), 50);
        assert_eq!(clamp_run_limit(Some(10)), 10);
        assert_eq!(clamp_run_limit(Some(0)), 1);
        assert_eq!(clamp_run_limit(Some(10_000)), MAX_RUN_LIMIT);
    }
}
