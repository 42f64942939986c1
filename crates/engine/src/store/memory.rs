//! In-memory workflow store backend, used by tests and single-process
//! development setups.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use domo_core::{RunStatus, StepStatus, TriggerKind};

use crate::error::EngineError;
use crate::ir::Definition;

use super::{MAX_RUN_LIMIT, Run, Step, Workflow, WorkflowStore};

#[derive(Default)]
struct Inner {
    workflows: HashMap<Uuid, Workflow>,
    runs: HashMap<Uuid, Run>,
    steps: HashMap<Uuid, Vec<Step>>,
}

/// Mutex-guarded maps mirroring the Postgres schema.
#[derive(Default)]
pub struct MemoryWorkflowStore {
    inner: Mutex<Inner>,
}

impl MemoryWorkflowStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, EngineError> {
        self.inner
            .lock()
            .map_err(|e| EngineError::Internal(e.to_string()))
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn create_workflow(
        &self,
        name: &str,
        definition: &Definition,
        created_by: &str,
    ) -> Result<Workflow, EngineError> {
        let now = Utc::now();
        let workflow = Workflow {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            enabled: true,
            definition: definition.to_value(),
            created_by: created_by.to_owned(),
            created_at: now,
            updated_at: now,
        };
        self.lock()?.workflows.insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    async fn update_workflow(
        &self,
        id: Uuid,
        name: &str,
        definition: &Definition,
    ) -> Result<Workflow, EngineError> {
        let mut inner = self.lock()?;
        let workflow = inner.workflows.get_mut(&id).ok_or(EngineError::NotFound)?;
        workflow.name = name.to_owned();
        workflow.definition = definition.to_value();
        workflow.updated_at = Utc::now();
        Ok(workflow.clone())
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        let workflow = inner.workflows.get_mut(&id).ok_or(EngineError::NotFound)?;
        workflow.enabled = enabled;
        workflow.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        inner.workflows.remove(&id).ok_or(EngineError::NotFound)?;
        let run_ids: Vec<Uuid> = inner
            .runs
            .values()
            .filter(|r| r.workflow_id == id)
            .map(|r| r.id)
            .collect();
        for run_id in run_ids {
            inner.runs.remove(&run_id);
            inner.steps.remove(&run_id);
        }
        Ok(())
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, EngineError> {
        let inner = self.lock()?;
        let mut workflows: Vec<Workflow> = inner.workflows.values().cloned().collect();
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(workflows)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, EngineError> {
        Ok(self.lock()?.workflows.get(&id).cloned())
    }

    async fn create_run(
        &self,
        workflow_id: Uuid,
        triggered_by: TriggerKind,
        trigger_payload: &Value,
    ) -> Result<Run, EngineError> {
        let run = Run {
            id: Uuid::new_v4(),
            workflow_id,
            triggered_by,
            trigger_payload: trigger_payload.clone(),
            status: RunStatus::Queued,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        };
        let mut inner = self.lock()?;
        inner.runs.insert(run.id, run.clone());
        inner.steps.insert(run.id, Vec::new());
        Ok(run)
    }

    async fn mark_run_running(&self, run_id: Uuid) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        let run = inner.runs.get_mut(&run_id).ok_or(EngineError::NotFound)?;
        if !run.status.can_transition_to(RunStatus::Running) {
            return Err(EngineError::Internal(format!(
                "run {run_id} cannot transition {} -> running",
                run.status
            )));
        }
        run.status = RunStatus::Running;
        Ok(())
    }

    async fn append_step(
        &self,
        run_id: Uuid,
        node_id: &str,
        node_kind: &str,
    ) -> Result<Step, EngineError> {
        let mut inner = self.lock()?;
        if !inner.runs.contains_key(&run_id) {
            return Err(EngineError::NotFound);
        }
        let steps = inner.steps.entry(run_id).or_default();
        let step = Step {
            id: Uuid::new_v4(),
            run_id,
            seq: i32::try_from(steps.len()).unwrap_or(i32::MAX) + 1,
            node_id: node_id.to_owned(),
            node_kind: node_kind.to_owned(),
            status: StepStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            result: None,
            error: None,
        };
        steps.push(step.clone());
        Ok(step)
    }

    async fn finalize_step(
        &self,
        step_id: Uuid,
        status: StepStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        for steps in inner.steps.values_mut() {
            if let Some(step) = steps.iter_mut().find(|s| s.id == step_id) {
                step.status = status;
                step.ended_at = Some(Utc::now());
                step.result = result;
                step.error = error;
                return Ok(());
            }
        }
        Err(EngineError::NotFound)
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        let run = inner.runs.get_mut(&run_id).ok_or(EngineError::NotFound)?;
        if run.status.is_terminal() {
            return Ok(());
        }
        run.status = status;
        run.ended_at = Some(Utc::now());
        run.error = error;
        Ok(())
    }

    async fn list_runs(&self, workflow_id: Uuid, limit: i64) -> Result<Vec<Run>, EngineError> {
        let limit = usize::try_from(limit.clamp(1, MAX_RUN_LIMIT)).unwrap_or(1);
        let inner = self.lock()?;
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, EngineError> {
        Ok(self.lock()?.runs.get(&run_id).cloned())
    }

    async fn get_run_with_steps(
        &self,
        run_id: Uuid,
    ) -> Result<Option<(Run, Vec<Step>)>, EngineError> {
        let inner = self.lock()?;
        let Some(run) = inner.runs.get(&run_id).cloned() else {
            return Ok(None);
        };
        let steps = inner.steps.get(&run_id).cloned().unwrap_or_default();
        Ok(Some((run, steps)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::normalize_and_validate;
    use serde_json::json;

    fn definition() -> Definition {
        normalize_and_validate(&json!({
            "version": "automation",
            "nodes": [{"id": "t1", "kind": "trigger.manual", "data": {}}],
            "edges": []
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn workflow_crud() {
        let store = MemoryWorkflowStore::new();
        let wf = store
            .create_workflow("morning", &definition(), "u-1")
            .await
            .unwrap();
        assert!(wf.enabled);

        let updated = store
            .update_workflow(wf.id, "evening", &definition())
            .await
            .unwrap();
        assert_eq!(updated.name, "evening");

        store.set_enabled(wf.id, false).await.unwrap();
        assert!(!store.get_workflow(wf.id).await.unwrap().unwrap().enabled);

        store.delete_workflow(wf.id).await.unwrap();
        assert!(store.get_workflow(wf.id).await.unwrap().is_none());
        assert!(matches!(
            store.delete_workflow(wf.id).await,
            Err(EngineError::NotFound)
        ));
    }

    #[tokio::test]
    async fn step_seq_is_contiguous_from_one() {
        let store = MemoryWorkflowStore::new();
        let wf = store
            .create_workflow("w", &definition(), "u-1")
            .await
            .unwrap();
        let run = store
            .create_run(wf.id, TriggerKind::Manual, &json!({}))
            .await
            .unwrap();

        for expected in 1..=4 {
            let step = store
                .append_step(run.id, "n", "logic.sleep")
                .await
                .unwrap();
            assert_eq!(step.seq, expected);
        }
        let (_, steps) = store.get_run_with_steps(run.id).await.unwrap().unwrap();
        let seqs: Vec<i32> = steps.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn terminal_runs_are_frozen() {
        let store = MemoryWorkflowStore::new();
        let wf = store
            .create_workflow("w", &definition(), "u-1")
            .await
            .unwrap();
        let run = store
            .create_run(wf.id, TriggerKind::Manual, &json!({}))
            .await
            .unwrap();

        store.mark_run_running(run.id).await.unwrap();
        store
            .finalize_run(run.id, RunStatus::Succeeded, None)
            .await
            .unwrap();
        // A later finalize must not overwrite the terminal state.
        store
            .finalize_run(run.id, RunStatus::Failed, Some("late".into()))
            .await
            .unwrap();
        let run = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.error.is_none());
    }

    #[tokio::test]
    async fn list_runs_is_newest_first_and_limited() {
        let store = MemoryWorkflowStore::new();
        let wf = store
            .create_workflow("w", &definition(), "u-1")
            .await
            .unwrap();
        for _ in 0..5 {
            store
                .create_run(wf.id, TriggerKind::Schedule, &json!({}))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let runs = store.list_runs(wf.id, 3).await.unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs[0].started_at >= runs[1].started_at);
        assert!(runs[1].started_at >= runs[2].started_at);
    }
}
