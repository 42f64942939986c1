//! Postgres workflow store backend.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use domo_core::{RunStatus, StepStatus, TriggerKind};

use crate::error::EngineError;
use crate::ir::Definition;

use super::{MAX_RUN_LIMIT, Run, Step, Workflow, WorkflowStore};

/// Postgres-backed implementation of [`WorkflowStore`].
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    /// Connect to the database and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self, EngineError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| EngineError::Config(format!("connecting to database: {e}")))?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests).
    #[must_use]
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Create the schema if it does not exist.
pub async fn run_migrations(pool: &PgPool) -> Result<(), EngineError> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS workflows (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            definition_json TEXT NOT NULL,
            created_by TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS workflow_runs (
            id UUID PRIMARY KEY,
            workflow_id UUID NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
            triggered_by TEXT NOT NULL,
            trigger_payload_json TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TIMESTAMPTZ NOT NULL,
            ended_at TIMESTAMPTZ,
            error TEXT
        )",
        "CREATE INDEX IF NOT EXISTS workflow_runs_recent_idx
            ON workflow_runs (workflow_id, started_at DESC)",
        "CREATE TABLE IF NOT EXISTS workflow_run_steps (
            id UUID PRIMARY KEY,
            run_id UUID NOT NULL REFERENCES workflow_runs(id) ON DELETE CASCADE,
            seq INTEGER NOT NULL,
            node_id TEXT NOT NULL,
            node_kind TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TIMESTAMPTZ NOT NULL,
            ended_at TIMESTAMPTZ,
            result_json TEXT,
            error TEXT
        )",
        "CREATE UNIQUE INDEX IF NOT EXISTS workflow_run_steps_seq_idx
            ON workflow_run_steps (run_id, seq)",
    ];
    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

fn parse_json(raw: &str) -> Result<Value, EngineError> {
    serde_json::from_str(raw).map_err(|e| EngineError::Internal(format!("corrupt stored json: {e}")))
}

fn workflow_from_row(row: &PgRow) -> Result<Workflow, EngineError> {
    Ok(Workflow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        enabled: row.try_get("enabled")?,
        definition: parse_json(row.try_get("definition_json")?)?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<Run, EngineError> {
    let triggered_by: String = row.try_get("triggered_by")?;
    let status: String = row.try_get("status")?;
    Ok(Run {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        triggered_by: triggered_by
            .parse::<TriggerKind>()
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        trigger_payload: parse_json(row.try_get("trigger_payload_json")?)?,
        status: status
            .parse::<RunStatus>()
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        error: row.try_get("error")?,
    })
}

fn step_from_row(row: &PgRow) -> Result<Step, EngineError> {
    let status: String = row.try_get("status")?;
    let result: Option<String> = row.try_get("result_json")?;
    Ok(Step {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        seq: row.try_get("seq")?,
        node_id: row.try_get("node_id")?,
        node_kind: row.try_get("node_kind")?,
        status: status
            .parse::<StepStatus>()
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        result: result.as_deref().map(parse_json).transpose()?,
        error: row.try_get("error")?,
    })
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn create_workflow(
        &self,
        name: &str,
        definition: &Definition,
        created_by: &str,
    ) -> Result<Workflow, EngineError> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO workflows (id, name, enabled, definition_json, created_by, created_at, updated_at)
             VALUES ($1, $2, TRUE, $3, $4, $5, $5)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(definition.to_value().to_string())
        .bind(created_by)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        workflow_from_row(&row)
    }

    async fn update_workflow(
        &self,
        id: Uuid,
        name: &str,
        definition: &Definition,
    ) -> Result<Workflow, EngineError> {
        let row = sqlx::query(
            "UPDATE workflows SET name = $2, definition_json = $3, updated_at = $4
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(name)
        .bind(definition.to_value().to_string())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(EngineError::NotFound)?;
        workflow_from_row(&row)
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), EngineError> {
        let result = sqlx::query(
            "UPDATE workflows SET enabled = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(enabled)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound);
        }
        Ok(())
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), EngineError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound);
        }
        Ok(())
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, EngineError> {
        let rows = sqlx::query("SELECT * FROM workflows ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(workflow_from_row).collect()
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, EngineError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(workflow_from_row).transpose()
    }

    async fn create_run(
        &self,
        workflow_id: Uuid,
        triggered_by: TriggerKind,
        trigger_payload: &Value,
    ) -> Result<Run, EngineError> {
        let row = sqlx::query(
            "INSERT INTO workflow_runs (id, workflow_id, triggered_by, trigger_payload_json, status, started_at)
             VALUES ($1, $2, $3, $4, 'queued', $5)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(workflow_id)
        .bind(triggered_by.to_string())
        .bind(trigger_payload.to_string())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        run_from_row(&row)
    }

    async fn mark_run_running(&self, run_id: Uuid) -> Result<(), EngineError> {
        let result = sqlx::query(
            "UPDATE workflow_runs SET status = 'running' WHERE id = $1 AND status = 'queued'",
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::Internal(format!(
                "run {run_id} is not queued"
            )));
        }
        Ok(())
    }

    async fn append_step(
        &self,
        run_id: Uuid,
        node_id: &str,
        node_kind: &str,
    ) -> Result<Step, EngineError> {
        // The unique (run_id, seq) index backstops the allocation; only one
        // executor appends for a given run.
        let row = sqlx::query(
            "INSERT INTO workflow_run_steps (id, run_id, seq, node_id, node_kind, status, started_at)
             SELECT $1, $2, COALESCE(MAX(seq), 0) + 1, $3, $4, 'running', $5
             FROM workflow_run_steps WHERE run_id = $2
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(node_id)
        .bind(node_kind)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        step_from_row(&row)
    }

    async fn finalize_step(
        &self,
        step_id: Uuid,
        status: StepStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        let affected = sqlx::query(
            "UPDATE workflow_run_steps
             SET status = $2, ended_at = $3, result_json = $4, error = $5
             WHERE id = $1",
        )
        .bind(step_id)
        .bind(status.to_string())
        .bind(Utc::now())
        .bind(result.map(|r| r.to_string()))
        .bind(error)
        .execute(&self.pool)
        .await?;
        if affected.rows_affected() == 0 {
            return Err(EngineError::NotFound);
        }
        Ok(())
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        // Terminal states are durable: the guard leaves them untouched.
        sqlx::query(
            "UPDATE workflow_runs SET status = $2, ended_at = $3, error = $4
             WHERE id = $1 AND status IN ('queued', 'running')",
        )
        .bind(run_id)
        .bind(status.to_string())
        .bind(Utc::now())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_runs(&self, workflow_id: Uuid, limit: i64) -> Result<Vec<Run>, EngineError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs WHERE workflow_id = $1
             ORDER BY started_at DESC LIMIT $2",
        )
        .bind(workflow_id)
        .bind(limit.clamp(1, MAX_RUN_LIMIT))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, EngineError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn get_run_with_steps(
        &self,
        run_id: Uuid,
    ) -> Result<Option<(Run, Vec<Step>)>, EngineError> {
        let Some(run) = self.get_run(run_id).await? else {
            return Ok(None);
        };
        let rows = sqlx::query(
            "SELECT * FROM workflow_run_steps WHERE run_id = $1 ORDER BY seq",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        let steps = rows.iter().map(step_from_row).collect::<Result<_, _>>()?;
        Ok(Some((run, steps)))
    }
}
