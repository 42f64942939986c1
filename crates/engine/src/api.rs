//! Engine HTTP surface.
//!
//! All routes live under `/api/automation`. Role enforcement happens at the
//! gateway, which is the engine's only caller; the engine itself applies no
//! authentication.

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;
use tracing::debug;
use uuid::Uuid;

use domo_core::TriggerKind;

use crate::error::EngineError;
use crate::executor::Executor;
use crate::hub::EventHub;
use crate::ir;
use crate::metrics::EngineMetrics;
use crate::store::{WorkflowStore, clamp_run_limit};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn WorkflowStore>,
    pub executor: Arc<Executor>,
    pub hub: Arc<EventHub>,
    /// Poked after any workflow mutation so the trigger manager reloads.
    pub trigger_reload: Arc<Notify>,
    pub metrics: Arc<EngineMetrics>,
}

/// Build the engine router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(metrics))
        .route("/api/automation/nodes", get(nodes))
        .route(
            "/api/automation/workflows",
            get(list_workflows).post(create_workflow),
        )
        .route(
            "/api/automation/workflows/{id}",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route(
            "/api/automation/workflows/{id}/enable",
            post(enable_workflow),
        )
        .route(
            "/api/automation/workflows/{id}/disable",
            post(disable_workflow),
        )
        .route("/api/automation/workflows/{id}/run", post(run_workflow))
        .route("/api/automation/workflows/{id}/runs", get(list_runs))
        .route("/api/automation/runs/{run_id}", get(get_run))
        .route("/api/automation/runs/{run_id}/cancel", post(cancel_run))
        .route("/api/automation/runs/{run_id}/ws", get(run_events_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.snapshot().render_prometheus()
}

/// Static palette of supported node kinds and their data fields.
async fn nodes() -> axum::Json<Value> {
    axum::Json(json!({
        "kinds": [
            {
                "kind": "trigger.manual",
                "fields": {}
            },
            {
                "kind": "trigger.device_state",
                "fields": {
                    "target": {"type": "string", "required": true},
                    "key": {"type": "string", "default": ""},
                    "op": {"type": "string", "default": "exists",
                           "one_of": ["exists", "eq", "neq", "gt", "gte", "lt", "lte"]},
                    "value": {"type": "json"},
                    "cooldown_sec": {"type": "number", "default": 0},
                    "ignore_retained": {"type": "bool", "default": true}
                }
            },
            {
                "kind": "trigger.schedule",
                "fields": {
                    "cron": {"type": "string", "required": true},
                    "cooldown_sec": {"type": "number", "default": 0}
                }
            },
            {
                "kind": "action.send_command",
                "fields": {
                    "targets": {"type": "targets", "required": true},
                    "command": {"type": "string", "default": ir::DEFAULT_COMMAND},
                    "args": {"type": "json"},
                    "wait_for_result": {"type": "bool", "default": false},
                    "result_timeout_sec": {"type": "number",
                                           "default": ir::DEFAULT_RESULT_TIMEOUT_SEC}
                }
            },
            {
                "kind": "action.notify_email",
                "fields": {
                    "user_ids": {"type": "string[]"},
                    "roles": {"type": "string[]", "one_of": ["admin", "resident"]},
                    "subject": {"type": "string", "required": true},
                    "message": {"type": "string", "required": true}
                }
            },
            {
                "kind": "logic.sleep",
                "fields": {"duration_sec": {"type": "number", "required": true}}
            },
            {
                "kind": "logic.if",
                "fields": {
                    "path": {"type": "string", "required": true},
                    "op": {"type": "string", "default": "exists",
                           "one_of": ["exists", "eq", "neq", "gt", "gte", "lt", "lte"]},
                    "value": {"type": "json"}
                }
            },
            {
                "kind": "logic.for",
                "fields": {"count": {"type": "number", "required": true}}
            }
        ]
    }))
}

#[derive(Debug, Deserialize)]
struct WorkflowBody {
    name: String,
    definition: Value,
}

async fn list_workflows(State(state): State<AppState>) -> Result<Response, EngineError> {
    let workflows = state.store.list_workflows().await?;
    Ok(axum::Json(workflows).into_response())
}

async fn create_workflow(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<WorkflowBody>,
) -> Result<Response, EngineError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(EngineError::BadRequest("workflow name is required".into()));
    }
    let definition = ir::normalize_and_validate(&body.definition)?;
    let workflow = state
        .store
        .create_workflow(name, &definition, "api")
        .await?;
    state.trigger_reload.notify_one();
    Ok((StatusCode::CREATED, axum::Json(workflow)).into_response())
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, EngineError> {
    let workflow = state
        .store
        .get_workflow(id)
        .await?
        .ok_or(EngineError::NotFound)?;
    Ok(axum::Json(workflow).into_response())
}

async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    axum::Json(body): axum::Json<WorkflowBody>,
) -> Result<Response, EngineError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(EngineError::BadRequest("workflow name is required".into()));
    }
    let definition = ir::normalize_and_validate(&body.definition)?;
    let workflow = state.store.update_workflow(id, name, &definition).await?;
    state.trigger_reload.notify_one();
    Ok(axum::Json(workflow).into_response())
}

async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, EngineError> {
    state.store.delete_workflow(id).await?;
    state.trigger_reload.notify_one();
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn enable_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, EngineError> {
    state.store.set_enabled(id, true).await?;
    state.trigger_reload.notify_one();
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn disable_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, EngineError> {
    state.store.set_enabled(id, false).await?;
    state.trigger_reload.notify_one();
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Manual run dispatch. Accepted runs answer `202` with the run id; the
/// run's outcome is observable via the event stream and the run record.
async fn run_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<axum::Json<Value>>,
) -> Result<Response, EngineError> {
    let workflow = state
        .store
        .get_workflow(id)
        .await?
        .ok_or(EngineError::NotFound)?;
    let payload = body.map_or_else(|| json!({}), |axum::Json(v)| v);
    let run = state
        .executor
        .dispatch(&workflow, TriggerKind::Manual, payload)
        .await?;
    Ok((StatusCode::ACCEPTED, axum::Json(json!({"run_id": run.id}))).into_response())
}

#[derive(Debug, Deserialize)]
struct ListRunsQuery {
    limit: Option<i64>,
}

async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Response, EngineError> {
    if state.store.get_workflow(id).await?.is_none() {
        return Err(EngineError::NotFound);
    }
    let runs = state
        .store
        .list_runs(id, clamp_run_limit(query.limit))
        .await?;
    Ok(axum::Json(runs).into_response())
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Response, EngineError> {
    let (run, steps) = state
        .store
        .get_run_with_steps(run_id)
        .await?
        .ok_or(EngineError::NotFound)?;
    Ok(axum::Json(json!({"run": run, "steps": steps})).into_response())
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Response, EngineError> {
    if state.executor.cancel(run_id) {
        return Ok((StatusCode::ACCEPTED, axum::Json(json!({"run_id": run_id}))).into_response());
    }
    match state.store.get_run(run_id).await? {
        Some(_) => Err(EngineError::Conflict),
        None => Err(EngineError::NotFound),
    }
}

/// Live event stream: one JSON event per text frame. Buffered history is
/// replayed first; the stream closes after the terminal event.
async fn run_events_ws(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, EngineError> {
    if state.store.get_run(run_id).await?.is_none() {
        return Err(EngineError::NotFound);
    }
    Ok(upgrade.on_upgrade(move |socket| stream_run_events(state, run_id, socket)))
}

async fn stream_run_events(state: AppState, run_id: Uuid, mut socket: WebSocket) {
    let (mut events, _guard) = EventHub::subscribe(&state.hub, run_id);
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    debug!(run_id = %run_id, "event subscriber went away");
                    break;
                }
                if event.is_terminal() {
                    break;
                }
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}
