use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use domo_bus::MemoryDeviceBus;
use domo_core::{ResultEnvelope, Role, RunStatus};
use domo_engine::api::{self, AppState};
use domo_engine::collab::{CollabError, EmailSender, EntityRegistry, UserDirectory};
use domo_engine::executor::{Executor, ExecutorConfig};
use domo_engine::hub::EventHub;
use domo_engine::metrics::EngineMetrics;
use domo_engine::store::memory::MemoryWorkflowStore;
use domo_engine::store::{Workflow, WorkflowStore};

// -- Mock collaborators ---------------------------------------------------

struct StaticRegistry {
    selectors: HashMap<String, Vec<String>>,
}

#[async_trait]
impl EntityRegistry for StaticRegistry {
    async fn resolve(&self, selector: &str) -> Result<Vec<String>, CollabError> {
        self.selectors
            .get(selector)
            .cloned()
            .ok_or_else(|| CollabError::Status {
                status: 404,
                body: "unknown selector".into(),
            })
    }
}

struct StaticDirectory {
    admins: Vec<String>,
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn users_with_role(&self, role: Role) -> Result<Vec<String>, CollabError> {
        match role {
            Role::Admin => Ok(self.admins.clone()),
            _ => Ok(Vec::new()),
        }
    }
}

#[derive(Default)]
struct RecordingEmail {
    sent: Mutex<Vec<String>>,
    fail_for: Vec<String>,
}

#[async_trait]
impl EmailSender for RecordingEmail {
    async fn send(&self, user_id: &str, _subject: &str, _message: &str) -> Result<(), CollabError> {
        if self.fail_for.iter().any(|u| u == user_id) {
            return Err(CollabError::Status {
                status: 500,
                body: "smtp relay down".into(),
            });
        }
        self.sent.lock().unwrap().push(user_id.to_owned());
        Ok(())
    }
}

// -- Harness --------------------------------------------------------------

struct Env {
    state: AppState,
    store: Arc<MemoryWorkflowStore>,
    bus: Arc<MemoryDeviceBus>,
    hub: Arc<EventHub>,
    email: Arc<RecordingEmail>,
}

fn build_env() -> Env {
    build_env_with_email(RecordingEmail::default())
}

fn build_env_with_email(email: RecordingEmail) -> Env {
    let store = Arc::new(MemoryWorkflowStore::new());
    let bus = Arc::new(MemoryDeviceBus::new());
    let metrics = Arc::new(EngineMetrics::default());
    let hub = Arc::new(EventHub::new(Arc::clone(&metrics)));
    let registry = Arc::new(StaticRegistry {
        selectors: HashMap::from([(
            "tag:kitchen".to_owned(),
            vec!["d1".to_owned(), "d2".to_owned()],
        )]),
    });
    let directory = Arc::new(StaticDirectory {
        admins: vec!["admin-1".to_owned()],
    });
    let email = Arc::new(email);

    let executor = Executor::start(
        Arc::clone(&store) as Arc<dyn WorkflowStore>,
        Arc::clone(&bus) as _,
        Arc::clone(&hub),
        registry,
        directory,
        Arc::clone(&email) as _,
        Arc::clone(&metrics),
        ExecutorConfig::default(),
    );

    let state = AppState {
        store: Arc::clone(&store) as _,
        executor,
        hub: Arc::clone(&hub),
        trigger_reload: Arc::new(tokio::sync::Notify::new()),
        metrics,
    };
    Env {
        state,
        store,
        bus,
        hub,
        email,
    }
}

async fn create_workflow(env: &Env, definition: Value) -> Workflow {
    let def = domo_engine::normalize_and_validate(&definition).unwrap();
    env.store.create_workflow("test", &def, "u-1").await.unwrap()
}

/// Poll the store until the run reaches a terminal status.
async fn await_terminal(env: &Env, run_id: Uuid) -> RunStatus {
    for _ in 0..500 {
        if let Some(run) = env.store.get_run(run_id).await.unwrap() {
            if run.status.is_terminal() {
                return run.status;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} never reached a terminal status");
}

async fn post(env: &Env, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method("POST")
            .uri(path)
            .body(Body::empty())
            .unwrap(),
    };
    let response = api::router(env.state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn get(env: &Env, path: &str) -> (StatusCode, Value) {
    let response = api::router(env.state.clone())
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn manual_to_command() -> Value {
    json!({
        "version": "automation",
        "nodes": [
            {"id": "t1", "kind": "trigger.manual", "x": 0, "y": 0, "data": {}},
            {"id": "a1", "kind": "action.send_command", "x": 100, "y": 0,
             "data": {"targets": {"type": "device", "ids": ["d1"]}, "command": "set_state"}}
        ],
        "edges": [{"from": "t1", "to": "a1"}]
    })
}

// -- Scenarios ------------------------------------------------------------

#[tokio::test]
async fn minimal_manual_run() {
    let env = build_env();
    let workflow = create_workflow(&env, manual_to_command()).await;
    let mut commands = env.bus.subscribe_commands();

    let (status, body) = post(
        &env,
        &format!("/api/automation/workflows/{}/run", workflow.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id: Uuid = body["run_id"].as_str().unwrap().parse().unwrap();

    let (mut events, _guard) = EventHub::subscribe(&env.hub, run_id);
    assert_eq!(await_terminal(&env, run_id).await, RunStatus::Succeeded);

    // Exactly one command went out.
    let command = commands.recv().await.unwrap();
    assert_eq!(command.device_id, "d1");
    assert_eq!(command.command, "set_state");

    // One step row for a1.
    let (_, body) = get(&env, &format!("/api/automation/runs/{run_id}")).await;
    assert_eq!(body["run"]["status"], "succeeded");
    let steps = body["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0]["node_id"], "a1");
    assert_eq!(steps[0]["status"], "succeeded");
    assert_eq!(steps[0]["seq"], 1);

    // The stream carries the documented lifecycle, ending at the terminal
    // event.
    let mut types = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        let value = serde_json::to_value(&event).unwrap();
        types.push(value["type"].as_str().unwrap().to_owned());
        if event.is_terminal() {
            break;
        }
    }
    assert_eq!(
        types,
        vec!["run_started", "node_entered", "node_finished", "run_finished"]
    );
}

#[tokio::test]
async fn if_else_branching_takes_the_false_edge() {
    let env = build_env();
    let definition = json!({
        "version": "automation",
        "nodes": [
            {"id": "t1", "kind": "trigger.manual", "data": {}},
            {"id": "i1", "kind": "logic.if",
             "data": {"path": "state.motion", "op": "eq", "value": true}},
            {"id": "on", "kind": "action.send_command",
             "data": {"targets": {"type": "device", "ids": ["light"]},
                      "args": {"state": "on"}}},
            {"id": "off", "kind": "action.send_command",
             "data": {"targets": {"type": "device", "ids": ["light"]},
                      "args": {"state": "off"}}}
        ],
        "edges": [
            {"from": "t1", "to": "i1"},
            {"from": "i1", "to": "on"},
            {"from": "i1", "to": "off"}
        ]
    });
    let workflow = create_workflow(&env, definition).await;
    let mut commands = env.bus.subscribe_commands();

    let (status, body) = post(
        &env,
        &format!("/api/automation/workflows/{}/run", workflow.id),
        Some(json!({"state": {"motion": false}})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id: Uuid = body["run_id"].as_str().unwrap().parse().unwrap();
    assert_eq!(await_terminal(&env, run_id).await, RunStatus::Succeeded);

    // Exactly the off-command executed.
    let command = commands.recv().await.unwrap();
    assert_eq!(command.args["state"], "off");
    assert!(commands.try_recv().is_err(), "only one command expected");

    let (_, body) = get(&env, &format!("/api/automation/runs/{run_id}")).await;
    let steps = body["steps"].as_array().unwrap();
    let send_steps: Vec<_> = steps
        .iter()
        .filter(|s| s["node_kind"] == "action.send_command")
        .collect();
    assert_eq!(send_steps.len(), 1);
    assert_eq!(send_steps[0]["node_id"], "off");
}

#[tokio::test]
async fn if_with_missing_else_edge_ends_branch_cleanly() {
    let env = build_env();
    let definition = json!({
        "version": "automation",
        "nodes": [
            {"id": "t1", "kind": "trigger.manual", "data": {}},
            {"id": "i1", "kind": "logic.if",
             "data": {"path": "state.motion", "op": "eq", "value": true}},
            {"id": "on", "kind": "action.send_command",
             "data": {"targets": {"type": "device", "ids": ["light"]}}}
        ],
        "edges": [
            {"from": "t1", "to": "i1"},
            {"from": "i1", "to": "on"}
        ]
    });
    let workflow = create_workflow(&env, definition).await;
    let mut commands = env.bus.subscribe_commands();

    let (_, body) = post(
        &env,
        &format!("/api/automation/workflows/{}/run", workflow.id),
        Some(json!({"state": {"motion": false}})),
    )
    .await;
    let run_id: Uuid = body["run_id"].as_str().unwrap().parse().unwrap();
    assert_eq!(await_terminal(&env, run_id).await, RunStatus::Succeeded);
    assert!(commands.try_recv().is_err(), "false predicate with no else runs nothing");
}

#[tokio::test]
async fn for_loop_count_zero_runs_only_the_after_edge() {
    let env = build_env();
    let definition = json!({
        "version": "automation",
        "nodes": [
            {"id": "t1", "kind": "trigger.manual", "data": {}},
            {"id": "f1", "kind": "logic.for", "data": {"count": 0}},
            {"id": "body", "kind": "action.send_command",
             "data": {"targets": {"type": "device", "ids": ["d1"]}}},
            {"id": "after", "kind": "action.send_command",
             "data": {"targets": {"type": "device", "ids": ["d2"]}}}
        ],
        "edges": [
            {"from": "t1", "to": "f1"},
            {"from": "f1", "to": "body"},
            {"from": "f1", "to": "after"}
        ]
    });
    let workflow = create_workflow(&env, definition).await;
    let mut commands = env.bus.subscribe_commands();

    let (_, body) = post(
        &env,
        &format!("/api/automation/workflows/{}/run", workflow.id),
        None,
    )
    .await;
    let run_id: Uuid = body["run_id"].as_str().unwrap().parse().unwrap();
    assert_eq!(await_terminal(&env, run_id).await, RunStatus::Succeeded);

    let command = commands.recv().await.unwrap();
    assert_eq!(command.device_id, "d2", "only the after edge executes");
    assert!(commands.try_recv().is_err());
}

#[tokio::test]
async fn for_loop_repeats_body_in_order() {
    let env = build_env();
    let definition = json!({
        "version": "automation",
        "nodes": [
            {"id": "t1", "kind": "trigger.manual", "data": {}},
            {"id": "f1", "kind": "logic.for", "data": {"count": 3}},
            {"id": "body", "kind": "action.send_command",
             "data": {"targets": {"type": "device", "ids": ["d1"]}}},
            {"id": "after", "kind": "action.send_command",
             "data": {"targets": {"type": "device", "ids": ["d2"]}}}
        ],
        "edges": [
            {"from": "t1", "to": "f1"},
            {"from": "f1", "to": "body"},
            {"from": "f1", "to": "after"}
        ]
    });
    let workflow = create_workflow(&env, definition).await;
    let mut commands = env.bus.subscribe_commands();

    let (_, body) = post(
        &env,
        &format!("/api/automation/workflows/{}/run", workflow.id),
        None,
    )
    .await;
    let run_id: Uuid = body["run_id"].as_str().unwrap().parse().unwrap();
    assert_eq!(await_terminal(&env, run_id).await, RunStatus::Succeeded);

    let mut devices = Vec::new();
    while let Ok(command) = commands.try_recv() {
        devices.push(command.device_id);
    }
    assert_eq!(devices, vec!["d1", "d1", "d1", "d2"]);

    // Step seq stays contiguous across the expansion.
    let (_, body) = get(&env, &format!("/api/automation/runs/{run_id}")).await;
    let seqs: Vec<i64> = body["steps"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["seq"].as_i64().unwrap())
        .collect();
    assert_eq!(seqs, (1..=seqs.len() as i64).collect::<Vec<_>>());
}

#[tokio::test]
async fn second_run_is_rejected_with_conflict() {
    let env = build_env();
    let definition = json!({
        "version": "automation",
        "nodes": [
            {"id": "t1", "kind": "trigger.manual", "data": {}},
            {"id": "s1", "kind": "logic.sleep", "data": {"duration_sec": 30}}
        ],
        "edges": [{"from": "t1", "to": "s1"}]
    });
    let workflow = create_workflow(&env, definition).await;

    let (status, body) = post(
        &env,
        &format!("/api/automation/workflows/{}/run", workflow.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id: Uuid = body["run_id"].as_str().unwrap().parse().unwrap();

    // Give the first run a moment to enter the sleep.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, body) = post(
        &env,
        &format!("/api/automation/workflows/{}/run", workflow.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");

    // After cancellation the workflow is admittable again. Admission is
    // released just after the run record turns terminal, so retry briefly.
    let (status, _) = post(&env, &format!("/api/automation/runs/{run_id}/cancel"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(await_terminal(&env, run_id).await, RunStatus::Cancelled);

    let mut status = StatusCode::CONFLICT;
    for _ in 0..100 {
        let (s, _) = post(
            &env,
            &format!("/api/automation/workflows/{}/run", workflow.id),
            None,
        )
        .await;
        status = s;
        if status == StatusCode::ACCEPTED {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn sleep_cancellation_is_prompt() {
    let env = build_env();
    let definition = json!({
        "version": "automation",
        "nodes": [
            {"id": "t1", "kind": "trigger.manual", "data": {}},
            {"id": "s1", "kind": "logic.sleep", "data": {"duration_sec": 30}}
        ],
        "edges": [{"from": "t1", "to": "s1"}]
    });
    let workflow = create_workflow(&env, definition).await;

    let (_, body) = post(
        &env,
        &format!("/api/automation/workflows/{}/run", workflow.id),
        None,
    )
    .await;
    let run_id: Uuid = body["run_id"].as_str().unwrap().parse().unwrap();
    let (mut events, _guard) = EventHub::subscribe(&env.hub, run_id);

    // Wait for the sleep step to exist.
    for _ in 0..100 {
        let (_, body) = get(&env, &format!("/api/automation/runs/{run_id}")).await;
        if !body["steps"].as_array().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let cancelled_at = std::time::Instant::now();
    let (status, _) = post(&env, &format!("/api/automation/runs/{run_id}/cancel"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    assert_eq!(await_terminal(&env, run_id).await, RunStatus::Cancelled);
    assert!(
        cancelled_at.elapsed() < Duration::from_millis(200),
        "cancellation should land promptly"
    );

    let (_, body) = get(&env, &format!("/api/automation/runs/{run_id}")).await;
    assert_eq!(body["steps"][0]["status"], "cancelled");

    let mut saw_sleep_started = false;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        let value = serde_json::to_value(&event).unwrap();
        saw_sleep_started |= value["type"] == "sleep_started";
        if value["type"] == "run_cancelled" {
            break;
        }
    }
    assert!(saw_sleep_started);
}

#[tokio::test]
async fn wait_for_result_succeeds_on_correlated_result() {
    let env = build_env();
    let definition = json!({
        "version": "automation",
        "nodes": [
            {"id": "t1", "kind": "trigger.manual", "data": {}},
            {"id": "a1", "kind": "action.send_command",
             "data": {"targets": {"type": "device", "ids": ["d1"]},
                      "wait_for_result": true, "result_timeout_sec": 5}}
        ],
        "edges": [{"from": "t1", "to": "a1"}]
    });
    let workflow = create_workflow(&env, definition).await;

    // A device: answers every command with a success result.
    let mut commands = env.bus.subscribe_commands();
    let bus = Arc::clone(&env.bus);
    tokio::spawn(async move {
        while let Ok(command) = commands.recv().await {
            bus.emit_result(ResultEnvelope {
                correlation_id: command.correlation_id,
                device_id: command.device_id,
                success: true,
                error: None,
            });
        }
    });

    let (_, body) = post(
        &env,
        &format!("/api/automation/workflows/{}/run", workflow.id),
        None,
    )
    .await;
    let run_id: Uuid = body["run_id"].as_str().unwrap().parse().unwrap();
    assert_eq!(await_terminal(&env, run_id).await, RunStatus::Succeeded);
}

#[tokio::test]
async fn wait_for_result_times_out_into_failure() {
    let env = build_env();
    let definition = json!({
        "version": "automation",
        "nodes": [
            {"id": "t1", "kind": "trigger.manual", "data": {}},
            {"id": "a1", "kind": "action.send_command",
             "data": {"targets": {"type": "device", "ids": ["d1"]},
                      "wait_for_result": true, "result_timeout_sec": 1}}
        ],
        "edges": [{"from": "t1", "to": "a1"}]
    });
    let workflow = create_workflow(&env, definition).await;

    let (_, body) = post(
        &env,
        &format!("/api/automation/workflows/{}/run", workflow.id),
        None,
    )
    .await;
    let run_id: Uuid = body["run_id"].as_str().unwrap().parse().unwrap();
    assert_eq!(await_terminal(&env, run_id).await, RunStatus::Failed);

    let (_, body) = get(&env, &format!("/api/automation/runs/{run_id}")).await;
    assert_eq!(body["run"]["status"], "failed");
    assert!(
        body["steps"][0]["error"]
            .as_str()
            .unwrap()
            .contains("timed out"),
        "step error should mention the timeout"
    );
}

#[tokio::test]
async fn selector_targets_fan_out_with_dedup() {
    let env = build_env();
    let definition = json!({
        "version": "automation",
        "nodes": [
            {"id": "t1", "kind": "trigger.manual", "data": {}},
            {"id": "a1", "kind": "action.send_command",
             "data": {"targets": {"type": "selector", "selector": "tag:kitchen"}}}
        ],
        "edges": [{"from": "t1", "to": "a1"}]
    });
    let workflow = create_workflow(&env, definition).await;
    let mut commands = env.bus.subscribe_commands();

    let (_, body) = post(
        &env,
        &format!("/api/automation/workflows/{}/run", workflow.id),
        None,
    )
    .await;
    let run_id: Uuid = body["run_id"].as_str().unwrap().parse().unwrap();
    assert_eq!(await_terminal(&env, run_id).await, RunStatus::Succeeded);

    let mut devices = Vec::new();
    while let Ok(command) = commands.try_recv() {
        devices.push(command.device_id);
    }
    assert_eq!(devices, vec!["d1", "d2"]);
}

#[tokio::test]
async fn partial_email_failure_fails_step_but_not_run() {
    let env = build_env_with_email(RecordingEmail {
        fail_for: vec!["admin-1".to_owned()],
        ..RecordingEmail::default()
    });
    let definition = json!({
        "version": "automation",
        "nodes": [
            {"id": "t1", "kind": "trigger.manual", "data": {}},
            {"id": "e1", "kind": "action.notify_email",
             "data": {"user_ids": ["u-9"], "roles": ["admin"],
                      "subject": "door open", "message": "front door left open"}},
            {"id": "a1", "kind": "action.send_command",
             "data": {"targets": {"type": "device", "ids": ["d1"]}}}
        ],
        "edges": [{"from": "t1", "to": "e1"}, {"from": "e1", "to": "a1"}]
    });
    let workflow = create_workflow(&env, definition).await;

    let (_, body) = post(
        &env,
        &format!("/api/automation/workflows/{}/run", workflow.id),
        None,
    )
    .await;
    let run_id: Uuid = body["run_id"].as_str().unwrap().parse().unwrap();

    // The run keeps going past the partially-failed email step.
    assert_eq!(await_terminal(&env, run_id).await, RunStatus::Succeeded);
    assert_eq!(env.email.sent.lock().unwrap().as_slice(), ["u-9"]);

    let (_, body) = get(&env, &format!("/api/automation/runs/{run_id}")).await;
    let steps = body["steps"].as_array().unwrap();
    assert_eq!(steps[0]["node_id"], "e1");
    assert_eq!(steps[0]["status"], "failed");
    assert_eq!(steps[1]["node_id"], "a1");
    assert_eq!(steps[1]["status"], "succeeded");
}

#[tokio::test]
async fn all_recipients_failing_fails_the_run() {
    let env = build_env_with_email(RecordingEmail {
        fail_for: vec!["u-9".to_owned()],
        ..RecordingEmail::default()
    });
    let definition = json!({
        "version": "automation",
        "nodes": [
            {"id": "t1", "kind": "trigger.manual", "data": {}},
            {"id": "e1", "kind": "action.notify_email",
             "data": {"user_ids": ["u-9"], "subject": "s", "message": "m"}}
        ],
        "edges": [{"from": "t1", "to": "e1"}]
    });
    let workflow = create_workflow(&env, definition).await;

    let (_, body) = post(
        &env,
        &format!("/api/automation/workflows/{}/run", workflow.id),
        None,
    )
    .await;
    let run_id: Uuid = body["run_id"].as_str().unwrap().parse().unwrap();
    assert_eq!(await_terminal(&env, run_id).await, RunStatus::Failed);
}

// -- API surface ----------------------------------------------------------

#[tokio::test]
async fn node_palette_lists_every_kind() {
    let env = build_env();
    let (status, body) = get(&env, "/api/automation/nodes").await;
    assert_eq!(status, StatusCode::OK);
    let kinds: Vec<&str> = body["kinds"]
        .as_array()
        .unwrap()
        .iter()
        .map(|k| k["kind"].as_str().unwrap())
        .collect();
    assert_eq!(
        kinds,
        vec![
            "trigger.manual",
            "trigger.device_state",
            "trigger.schedule",
            "action.send_command",
            "action.notify_email",
            "logic.sleep",
            "logic.if",
            "logic.for"
        ]
    );
}

#[tokio::test]
async fn create_rejects_invalid_definitions() {
    let env = build_env();
    let (status, body) = post(
        &env,
        "/api/automation/workflows",
        Some(json!({
            "name": "broken",
            "definition": {
                "version": "automation",
                "nodes": [
                    {"id": "t1", "kind": "trigger.manual", "data": {}},
                    {"id": "a", "kind": "logic.sleep", "data": {"duration_sec": 1}},
                    {"id": "b", "kind": "logic.sleep", "data": {"duration_sec": 1}}
                ],
                "edges": [
                    {"from": "t1", "to": "a"},
                    {"from": "a", "to": "b"},
                    {"from": "b", "to": "a"}
                ]
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");
    assert!(body["error"].as_str().unwrap().contains("cycle"));
}

#[tokio::test]
async fn workflow_crud_round_trip() {
    let env = build_env();
    let (status, created) = post(
        &env,
        "/api/automation/workflows",
        Some(json!({"name": "wf", "definition": manual_to_command()})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_str().unwrap();

    let (status, listed) = get(&env, "/api/automation/workflows").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    // Stored definition is the normalized form: defaults are materialized.
    let (_, fetched) = get(&env, &format!("/api/automation/workflows/{id}")).await;
    assert_eq!(
        fetched["definition"]["nodes"][1]["data"]["result_timeout_sec"],
        15
    );

    let (status, _) = post(&env, &format!("/api/automation/workflows/{id}/disable"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, fetched) = get(&env, &format!("/api/automation/workflows/{id}")).await;
    assert_eq!(fetched["enabled"], false);

    let response = api::router(env.state.clone())
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/automation/workflows/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let (status, _) = get(&env, &format!("/api/automation/workflows/{id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_ids_are_404() {
    let env = build_env();
    let ghost = Uuid::new_v4();
    let (status, body) = get(&env, &format!("/api/automation/workflows/{ghost}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, _) = get(&env, &format!("/api/automation/runs/{ghost}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = post(&env, &format!("/api/automation/workflows/{ghost}/run"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn run_event_stream_over_websocket() {
    use futures::StreamExt;

    let env = build_env();
    let workflow = create_workflow(&env, manual_to_command()).await;

    let (_, body) = post(
        &env,
        &format!("/api/automation/workflows/{}/run", workflow.id),
        None,
    )
    .await;
    let run_id: Uuid = body["run_id"].as_str().unwrap().parse().unwrap();
    assert_eq!(await_terminal(&env, run_id).await, RunStatus::Succeeded);

    // Serve the router for a real upgrade; replay delivers the whole
    // lifecycle to this late subscriber.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::router(env.state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (mut socket, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/api/automation/runs/{run_id}/ws"
    ))
    .await
    .unwrap();

    let mut types = Vec::new();
    while let Some(Ok(message)) = socket.next().await {
        match message {
            tokio_tungstenite::tungstenite::Message::Text(text) => {
                let event: Value = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(event["run_id"], run_id.to_string());
                assert!(event["ts"].is_i64());
                types.push(event["type"].as_str().unwrap().to_owned());
            }
            tokio_tungstenite::tungstenite::Message::Close(_) => break,
            _ => {}
        }
    }
    assert_eq!(types.first().map(String::as_str), Some("run_started"));
    assert_eq!(types.last().map(String::as_str), Some("run_finished"));
}

#[tokio::test]
async fn steps_are_monotonic_under_nested_logic() {
    let env = build_env();
    let definition = json!({
        "version": "automation",
        "nodes": [
            {"id": "t1", "kind": "trigger.manual", "data": {}},
            {"id": "f1", "kind": "logic.for", "data": {"count": 2}},
            {"id": "i1", "kind": "logic.if", "data": {"path": "go", "op": "exists"}},
            {"id": "a1", "kind": "action.send_command",
             "data": {"targets": {"type": "device", "ids": ["d1"]}}},
            {"id": "done", "kind": "action.send_command",
             "data": {"targets": {"type": "device", "ids": ["d9"]}}}
        ],
        "edges": [
            {"from": "t1", "to": "f1"},
            {"from": "f1", "to": "i1"},
            {"from": "f1", "to": "done"},
            {"from": "i1", "to": "a1"}
        ]
    });
    let workflow = create_workflow(&env, definition).await;

    let (_, body) = post(
        &env,
        &format!("/api/automation/workflows/{}/run", workflow.id),
        Some(json!({"go": true})),
    )
    .await;
    let run_id: Uuid = body["run_id"].as_str().unwrap().parse().unwrap();
    assert_eq!(await_terminal(&env, run_id).await, RunStatus::Succeeded);

    let (_, body) = get(&env, &format!("/api/automation/runs/{run_id}")).await;
    let steps = body["steps"].as_array().unwrap();
    // for -> (if -> a1) x2 -> done, depth-first.
    let node_ids: Vec<&str> = steps.iter().map(|s| s["node_id"].as_str().unwrap()).collect();
    assert_eq!(node_ids, vec!["f1", "i1", "a1", "i1", "a1", "done"]);
    let seqs: Vec<i64> = steps.iter().map(|s| s["seq"].as_i64().unwrap()).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
}
