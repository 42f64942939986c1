//! Run executor.
//!
//! One task per run walks the definition DAG depth-first from the trigger
//! node, journaling every non-trigger node as a step and publishing run
//! events around it. Admission enforces at-most-one running instance per
//! workflow: a second start while one is in flight is rejected with a
//! conflict and a `run_rejected` event on the active run's stream.
//!
//! Failure policy is fail-fast: the first hard node failure finalizes the
//! run as `failed` and stops draining the deque. Cancellation (user,
//! shutdown, or the per-run hard timeout) is observed at every suspension
//! point; a cancelled sleep or command wait finalizes the current step and
//! the run as `cancelled` promptly.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use domo_bus::DeviceBus;
use domo_core::{
    CommandEnvelope, ResultEnvelope, RunEvent, RunEventKind, RunStatus, StepStatus, TriggerKind,
    correlation_id, lookup_path,
};

use crate::collab::{EmailSender, EntityRegistry, SelectorCache, UserDirectory};
use crate::error::EngineError;
use crate::hub::EventHub;
use crate::ir::{self, Definition, Node, NodePayload, Targets};
use crate::metrics::EngineMetrics;
use crate::store::{Run, Workflow, WorkflowStore};

/// TTL for per-run selector cache entries.
const SELECTOR_CACHE_TTL: Duration = Duration::from_secs(30);

/// Executor tuning knobs.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Hard wall-clock ceiling per run; exceeding it cancels the run.
    pub run_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(3600),
        }
    }
}

/// Owns every run from dispatch to termination.
///
/// The shared internals live behind an `Arc` so run tasks can outlive the
/// borrow that dispatched them.
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    store: Arc<dyn WorkflowStore>,
    bus: Arc<dyn DeviceBus>,
    hub: Arc<EventHub>,
    registry: Arc<dyn EntityRegistry>,
    directory: Arc<dyn UserDirectory>,
    email: Arc<dyn EmailSender>,
    metrics: Arc<EngineMetrics>,
    config: ExecutorConfig,
    /// Workflows with a run in flight, mapped to that run's id. Held only
    /// across admission and removal.
    active: Mutex<HashMap<Uuid, Uuid>>,
    /// Command-result waiters keyed by correlation id.
    waiters: DashMap<String, oneshot::Sender<ResultEnvelope>>,
    /// Per-run cancellation tokens.
    cancels: DashMap<Uuid, CancellationToken>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Executor {
    /// Build the executor and start its command-result router.
    pub fn start(
        store: Arc<dyn WorkflowStore>,
        bus: Arc<dyn DeviceBus>,
        hub: Arc<EventHub>,
        registry: Arc<dyn EntityRegistry>,
        directory: Arc<dyn UserDirectory>,
        email: Arc<dyn EmailSender>,
        metrics: Arc<EngineMetrics>,
        config: ExecutorConfig,
    ) -> Arc<Self> {
        let inner = Arc::new(ExecutorInner {
            store,
            bus,
            hub,
            registry,
            directory,
            email,
            metrics,
            config,
            active: Mutex::new(HashMap::new()),
            waiters: DashMap::new(),
            cancels: DashMap::new(),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        });

        let router = Arc::clone(&inner);
        inner.tracker.spawn(async move {
            router.route_results().await;
        });
        Arc::new(Self { inner })
    }

    /// Admit and start a run for a workflow.
    ///
    /// Returns [`EngineError::Conflict`] when a run is already in flight;
    /// the active run's subscribers observe a `run_rejected` event.
    pub async fn dispatch(
        &self,
        workflow: &Workflow,
        triggered_by: TriggerKind,
        trigger_payload: Value,
    ) -> Result<Run, EngineError> {
        let definition = ir::normalize_and_validate(&workflow.definition)?;
        let inner = &self.inner;

        // The admission lock covers only the queued transition; the run
        // itself executes outside it.
        let run = {
            let mut active = inner.active.lock().await;
            if let Some(active_run) = active.get(&workflow.id) {
                inner.metrics.increment(&inner.metrics.runs_rejected);
                inner.hub.publish(&RunEvent::now(
                    *active_run,
                    RunEventKind::RunRejected {
                        workflow_id: workflow.id,
                    },
                ));
                debug!(workflow_id = %workflow.id, "run rejected, one already in flight");
                return Err(EngineError::Conflict);
            }
            let run = inner
                .store
                .create_run(workflow.id, triggered_by, &trigger_payload)
                .await?;
            active.insert(workflow.id, run.id);
            run
        };

        let cancel = inner.shutdown.child_token();
        inner.cancels.insert(run.id, cancel.clone());

        let task_inner = Arc::clone(inner);
        let task_run = run.clone();
        inner.tracker.spawn(async move {
            task_inner.run_task(task_run, definition, cancel).await;
        });
        Ok(run)
    }

    /// Cancel a run. Returns `false` when the run is not executing.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.inner.cancels.get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every run and wait for the tasks to drain.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

impl ExecutorInner {
    /// Route result envelopes from the bus to their registered waiters.
    async fn route_results(&self) {
        let mut results = self.bus.subscribe_results();
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                result = results.recv() => match result {
                    Ok(envelope) => {
                        if let Some((_, tx)) = self.waiters.remove(&envelope.correlation_id) {
                            let _ = tx.send(envelope);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "result router lagged behind the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn run_task(self: Arc<Self>, run: Run, definition: Definition, cancel: CancellationToken) {
        // Hard timeout delivers as a cancellation.
        let watchdog_cancel = cancel.clone();
        let run_timeout = self.config.run_timeout;
        let watchdog = tokio::spawn(async move {
            tokio::select! {
                () = watchdog_cancel.cancelled() => {}
                () = tokio::time::sleep(run_timeout) => {
                    info!("run exceeded hard timeout, cancelling");
                    watchdog_cancel.cancel();
                }
            }
        });

        self.execute_run(&run, &definition, &cancel).await;

        cancel.cancel();
        let _ = watchdog.await;
        self.active.lock().await.remove(&run.workflow_id);
        self.cancels.remove(&run.id);
    }

    async fn execute_run(&self, run: &Run, definition: &Definition, cancel: &CancellationToken) {
        if let Err(e) = self.store.mark_run_running(run.id).await {
            error!(run_id = %run.id, error = %e, "failed to start run");
            let _ = self
                .store
                .finalize_run(run.id, RunStatus::Failed, Some(e.to_string()))
                .await;
            return;
        }
        self.metrics.increment(&self.metrics.runs_started);
        self.hub.publish(&RunEvent::now(
            run.id,
            RunEventKind::RunStarted {
                workflow_id: run.workflow_id,
            },
        ));

        let Some(trigger) = select_trigger(definition, run) else {
            self.finish(run, RunStatus::Failed, Some("definition has no trigger".into()))
                .await;
            return;
        };

        let mut deque: VecDeque<String> = definition
            .outgoing(&trigger.id)
            .iter()
            .map(|e| e.to.clone())
            .collect();
        let mut cache = SelectorCache::new(SELECTOR_CACHE_TTL);

        while let Some(node_id) = deque.pop_front() {
            if cancel.is_cancelled() {
                self.finish(run, RunStatus::Cancelled, None).await;
                return;
            }
            let Some(node) = definition.node(&node_id) else {
                self.finish(
                    run,
                    RunStatus::Failed,
                    Some(format!("unknown node '{node_id}'")),
                )
                .await;
                return;
            };
            // A trigger reached mid-walk executes nothing; its children
            // continue the walk.
            if node.kind.is_trigger() {
                enqueue_front(&mut deque, definition.outgoing(&node.id).iter().map(|e| e.to.clone()));
                continue;
            }

            match self.execute_node(run, node, definition, &mut cache, cancel).await {
                NodeOutcome::Completed { next } | NodeOutcome::SoftFailed { next } => {
                    enqueue_front(&mut deque, next.into_iter());
                }
                NodeOutcome::Failed { error } => {
                    self.finish(run, RunStatus::Failed, Some(error)).await;
                    return;
                }
                NodeOutcome::Cancelled => {
                    self.finish(run, RunStatus::Cancelled, None).await;
                    return;
                }
            }
        }

        self.finish(run, RunStatus::Succeeded, None).await;
    }

    /// Journal and execute one non-trigger node.
    async fn execute_node(
        &self,
        run: &Run,
        node: &Node,
        definition: &Definition,
        cache: &mut SelectorCache,
        cancel: &CancellationToken,
    ) -> NodeOutcome {
        let step = match self
            .store
            .append_step(run.id, &node.id, node.kind.as_str())
            .await
        {
            Ok(step) => step,
            Err(e) => {
                return NodeOutcome::Failed {
                    error: format!("journaling step for '{}': {e}", node.id),
                };
            }
        };
        self.hub.publish(&RunEvent::now(
            run.id,
            RunEventKind::NodeEntered {
                node_id: node.id.clone(),
                node_kind: node.kind.to_string(),
                step_id: Some(step.id),
            },
        ));

        let outgoing: Vec<String> = definition
            .outgoing(&node.id)
            .iter()
            .map(|e| e.to.clone())
            .collect();

        let executed = match &node.data {
            NodePayload::SendCommand(command) => {
                self.exec_send_command(run, step.seq, command, cache, cancel)
                    .await
                    .map(|result| (result, outgoing.clone()))
            }
            NodePayload::NotifyEmail(email) => self
                .exec_notify_email(email)
                .await
                .map(|r| (r, outgoing.clone())),
            NodePayload::Sleep(sleep) => self
                .exec_sleep(run, &node.id, sleep.duration_sec, cancel)
                .await
                .map(|r| (r, outgoing.clone())),
            NodePayload::If(cond) => {
                let actual = lookup_path(&run.trigger_payload, &cond.path);
                let matched = cond.op.eval(actual, cond.value.as_ref());
                let branch = if matched {
                    outgoing.first()
                } else {
                    outgoing.get(1)
                };
                Ok((
                    json!({"matched": matched}),
                    branch.cloned().into_iter().collect(),
                ))
            }
            NodePayload::For(for_loop) => {
                let mut next = Vec::new();
                if let Some(body) = outgoing.first() {
                    next.extend(std::iter::repeat_n(
                        body.clone(),
                        usize::try_from(for_loop.count).unwrap_or(usize::MAX),
                    ));
                }
                if let Some(after) = outgoing.get(1) {
                    next.push(after.clone());
                }
                Ok((json!({"count": for_loop.count}), next))
            }
            // Trigger payloads never reach here.
            _ => Ok((Value::Null, outgoing.clone())),
        };

        match executed {
            Ok((result, next)) => {
                let _ = self
                    .store
                    .finalize_step(step.id, StepStatus::Succeeded, Some(result), None)
                    .await;
                self.hub.publish(&RunEvent::now(
                    run.id,
                    RunEventKind::NodeFinished {
                        node_id: node.id.clone(),
                        status: StepStatus::Succeeded,
                    },
                ));
                NodeOutcome::Completed { next }
            }
            Err(NodeError::Soft { error, result }) => {
                let _ = self
                    .store
                    .finalize_step(step.id, StepStatus::Failed, Some(result), Some(error.clone()))
                    .await;
                self.hub.publish(&RunEvent::now(
                    run.id,
                    RunEventKind::NodeFailed {
                        node_id: node.id.clone(),
                        error,
                    },
                ));
                NodeOutcome::SoftFailed { next: outgoing }
            }
            Err(NodeError::Hard(error)) => {
                let _ = self
                    .store
                    .finalize_step(step.id, StepStatus::Failed, None, Some(error.clone()))
                    .await;
                self.hub.publish(&RunEvent::now(
                    run.id,
                    RunEventKind::NodeFailed {
                        node_id: node.id.clone(),
                        error: error.clone(),
                    },
                ));
                NodeOutcome::Failed { error }
            }
            Err(NodeError::Cancelled) => {
                let _ = self
                    .store
                    .finalize_step(step.id, StepStatus::Cancelled, None, None)
                    .await;
                self.hub.publish(&RunEvent::now(
                    run.id,
                    RunEventKind::NodeFinished {
                        node_id: node.id.clone(),
                        status: StepStatus::Cancelled,
                    },
                ));
                NodeOutcome::Cancelled
            }
        }
    }

    async fn exec_send_command(
        &self,
        run: &Run,
        step_seq: i32,
        command: &ir::SendCommand,
        cache: &mut SelectorCache,
        cancel: &CancellationToken,
    ) -> Result<Value, NodeError> {
        let device_ids = match &command.targets {
            Targets::Device { ids } => {
                let mut ids = ids.clone();
                crate::collab::dedup_preserving_order(&mut ids);
                ids
            }
            Targets::Selector { selector } => cache
                .resolve(self.registry.as_ref(), selector)
                .await
                .map_err(|e| NodeError::Hard(format!("resolving targets: {e}")))?,
        };
        if device_ids.is_empty() {
            return Err(NodeError::Hard("no devices resolved for command".into()));
        }

        for device_id in &device_ids {
            let corr = correlation_id(run.id, step_seq, device_id);
            let envelope = CommandEnvelope {
                correlation_id: corr.clone(),
                device_id: device_id.clone(),
                command: command.command.clone(),
                args: command.args.clone(),
            };

            if command.wait_for_result {
                // Register the waiter before publishing so a fast result
                // cannot slip past it.
                let (tx, rx) = oneshot::channel();
                self.waiters.insert(corr.clone(), tx);

                if let Err(e) = self.bus.publish_command(&envelope).await {
                    self.waiters.remove(&corr);
                    return Err(NodeError::Hard(format!("publishing command: {e}")));
                }
                self.metrics.increment(&self.metrics.commands_published);

                let timeout = Duration::from_secs(command.result_timeout_sec);
                let result = tokio::select! {
                    () = cancel.cancelled() => {
                        self.waiters.remove(&corr);
                        return Err(NodeError::Cancelled);
                    }
                    outcome = tokio::time::timeout(timeout, rx) => outcome,
                };
                self.waiters.remove(&corr);
                match result {
                    Ok(Ok(envelope)) if envelope.success => {
                        return Ok(json!({
                            "devices": device_ids,
                            "command": command.command,
                            "result": {"success": true},
                        }));
                    }
                    Ok(Ok(envelope)) => {
                        return Err(NodeError::Hard(
                            envelope
                                .error
                                .unwrap_or_else(|| "device reported failure".to_owned()),
                        ));
                    }
                    Ok(Err(_)) => {
                        return Err(NodeError::Hard("result channel closed".into()));
                    }
                    Err(_) => {
                        return Err(NodeError::Hard(format!(
                            "timed out after {}s waiting for result from '{device_id}'",
                            command.result_timeout_sec
                        )));
                    }
                }
            }

            self.bus
                .publish_command(&envelope)
                .await
                .map_err(|e| NodeError::Hard(format!("publishing command: {e}")))?;
            self.metrics.increment(&self.metrics.commands_published);
        }

        Ok(json!({"devices": device_ids, "command": command.command}))
    }

    async fn exec_notify_email(&self, email: &ir::NotifyEmail) -> Result<Value, NodeError> {
        let mut recipients = email.user_ids.clone();
        let mut failures: Vec<String> = Vec::new();

        for role in &email.roles {
            match self.directory.users_with_role(*role).await {
                Ok(users) => recipients.extend(users),
                Err(e) => failures.push(format!("expanding role '{role}': {e}")),
            }
        }
        crate::collab::dedup_preserving_order(&mut recipients);

        if recipients.is_empty() {
            return Err(NodeError::Hard(if failures.is_empty() {
                "no recipients resolved".to_owned()
            } else {
                failures.join("; ")
            }));
        }

        let total = recipients.len();
        let mut sent = 0usize;
        for user_id in &recipients {
            match self
                .email
                .send(user_id, &email.subject, &email.message)
                .await
            {
                Ok(()) => {
                    sent += 1;
                    self.metrics.increment(&self.metrics.emails_sent);
                }
                Err(e) => failures.push(format!("sending to '{user_id}': {e}")),
            }
        }

        let result = json!({"recipients": total, "sent": sent});
        if sent == 0 {
            Err(NodeError::Hard(failures.join("; ")))
        } else if sent < total {
            Err(NodeError::Soft {
                error: failures.join("; "),
                result,
            })
        } else {
            Ok(result)
        }
    }

    async fn exec_sleep(
        &self,
        run: &Run,
        node_id: &str,
        duration_sec: u64,
        cancel: &CancellationToken,
    ) -> Result<Value, NodeError> {
        self.hub.publish(&RunEvent::now(
            run.id,
            RunEventKind::SleepStarted {
                node_id: node_id.to_owned(),
                sleep_duration_sec: duration_sec,
            },
        ));
        tokio::select! {
            () = cancel.cancelled() => Err(NodeError::Cancelled),
            () = tokio::time::sleep(Duration::from_secs(duration_sec)) => {
                Ok(json!({"slept_sec": duration_sec}))
            }
        }
    }

    /// Finalize the run, count it, and publish the terminal event.
    async fn finish(&self, run: &Run, status: RunStatus, error: Option<String>) {
        if let Err(e) = self.store.finalize_run(run.id, status, error.clone()).await {
            error!(run_id = %run.id, error = %e, "failed to finalize run");
        }
        let kind = match status {
            RunStatus::Succeeded => {
                self.metrics.increment(&self.metrics.runs_succeeded);
                RunEventKind::RunFinished { status }
            }
            RunStatus::Cancelled => {
                self.metrics.increment(&self.metrics.runs_cancelled);
                RunEventKind::RunCancelled
            }
            _ => {
                self.metrics.increment(&self.metrics.runs_failed);
                RunEventKind::RunFailed {
                    error: error.unwrap_or_else(|| "run failed".to_owned()),
                }
            }
        };
        self.hub.publish(&RunEvent::now(run.id, kind));
        info!(run_id = %run.id, status = %status, "run finished");
    }
}

/// Push node ids to the front of the deque preserving their order, keeping
/// the walk depth-first.
fn enqueue_front(deque: &mut VecDeque<String>, ids: impl DoubleEndedIterator<Item = String>) {
    for id in ids.rev() {
        deque.push_front(id);
    }
}

/// The trigger node a run starts from: the payload's `node_id` when it
/// names one, else the first trigger matching the run's kind, else the
/// first trigger.
fn select_trigger<'a>(definition: &'a Definition, run: &Run) -> Option<&'a Node> {
    if let Some(node_id) = run.trigger_payload.get("node_id").and_then(Value::as_str) {
        if let Some(node) = definition.node(node_id) {
            if node.kind.is_trigger() {
                return Some(node);
            }
        }
    }
    let wanted = match run.triggered_by {
        TriggerKind::Manual => ir::NodeKind::TriggerManual,
        TriggerKind::Schedule => ir::NodeKind::TriggerSchedule,
        TriggerKind::DeviceState => ir::NodeKind::TriggerDeviceState,
    };
    definition
        .triggers()
        .find(|n| n.kind == wanted)
        .or_else(|| definition.triggers().next())
}

enum NodeOutcome {
    Completed { next: Vec<String> },
    SoftFailed { next: Vec<String> },
    Failed { error: String },
    Cancelled,
}

enum NodeError {
    /// Step fails but the run continues (partial recipient failure).
    Soft { error: String, result: Value },
    /// Step and run fail.
    Hard(String),
    Cancelled,
}
