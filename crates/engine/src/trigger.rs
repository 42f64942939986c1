//! Trigger manager: cron schedules and device-state matching.
//!
//! Manual runs come in through the HTTP surface; this module owns the other
//! two trigger flavors. Each enabled `trigger.schedule` node gets its own
//! cron task; one subscription task watches the device bus and walks the
//! enabled `trigger.device_state` nodes per frame. Both re-fetch the
//! workflow from the store immediately before dispatching, so a fire always
//! runs the current definition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use domo_bus::DeviceBus;
use domo_core::{DeviceFrame, TriggerKind, flatten};

use crate::collab::{EntityRegistry, SelectorCache};
use crate::error::EngineError;
use crate::executor::Executor;
use crate::ir::{self, Definition, DeviceStateTrigger, NodePayload};
use crate::metrics::EngineMetrics;
use crate::store::{Workflow, WorkflowStore};

/// TTL for the manager's selector resolution cache.
const SELECTOR_CACHE_TTL: Duration = Duration::from_secs(30);

/// An enabled workflow with its validated definition.
#[derive(Clone)]
struct Snapshot {
    workflow: Workflow,
    definition: Definition,
}

/// Owns the schedule and device-state trigger machinery.
pub struct TriggerManager {
    store: Arc<dyn WorkflowStore>,
    bus: Arc<dyn DeviceBus>,
    executor: Arc<Executor>,
    registry: Arc<dyn EntityRegistry>,
    metrics: Arc<EngineMetrics>,
    reload: Arc<Notify>,
    snapshots: RwLock<Vec<Snapshot>>,
    /// Last fire per (workflow, node), for cooldown suppression.
    cooldowns: Mutex<HashMap<(Uuid, String), Instant>>,
    selector_cache: Mutex<SelectorCache>,
}

impl TriggerManager {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        bus: Arc<dyn DeviceBus>,
        executor: Arc<Executor>,
        registry: Arc<dyn EntityRegistry>,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            executor,
            registry,
            metrics,
            reload: Arc::new(Notify::new()),
            snapshots: RwLock::new(Vec::new()),
            cooldowns: Mutex::new(HashMap::new()),
            selector_cache: Mutex::new(SelectorCache::new(SELECTOR_CACHE_TTL)),
        })
    }

    /// Handle the HTTP layer pokes after workflow mutations.
    #[must_use]
    pub fn reload_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.reload)
    }

    /// Run until `shutdown` fires. Cron tasks are rebuilt on every reload;
    /// the bus subscription lives for the whole lifetime.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let device_task = {
            let manager = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                manager.watch_device_frames(shutdown).await;
            })
        };

        loop {
            self.refresh_snapshots().await;

            let generation = shutdown.child_token();
            let tracker = TaskTracker::new();
            Self::spawn_cron_tasks(&self, &tracker, &generation).await;
            tracker.close();

            tokio::select! {
                () = shutdown.cancelled() => {
                    generation.cancel();
                    tracker.wait().await;
                    break;
                }
                () = self.reload.notified() => {
                    debug!("workflow change observed, rebuilding trigger schedules");
                    generation.cancel();
                    tracker.wait().await;
                }
            }
        }

        let _ = device_task.await;
    }

    /// Reload enabled workflows from the store.
    async fn refresh_snapshots(&self) {
        let workflows = match self.store.list_workflows().await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "failed to load workflows for triggers");
                return;
            }
        };
        let mut snapshots = Vec::new();
        for workflow in workflows.into_iter().filter(|w| w.enabled) {
            match ir::normalize_and_validate(&workflow.definition) {
                Ok(definition) => snapshots.push(Snapshot {
                    workflow,
                    definition,
                }),
                Err(e) => {
                    // The store invariant makes this unreachable; refuse to
                    // trigger rather than run an unvalidated definition.
                    warn!(workflow_id = %workflow.id, error = %e, "stored definition failed validation");
                }
            }
        }
        *self.snapshots.write().await = snapshots;
    }

    async fn spawn_cron_tasks(
        manager: &Arc<Self>,
        tracker: &TaskTracker,
        generation: &CancellationToken,
    ) {
        let snapshots = manager.snapshots.read().await;
        for snapshot in snapshots.iter() {
            for node in snapshot.definition.nodes.iter() {
                let NodePayload::Schedule(schedule) = &node.data else {
                    continue;
                };
                let Ok(cron) = ir::validate_cron(&schedule.cron) else {
                    continue;
                };
                let entry = CronEntry {
                    workflow_id: snapshot.workflow.id,
                    node_id: node.id.clone(),
                    cron,
                    cooldown_sec: schedule.cooldown_sec,
                };
                let manager = Arc::clone(manager);
                let generation = generation.clone();
                tracker.spawn(async move {
                    manager.run_cron_entry(entry, generation).await;
                });
            }
        }
        info!("trigger schedules rebuilt");
    }

    async fn run_cron_entry(self: Arc<Self>, entry: CronEntry, generation: CancellationToken) {
        loop {
            let now = Utc::now();
            let Ok(next) = entry.cron.find_next_occurrence(&now, false) else {
                debug!(node = %entry.node_id, "cron has no future occurrence");
                return;
            };
            let wait = (next - now)
                .to_std()
                .unwrap_or_else(|_| Duration::from_secs(0));

            tokio::select! {
                () = generation.cancelled() => return,
                () = tokio::time::sleep(wait) => {}
            }

            if !self
                .cooldown_elapsed(entry.workflow_id, &entry.node_id, entry.cooldown_sec)
                .await
            {
                self.metrics.increment(&self.metrics.trigger_suppressed);
                continue;
            }

            let payload = serde_json::json!({
                "node_id": entry.node_id,
                "fired_at": next.to_rfc3339(),
            });
            self.fire(entry.workflow_id, &entry.node_id, TriggerKind::Schedule, payload)
                .await;
        }
    }

    /// Watch the device bus for state frames.
    async fn watch_device_frames(self: Arc<Self>, shutdown: CancellationToken) {
        let mut frames = self.bus.subscribe_frames();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                frame = frames.recv() => match frame {
                    Ok(frame) => self.handle_frame(&frame).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "device frame subscription lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn handle_frame(&self, frame: &DeviceFrame) {
        let snapshots = self.snapshots.read().await.clone();
        for snapshot in &snapshots {
            for node in &snapshot.definition.nodes {
                let NodePayload::DeviceState(trigger) = &node.data else {
                    continue;
                };
                if frame.retained && trigger.ignore_retained {
                    self.metrics.increment(&self.metrics.trigger_suppressed);
                    continue;
                }
                if !self.target_matches(&trigger.target, &frame.device_id).await {
                    continue;
                }
                if !evaluate_state(trigger, frame) {
                    continue;
                }
                if !self
                    .cooldown_elapsed(snapshot.workflow.id, &node.id, trigger.cooldown_sec)
                    .await
                {
                    self.metrics.increment(&self.metrics.trigger_suppressed);
                    continue;
                }

                let payload = serde_json::json!({
                    "node_id": node.id,
                    "device_id": frame.device_id,
                    "state": frame.state,
                });
                self.fire(
                    snapshot.workflow.id,
                    &node.id,
                    TriggerKind::DeviceState,
                    payload,
                )
                .await;
            }
        }
    }

    /// Whether a trigger target covers the given device. Plain targets
    /// match by id; selector targets (`tag:kitchen`) resolve through the
    /// registry with a short-lived cache.
    async fn target_matches(&self, target: &str, device_id: &str) -> bool {
        if target == device_id {
            return true;
        }
        if !target.contains(':') {
            return false;
        }
        let mut cache = self.selector_cache.lock().await;
        match cache.resolve(self.registry.as_ref(), target).await {
            Ok(ids) => ids.iter().any(|id| id == device_id),
            Err(e) => {
                warn!(selector = target, error = %e, "selector resolution failed");
                false
            }
        }
    }

    async fn cooldown_elapsed(&self, workflow_id: Uuid, node_id: &str, cooldown_sec: u64) -> bool {
        let mut cooldowns = self.cooldowns.lock().await;
        let key = (workflow_id, node_id.to_owned());
        let now = Instant::now();
        if cooldown_sec > 0 {
            if let Some(last) = cooldowns.get(&key) {
                if now.duration_since(*last) < Duration::from_secs(cooldown_sec) {
                    return false;
                }
            }
        }
        cooldowns.insert(key, now);
        true
    }

    /// Re-fetch the workflow and dispatch a run. Fetching right before
    /// dispatch picks up any definition change since the last reload.
    async fn fire(
        &self,
        workflow_id: Uuid,
        node_id: &str,
        kind: TriggerKind,
        payload: serde_json::Value,
    ) {
        let workflow = match self.store.get_workflow(workflow_id).await {
            Ok(Some(workflow)) if workflow.enabled => workflow,
            Ok(_) => {
                debug!(workflow_id = %workflow_id, "workflow gone or disabled, skipping fire");
                return;
            }
            Err(e) => {
                warn!(workflow_id = %workflow_id, error = %e, "loading workflow for trigger");
                return;
            }
        };

        self.metrics.increment(&self.metrics.trigger_fires);
        match self.executor.dispatch(&workflow, kind, payload).await {
            Ok(run) => {
                info!(workflow_id = %workflow_id, run_id = %run.id, trigger = %kind, node = node_id, "trigger dispatched run");
            }
            Err(EngineError::Conflict) => {
                debug!(workflow_id = %workflow_id, "trigger fire rejected, run already active");
            }
            Err(e) => {
                warn!(workflow_id = %workflow_id, error = %e, "trigger dispatch failed");
            }
        }
    }
}

struct CronEntry {
    workflow_id: Uuid,
    node_id: String,
    cron: croner::Cron,
    cooldown_sec: u64,
}

/// Evaluate a device-state trigger against a frame. An empty key matches
/// any non-empty state payload.
fn evaluate_state(trigger: &DeviceStateTrigger, frame: &DeviceFrame) -> bool {
    let flat = flatten(&frame.state);
    if trigger.key.is_empty() {
        return !flat.is_empty() && trigger.op.eval(Some(&frame.state), trigger.value.as_ref());
    }
    trigger.op.eval(flat.get(&trigger.key), trigger.value.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use domo_core::Comparator;
    use serde_json::json;

    fn trigger(key: &str, op: Comparator, value: Option<serde_json::Value>) -> DeviceStateTrigger {
        DeviceStateTrigger {
            target: "d1".into(),
            key: key.into(),
            op,
            value,
            cooldown_sec: 0,
            ignore_retained: true,
        }
    }

    fn frame(state: serde_json::Value) -> DeviceFrame {
        DeviceFrame {
            device_id: "d1".into(),
            state,
            retained: false,
        }
    }

    #[test]
    fn key_comparison_uses_flattened_state() {
        let t = trigger("sensors.motion", Comparator::Eq, Some(json!(true)));
        assert!(evaluate_state(&t, &frame(json!({"sensors": {"motion": true}}))));
        assert!(!evaluate_state(&t, &frame(json!({"sensors": {"motion": false}}))));
        assert!(!evaluate_state(&t, &frame(json!({}))));
    }

    #[test]
    fn empty_key_matches_any_non_empty_frame() {
        let t = trigger("", Comparator::Exists, None);
        assert!(evaluate_state(&t, &frame(json!({"anything": 1}))));
        assert!(!evaluate_state(&t, &frame(json!({}))));
    }

    #[test]
    fn numeric_comparison() {
        let t = trigger("lux", Comparator::Lt, Some(json!(50)));
        assert!(evaluate_state(&t, &frame(json!({"lux": 40}))));
        assert!(!evaluate_state(&t, &frame(json!({"lux": 60}))));
        assert!(!evaluate_state(&t, &frame(json!({"lux": "dark"}))));
    }
}
