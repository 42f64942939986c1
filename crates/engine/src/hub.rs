//! Per-run event pub/sub with bounded replay.
//!
//! The hub never blocks the executor: publishing is a ring-buffer append
//! plus a non-blocking fan-out, and a subscriber whose channel is full is
//! dropped rather than waited on. Late subscribers get a best-effort replay
//! of the ring so they see the beginning of the run; the ring outlives the
//! terminal event briefly so reconnecting clients don't lose context.
//! Delivery is at-most-once per subscriber; the run record in the store is
//! the source of truth clients reconcile against.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use domo_core::RunEvent;

use crate::metrics::EngineMetrics;

/// Ring buffer capacity per run.
const REPLAY_CAPACITY: usize = 200;

/// Per-subscriber channel capacity.
const SUBSCRIBER_CAPACITY: usize = 64;

/// How long a run's ring outlives its terminal event.
const TERMINAL_GRACE: Duration = Duration::from_secs(30);

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<RunEvent>,
}

#[derive(Default)]
struct RunChannel {
    ring: VecDeque<RunEvent>,
    subscribers: Vec<Subscriber>,
    terminal_at: Option<Instant>,
}

#[derive(Default)]
struct HubInner {
    runs: HashMap<Uuid, RunChannel>,
    next_subscriber_id: u64,
}

/// In-memory pub/sub keyed by run id.
pub struct EventHub {
    inner: Mutex<HubInner>,
    metrics: Arc<EngineMetrics>,
}

impl EventHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new(metrics: Arc<EngineMetrics>) -> Self {
        Self {
            inner: Mutex::new(HubInner::default()),
            metrics,
        }
    }

    /// Publish an event to a run's ring and all current subscribers.
    ///
    /// Never blocks: subscribers with a full channel are removed.
    pub fn publish(&self, event: &RunEvent) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        sweep_expired(&mut inner);

        let channel = inner.runs.entry(event.run_id).or_default();
        if channel.ring.len() == REPLAY_CAPACITY {
            channel.ring.pop_front();
        }
        channel.ring.push_back(event.clone());
        if event.is_terminal() {
            channel.terminal_at = Some(Instant::now());
        }

        let mut dropped = 0;
        channel.subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                dropped += 1;
                false
            }
        });

        self.metrics.increment(&self.metrics.events_published);
        for _ in 0..dropped {
            self.metrics.increment(&self.metrics.events_dropped);
        }
        if dropped > 0 {
            debug!(run_id = %event.run_id, dropped, "dropped slow event subscribers");
        }
    }

    /// Subscribe to a run's events.
    ///
    /// Any buffered history is replayed (best-effort) before live events.
    /// Dropping the returned guard removes the subscription.
    pub fn subscribe(hub: &Arc<Self>, run_id: Uuid) -> (mpsc::Receiver<RunEvent>, SubscriptionGuard) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = {
            let Ok(mut inner) = hub.inner.lock() else {
                return (
                    rx,
                    SubscriptionGuard {
                        hub: Arc::clone(hub),
                        run_id,
                        id: 0,
                    },
                );
            };
            sweep_expired(&mut inner);
            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;

            let channel = inner.runs.entry(run_id).or_default();
            for event in &channel.ring {
                // Replay cannot exceed the channel capacity by much; losses
                // here are acceptable by contract.
                let _ = tx.try_send(event.clone());
            }
            channel.subscribers.push(Subscriber { id, tx });
            id
        };
        (
            rx,
            SubscriptionGuard {
                hub: Arc::clone(hub),
                run_id,
                id,
            },
        )
    }

    fn unsubscribe(&self, run_id: Uuid, id: u64) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if let Some(channel) = inner.runs.get_mut(&run_id) {
            channel.subscribers.retain(|s| s.id != id);
            // The ring stays for the grace period even with no subscribers,
            // so a reconnecting client can still catch up.
            if channel.subscribers.is_empty()
                && channel
                    .terminal_at
                    .is_some_and(|t| t.elapsed() >= TERMINAL_GRACE)
            {
                inner.runs.remove(&run_id);
            }
        }
    }
}

/// Drop rings whose run ended longer than the grace period ago.
fn sweep_expired(inner: &mut HubInner) {
    inner.runs.retain(|_, channel| {
        channel.subscribers.retain(|s| !s.tx.is_closed());
        !(channel.subscribers.is_empty()
            && channel
                .terminal_at
                .is_some_and(|t| t.elapsed() >= TERMINAL_GRACE))
    });
}

/// RAII guard removing the subscription on drop.
pub struct SubscriptionGuard {
    hub: Arc<EventHub>,
    run_id: Uuid,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.run_id, self.id);
    }
}
