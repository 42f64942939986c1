use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters tracking engine activity.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub runs_started: AtomicU64,
    pub runs_succeeded: AtomicU64,
    pub runs_failed: AtomicU64,
    pub runs_cancelled: AtomicU64,
    /// Admissions rejected because a run was already in flight.
    pub runs_rejected: AtomicU64,
    pub events_published: AtomicU64,
    /// Events lost to full subscriber channels (subscriber dropped).
    pub events_dropped: AtomicU64,
    pub trigger_fires: AtomicU64,
    /// Trigger evaluations suppressed by cooldown or retained frames.
    pub trigger_suppressed: AtomicU64,
    pub commands_published: AtomicU64,
    pub emails_sent: AtomicU64,
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MetricsSnapshot {
    pub runs_started: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub runs_cancelled: u64,
    pub runs_rejected: u64,
    pub events_published: u64,
    pub events_dropped: u64,
    pub trigger_fires: u64,
    pub trigger_suppressed: u64,
    pub commands_published: u64,
    pub emails_sent: u64,
}

impl EngineMetrics {
    pub fn increment(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_succeeded: self.runs_succeeded.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            runs_cancelled: self.runs_cancelled.load(Ordering::Relaxed),
            runs_rejected: self.runs_rejected.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            trigger_fires: self.trigger_fires.load(Ordering::Relaxed),
            trigger_suppressed: self.trigger_suppressed.load(Ordering::Relaxed),
            commands_published: self.commands_published.load(Ordering::Relaxed),
            emails_sent: self.emails_sent.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// Render the snapshot in Prometheus text exposition format.
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for (name, value) in [
            ("domo_engine_runs_started_total", self.runs_started),
            ("domo_engine_runs_succeeded_total", self.runs_succeeded),
            ("domo_engine_runs_failed_total", self.runs_failed),
            ("domo_engine_runs_cancelled_total", self.runs_cancelled),
            ("domo_engine_runs_rejected_total", self.runs_rejected),
            ("domo_engine_events_published_total", self.events_published),
            ("domo_engine_events_dropped_total", self.events_dropped),
            ("domo_engine_trigger_fires_total", self.trigger_fires),
            ("domo_engine_trigger_suppressed_total", self.trigger_suppressed),
            ("domo_engine_commands_published_total", self.commands_published),
            ("domo_engine_emails_sent_total", self.emails_sent),
        ] {
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        }
        out
    }
}
