use crate::outcome::{ProbeOutcome, ProbeResult};
use crossbeam_channel::Receiver;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum StatusLabel {
    Active,
    Timeout,
    Error,
}

impl StatusLabel {
    pub fn label(self) -> &'static str {
        match self {
            StatusLabel::Active => "Active",
            StatusLabel::Timeout => "Timeout",
            StatusLabel::Error => "Error",
        }
    }
}

/// Running per-target summary, updated once per delivered outcome.
#[derive(Clone, Debug, Serialize)]
pub struct RunningStats {
    pub target: String,
    pub sent: u64,
    pub received: u64,
    pub min_rtt_ms: Option<u32>,
    pub max_rtt_ms: Option<u32>,
    pub avg_rtt_ms: Option<f64>,
    pub last_ttl: Option<u8>,
    pub status: StatusLabel,
}

impl RunningStats {
    pub fn loss_percent(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            100.0 * (self.sent - self.received) as f64 / self.sent as f64
        }
    }
}

#[derive(Debug, Default)]
struct TargetStats {
    sent: u64,
    received: u64,
    min_rtt_ms: Option<u32>,
    max_rtt_ms: Option<u32>,
    rtt_sum_ms: u64,
    last_ttl: Option<u8>,
    status: Option<StatusLabel>,
}

/// Read model over the outcome stream: live per-target statistics with no
/// feedback into the probing side. The average counts successes only.
#[derive(Default)]
pub struct AggregationView {
    targets: Mutex<HashMap<String, TargetStats>>,
}

impl AggregationView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, outcome: &ProbeOutcome) {
        let mut targets = self.targets.lock().expect("stats lock poisoned");
        let stats = targets.entry(outcome.target.clone()).or_default();
        stats.sent += 1;
        match outcome.result {
            ProbeResult::Success { rtt_ms, ttl } => {
                stats.received += 1;
                stats.rtt_sum_ms += u64::from(rtt_ms);
                stats.min_rtt_ms = Some(stats.min_rtt_ms.map_or(rtt_ms, |min| min.min(rtt_ms)));
                stats.max_rtt_ms = Some(stats.max_rtt_ms.map_or(rtt_ms, |max| max.max(rtt_ms)));
                stats.last_ttl = Some(ttl);
                stats.status = Some(StatusLabel::Active);
            }
            ProbeResult::Timeout => stats.status = Some(StatusLabel::Timeout),
            ProbeResult::ResolveError => stats.status = Some(StatusLabel::Error),
        }
    }

    pub fn target_stats(&self, target: &str) -> Option<RunningStats> {
        let targets = self.targets.lock().expect("stats lock poisoned");
        targets.get(target).map(|stats| to_running(target, stats))
    }

    /// Snapshot of every tracked target, sorted by name.
    pub fn snapshot(&self) -> Vec<RunningStats> {
        let targets = self.targets.lock().expect("stats lock poisoned");
        let mut rows: Vec<RunningStats> = targets
            .iter()
            .map(|(target, stats)| to_running(target, stats))
            .collect();
        rows.sort_by(|a, b| a.target.cmp(&b.target));
        rows
    }

    /// Drop a target's statistics entirely; the only way they reset.
    pub fn remove_target(&self, target: &str) {
        self.targets
            .lock()
            .expect("stats lock poisoned")
            .remove(target);
    }
}

fn to_running(target: &str, stats: &TargetStats) -> RunningStats {
    RunningStats {
        target: target.to_string(),
        sent: stats.sent,
        received: stats.received,
        min_rtt_ms: stats.min_rtt_ms,
        max_rtt_ms: stats.max_rtt_ms,
        avg_rtt_ms: (stats.received > 0).then(|| stats.rtt_sum_ms as f64 / stats.received as f64),
        last_ttl: stats.last_ttl,
        status: stats.status.unwrap_or(StatusLabel::Error),
    }
}

/// Consume a bus subscription on a dedicated thread, feeding the view until
/// the bus goes away.
pub fn spawn_aggregator(view: Arc<AggregationView>, rx: Receiver<ProbeOutcome>) -> JoinHandle<()> {
    thread::spawn(move || {
        for outcome in rx {
            view.apply(&outcome);
        }
    })
}
