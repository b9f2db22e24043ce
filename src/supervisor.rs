use crate::bus::OutcomeBus;
use crate::prober::{ProberHandle, spawn_prober};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

struct TargetSession {
    timeout_ms: u32,
    prober: ProberHandle,
}

/// The only authority that creates or destroys probers.
///
/// The session map is the single piece of control-plane shared state; every
/// reader and writer takes the same lock. Stop operations hold it across the
/// join, which serializes start/stop for the same target; the wait is bounded
/// by the stopped prober's timeout budget plus the pacing floor.
pub struct ProbeSupervisor {
    bus: OutcomeBus,
    sessions: Mutex<HashMap<String, TargetSession>>,
}

impl ProbeSupervisor {
    pub fn new(bus: OutcomeBus) -> Self {
        Self {
            bus,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start probing `target`. No-op if a session already exists; the
    /// existing session keeps its timeout budget.
    pub fn start_probe(&self, target: &str, timeout_ms: u32) {
        let mut sessions = self.lock_sessions();
        if sessions.contains_key(target) {
            return;
        }
        tracing::info!(target = %target, timeout_ms, "starting prober");
        let prober = spawn_prober(target.to_string(), timeout_ms, self.bus.clone());
        sessions.insert(
            target.to_string(),
            TargetSession { timeout_ms, prober },
        );
    }

    /// Stop probing `target` and wait for its thread to fully exit. No-op if
    /// no session exists.
    pub fn stop_probe(&self, target: &str) {
        let mut sessions = self.lock_sessions();
        if let Some(mut session) = sessions.remove(target) {
            tracing::info!(target = %target, "stopping prober");
            session.prober.stop();
        }
    }

    /// Update the timeout budget for a running session, effective from its
    /// next attempt.
    pub fn set_timeout(&self, target: &str, timeout_ms: u32) {
        let mut sessions = self.lock_sessions();
        if let Some(session) = sessions.get_mut(target) {
            session.timeout_ms = timeout_ms;
            session.prober.set_timeout(timeout_ms);
        }
    }

    /// Stop every session and wait for all prober threads to exit.
    pub fn stop_all(&self) {
        let mut sessions = self.lock_sessions();
        for (target, mut session) in sessions.drain() {
            tracing::info!(target = %target, "stopping prober");
            session.prober.stop();
        }
    }

    pub fn is_active(&self, target: &str) -> bool {
        self.lock_sessions().contains_key(target)
    }

    pub fn active_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.lock_sessions().keys().cloned().collect();
        targets.sort();
        targets
    }

    pub fn session_timeout_ms(&self, target: &str) -> Option<u32> {
        self.lock_sessions().get(target).map(|s| s.timeout_ms)
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, TargetSession>> {
        self.sessions.lock().expect("supervisor lock poisoned")
    }
}

impl Drop for ProbeSupervisor {
    fn drop(&mut self) {
        self.stop_all();
    }
}
