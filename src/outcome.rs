/// One completed probe attempt against a single target.
///
/// Created by that target's prober at the moment the attempt resolves and
/// immutable afterwards. `sequence` starts at 1 and increases by exactly one
/// per attempt for the lifetime of the session, including failed attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub target: String,
    pub sequence: u32,
    pub result: ProbeResult,
    /// Wall-clock milliseconds since epoch, taken just before the attempt.
    pub start_time: i64,
    /// Wall-clock milliseconds since epoch, taken when the attempt resolved.
    pub end_time: i64,
    /// Timeout budget that was in effect for this attempt.
    pub timeout_budget_ms: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeResult {
    Success { rtt_ms: u32, ttl: u8 },
    Timeout,
    ResolveError,
}

impl ProbeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeResult::Success { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProbeResult::Success { .. } => "Reply",
            ProbeResult::Timeout => "Timeout",
            ProbeResult::ResolveError => "Error",
        }
    }
}
