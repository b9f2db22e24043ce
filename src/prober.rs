use crate::bus::OutcomeBus;
use crate::common::net::resolve_ipv4;
use crate::common::time::unix_millis;
use crate::icmp::{EchoTransport, IcmpError, IcmpSocket};
use crate::outcome::{ProbeOutcome, ProbeResult};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::net::Ipv4Addr;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Minimum interval between attempt starts, bounding the request rate even
/// against very fast replies.
pub const PACING_FLOOR: Duration = Duration::from_millis(20);

/// Sleep after a failed resolution before retrying, preventing a busy loop
/// against an unreachable name.
pub const RESOLVE_BACKOFF: Duration = Duration::from_millis(1000);

#[derive(Clone, Copy, Debug)]
pub enum ControlMessage {
    SetTimeout(u32),
    Stop,
}

/// Control surface for one running prober thread.
///
/// Dropping the handle stops the loop and joins the thread, so the native
/// probe socket is released deterministically on every exit path.
pub struct ProberHandle {
    control: Sender<ControlMessage>,
    join: Option<JoinHandle<()>>,
}

impl ProberHandle {
    /// New budget takes effect from the next attempt; an attempt already in
    /// flight keeps the old one.
    pub fn set_timeout(&self, timeout_ms: u32) {
        let _ = self.control.send(ControlMessage::SetTimeout(timeout_ms));
    }

    /// Request cooperative termination and wait for the loop to fully exit.
    pub fn stop(&mut self) {
        let _ = self.control.send(ControlMessage::Stop);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ProberHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn a prober backed by a real ICMP socket.
pub fn spawn_prober(target: String, timeout_ms: u32, bus: OutcomeBus) -> ProberHandle {
    spawn_prober_with(target, timeout_ms, bus, IcmpSocket::open)
}

/// Spawn a prober with an explicit transport factory. The factory runs on the
/// prober thread so the socket never crosses threads.
pub fn spawn_prober_with<T, F>(
    target: String,
    timeout_ms: u32,
    bus: OutcomeBus,
    transport_factory: F,
) -> ProberHandle
where
    T: EchoTransport + 'static,
    F: FnOnce() -> Result<T, IcmpError> + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::unbounded();
    let join = thread::spawn(move || match transport_factory() {
        Ok(transport) => run_prober(target, timeout_ms, transport, rx, bus),
        Err(err) => {
            // Fatal to this prober only; no outcome is fabricated for it.
            tracing::error!(target = %target, error = %err, "probe transport unavailable");
        }
    });
    ProberHandle {
        control: tx,
        join: Some(join),
    }
}

fn run_prober<T: EchoTransport>(
    target: String,
    mut timeout_ms: u32,
    mut transport: T,
    control_rx: Receiver<ControlMessage>,
    bus: OutcomeBus,
) {
    let mut sequence: u32 = 0;
    let mut resolved: Option<Ipv4Addr> = None;

    loop {
        // Stop is observed here, between attempts, never mid-attempt.
        if !drain_control(&control_rx, &mut timeout_ms) {
            break;
        }

        let iteration_started = Instant::now();
        if resolved.is_none() {
            resolved = resolve_ipv4(&target);
        }

        let wait = match resolved {
            Some(addr) => {
                sequence += 1;
                let budget = Duration::from_millis(u64::from(timeout_ms));
                let start_time = unix_millis();
                let result = transport.echo(addr, (sequence & 0xffff) as u16, budget);
                let end_time = unix_millis();

                let result = match result {
                    Ok(reply) => ProbeResult::Success {
                        rtt_ms: reply.rtt.as_millis() as u32,
                        ttl: reply.ttl,
                    },
                    Err(IcmpError::TimedOut(_)) => ProbeResult::Timeout,
                    Err(err) => {
                        tracing::warn!(target = %target, error = %err, "echo attempt failed");
                        ProbeResult::Timeout
                    }
                };

                bus.publish(ProbeOutcome {
                    target: target.clone(),
                    sequence,
                    result,
                    start_time,
                    end_time,
                    timeout_budget_ms: timeout_ms,
                });

                PACING_FLOOR.saturating_sub(iteration_started.elapsed())
            }
            None => {
                sequence += 1;
                let now = unix_millis();
                bus.publish(ProbeOutcome {
                    target: target.clone(),
                    sequence,
                    result: ProbeResult::ResolveError,
                    start_time: now,
                    end_time: now,
                    timeout_budget_ms: timeout_ms,
                });
                RESOLVE_BACKOFF
            }
        };

        if !idle_wait(&control_rx, wait, &mut timeout_ms) {
            break;
        }
    }
}

/// Apply queued control messages. Returns false once stop was requested or
/// the controlling side went away.
fn drain_control(control_rx: &Receiver<ControlMessage>, timeout_ms: &mut u32) -> bool {
    loop {
        match control_rx.try_recv() {
            Ok(ControlMessage::SetTimeout(value)) => *timeout_ms = value,
            Ok(ControlMessage::Stop) | Err(TryRecvError::Disconnected) => return false,
            Err(TryRecvError::Empty) => return true,
        }
    }
}

/// Sleep for `wait` while staying responsive to control messages. Returns
/// false once stop was requested.
fn idle_wait(
    control_rx: &Receiver<ControlMessage>,
    wait: Duration,
    timeout_ms: &mut u32,
) -> bool {
    let deadline = Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        match control_rx.recv_timeout(remaining) {
            Ok(ControlMessage::SetTimeout(value)) => *timeout_ms = value,
            Ok(ControlMessage::Stop) | Err(RecvTimeoutError::Disconnected) => return false,
            Err(RecvTimeoutError::Timeout) => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::icmp::EchoReply;
    use std::sync::{Arc, Mutex};

    /// Scripted transport: replies instantly and records the timeout budget
    /// seen by each attempt.
    struct FakeTransport {
        budgets: Arc<Mutex<Vec<Duration>>>,
        fail_with_timeout: bool,
    }

    impl EchoTransport for FakeTransport {
        fn echo(
            &mut self,
            _addr: Ipv4Addr,
            _sequence: u16,
            timeout: Duration,
        ) -> Result<EchoReply, IcmpError> {
            self.budgets.lock().unwrap().push(timeout);
            if self.fail_with_timeout {
                Err(IcmpError::TimedOut(timeout))
            } else {
                Ok(EchoReply {
                    rtt: Duration::from_millis(3),
                    ttl: 64,
                })
            }
        }
    }

    fn fake_factory(
        budgets: Arc<Mutex<Vec<Duration>>>,
        fail_with_timeout: bool,
    ) -> impl FnOnce() -> Result<FakeTransport, IcmpError> + Send + 'static {
        move || {
            Ok(FakeTransport {
                budgets,
                fail_with_timeout,
            })
        }
    }

    #[test]
    fn sequences_start_at_one_with_no_gaps() {
        let bus = OutcomeBus::new();
        let rx = bus.subscribe();
        let budgets = Arc::new(Mutex::new(Vec::new()));
        let mut handle = spawn_prober_with(
            "127.0.0.1".to_string(),
            1000,
            bus,
            fake_factory(budgets, false),
        );

        let mut sequences = Vec::new();
        for _ in 0..5 {
            let outcome = rx.recv_timeout(Duration::from_secs(2)).expect("outcome");
            assert!(outcome.result.is_success());
            assert!(outcome.end_time >= outcome.start_time);
            sequences.push(outcome.sequence);
        }
        handle.stop();

        assert_eq!(&sequences[..], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn timeouts_still_advance_the_sequence() {
        let bus = OutcomeBus::new();
        let rx = bus.subscribe();
        let budgets = Arc::new(Mutex::new(Vec::new()));
        let mut handle = spawn_prober_with(
            "127.0.0.1".to_string(),
            1000,
            bus,
            fake_factory(budgets, true),
        );

        let first = rx.recv_timeout(Duration::from_secs(2)).expect("outcome");
        let second = rx.recv_timeout(Duration::from_secs(2)).expect("outcome");
        handle.stop();

        assert_eq!(first.result, ProbeResult::Timeout);
        assert_eq!((first.sequence, second.sequence), (1, 2));
    }

    #[test]
    fn stop_joins_and_silences_the_prober() {
        let bus = OutcomeBus::new();
        let rx = bus.subscribe();
        let budgets = Arc::new(Mutex::new(Vec::new()));
        let mut handle = spawn_prober_with(
            "127.0.0.1".to_string(),
            1000,
            bus,
            fake_factory(budgets, false),
        );

        let _ = rx.recv_timeout(Duration::from_secs(2)).expect("outcome");
        handle.stop();

        // Anything already in flight was published before stop() returned.
        while rx.try_recv().is_ok() {}
        std::thread::sleep(Duration::from_millis(60));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn immediate_stop_publishes_at_most_one_outcome() {
        let bus = OutcomeBus::new();
        let rx = bus.subscribe();
        let budgets = Arc::new(Mutex::new(Vec::new()));
        let mut handle = spawn_prober_with(
            "127.0.0.1".to_string(),
            500,
            bus,
            fake_factory(budgets, false),
        );
        handle.stop();

        let mut published = 0;
        while rx.try_recv().is_ok() {
            published += 1;
        }
        assert!(published <= 1, "published {published} outcomes");
    }

    #[test]
    fn set_timeout_applies_from_next_attempt() {
        let bus = OutcomeBus::new();
        let rx = bus.subscribe();
        let budgets = Arc::new(Mutex::new(Vec::new()));
        let mut handle = spawn_prober_with(
            "127.0.0.1".to_string(),
            1000,
            bus,
            fake_factory(budgets.clone(), false),
        );

        let _ = rx.recv_timeout(Duration::from_secs(2)).expect("outcome");
        handle.set_timeout(5000);
        // Give the loop a couple of iterations to pick the new budget up.
        let mut saw_new_budget = false;
        for _ in 0..20 {
            let outcome = rx.recv_timeout(Duration::from_secs(2)).expect("outcome");
            if outcome.timeout_budget_ms == 5000 {
                saw_new_budget = true;
                break;
            }
        }
        handle.stop();

        assert!(saw_new_budget);
        assert!(
            budgets
                .lock()
                .unwrap()
                .contains(&Duration::from_millis(5000))
        );
    }

    #[test]
    fn unresolvable_target_emits_resolve_error() {
        let bus = OutcomeBus::new();
        let rx = bus.subscribe();
        let budgets = Arc::new(Mutex::new(Vec::new()));
        let mut handle = spawn_prober_with(
            "host.invalid.".to_string(),
            1000,
            bus,
            fake_factory(budgets.clone(), false),
        );

        let outcome = rx.recv_timeout(Duration::from_secs(5)).expect("outcome");
        handle.stop();

        assert_eq!(outcome.result, ProbeResult::ResolveError);
        assert_eq!(outcome.sequence, 1);
        assert_eq!(outcome.start_time, outcome.end_time);
        // The transport is never touched while resolution keeps failing.
        assert!(budgets.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_transport_acquisition_terminates_without_outcomes() {
        let bus = OutcomeBus::new();
        let rx = bus.subscribe();
        let mut handle = spawn_prober_with(
            "127.0.0.1".to_string(),
            1000,
            bus,
            || -> Result<FakeTransport, IcmpError> {
                Err(IcmpError::Open(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "denied",
                )))
            },
        );
        handle.stop();

        assert!(rx.try_recv().is_err());
    }
}
