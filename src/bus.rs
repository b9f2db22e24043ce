use crate::outcome::ProbeOutcome;
use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, Mutex};

/// Fan-out of probe outcomes to every live subscriber.
///
/// Delivery uses unbounded channels, so a publishing prober is never delayed
/// by a slow consumer. Subscribers registered after an outcome was published
/// do not see it. Publishing holds the subscriber lock, which keeps the
/// per-publisher delivery order identical across all subscribers.
#[derive(Clone, Default)]
pub struct OutcomeBus {
    subscribers: Arc<Mutex<Vec<Sender<ProbeOutcome>>>>,
}

impl OutcomeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ProbeOutcome> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers
            .lock()
            .expect("bus subscriber lock poisoned")
            .push(tx);
        rx
    }

    pub fn publish(&self, outcome: ProbeOutcome) {
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("bus subscriber lock poisoned");
        // Dropped receivers are pruned on the fly.
        subscribers.retain(|tx| tx.send(outcome.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("bus subscriber lock poisoned")
            .len()
    }
}
