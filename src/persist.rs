use crate::outcome::ProbeOutcome;
use crate::store::{PersistedRecord, RecordSink};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Records accumulated in the open transaction before a commit.
pub const BATCH_COMMIT_SIZE: usize = 500;

/// Upper bound on how long accepted records may sit uncommitted.
pub const IDLE_FLUSH: Duration = Duration::from_millis(1000);

/// Cumulative write-progress telemetry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub generated: u64,
    pub written: u64,
    pub label: String,
}

#[derive(Default)]
struct PendingState {
    pending: Vec<ProbeOutcome>,
    stopping: bool,
}

struct Shared {
    state: Mutex<PendingState>,
    wake: Condvar,
    generated: AtomicU64,
    written: AtomicU64,
    label: Mutex<String>,
}

impl Shared {
    fn set_label(&self, label: String) {
        *self.label.lock().expect("telemetry lock poisoned") = label;
    }

    fn status(&self) -> QueueStatus {
        QueueStatus {
            generated: self.generated.load(Ordering::Acquire),
            written: self.written.load(Ordering::Acquire),
            label: self.label.lock().expect("telemetry lock poisoned").clone(),
        }
    }
}

/// Producer-side handle, shareable across threads.
#[derive(Clone)]
pub struct QueueHandle {
    shared: Arc<Shared>,
}

impl QueueHandle {
    /// Append an outcome to the pending buffer and wake the writer. Never
    /// performs I/O on the calling thread. Once shutdown has begun the
    /// record is dropped and left out of the counters.
    pub fn enqueue(&self, outcome: ProbeOutcome) {
        let mut state = self.shared.state.lock().expect("queue lock poisoned");
        if state.stopping {
            tracing::warn!(
                target = %outcome.target,
                sequence = outcome.sequence,
                "enqueue after shutdown; record dropped"
            );
            return;
        }
        state.pending.push(outcome);
        self.shared.generated.fetch_add(1, Ordering::AcqRel);
        self.shared.wake.notify_one();
    }

    pub fn status(&self) -> QueueStatus {
        self.shared.status()
    }
}

/// Single-writer persistence pipeline: arbitrary producers enqueue, one
/// dedicated thread drains and commits transactional batches.
pub struct PersistenceQueue {
    shared: Arc<Shared>,
    writer: Option<JoinHandle<()>>,
}

impl PersistenceQueue {
    /// Take ownership of the store and start the writer thread.
    pub fn start<S: RecordSink + 'static>(store: S) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(PendingState::default()),
            wake: Condvar::new(),
            generated: AtomicU64::new(0),
            written: AtomicU64::new(0),
            label: Mutex::new(String::new()),
        });
        let writer_shared = Arc::clone(&shared);
        let writer = thread::spawn(move || run_writer(store, writer_shared));
        Self {
            shared,
            writer: Some(writer),
        }
    }

    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn status(&self) -> QueueStatus {
        self.shared.status()
    }

    /// Stop the writer after it drained and committed everything accepted so
    /// far.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("queue lock poisoned");
            state.stopping = true;
            self.shared.wake.notify_one();
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

impl Drop for PersistenceQueue {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Commit once the open transaction is large enough or old enough.
fn should_commit(open_in_tx: usize, since_last_commit: Duration) -> bool {
    open_in_tx >= BATCH_COMMIT_SIZE || (open_in_tx > 0 && since_last_commit >= IDLE_FLUSH)
}

fn run_writer<S: RecordSink>(store: S, shared: Arc<Shared>) {
    if let Err(err) = store.begin() {
        tracing::error!(error = %err, "persistence writer cannot open a transaction");
        shared.set_label("Error".to_string());
        return;
    }
    let mut open_in_tx = 0usize;
    let mut last_commit = Instant::now();

    loop {
        let batch = {
            let mut state = shared.state.lock().expect("queue lock poisoned");
            if state.stopping && state.pending.is_empty() {
                break;
            }
            if state.pending.is_empty() && !state.stopping {
                let (guard, _) = shared
                    .wake
                    .wait_timeout(state, IDLE_FLUSH)
                    .expect("queue lock poisoned");
                state = guard;
            }
            std::mem::take(&mut state.pending)
        };

        for outcome in &batch {
            match store.insert_record(&PersistedRecord::from_outcome(outcome)) {
                Ok(()) => {
                    shared.written.fetch_add(1, Ordering::AcqRel);
                    open_in_tx += 1;
                    if open_in_tx >= BATCH_COMMIT_SIZE {
                        commit_open(&store, &shared, &mut open_in_tx, &mut last_commit, "Committed");
                    }
                }
                Err(err) => {
                    // Record-level failure skips only that record.
                    tracing::warn!(
                        target = %outcome.target,
                        sequence = outcome.sequence,
                        error = %err,
                        "skipping unwritable record"
                    );
                }
            }
        }

        if should_commit(open_in_tx, last_commit.elapsed()) {
            commit_open(&store, &shared, &mut open_in_tx, &mut last_commit, "Committed");
        } else if open_in_tx > 0 {
            shared.set_label(format!("Writing ({open_in_tx}/{BATCH_COMMIT_SIZE})"));
        }
    }

    if open_in_tx > 0 {
        commit_open(
            &store,
            &shared,
            &mut open_in_tx,
            &mut last_commit,
            "Committed (exit)",
        );
    }
    tracing::debug!(status = ?shared.status(), "persistence writer exited");
}

fn commit_open<S: RecordSink>(
    store: &S,
    shared: &Shared,
    open_in_tx: &mut usize,
    last_commit: &mut Instant,
    label: &str,
) {
    match store.commit() {
        Ok(()) => {
            shared.set_label(label.to_string());
            tracing::debug!(records = *open_in_tx, "batch committed");
        }
        Err(err) => {
            // Only this batch is lost; the counter must not claim its rows.
            tracing::error!(records = *open_in_tx, error = %err, "batch commit failed");
            shared
                .written
                .fetch_sub(*open_in_tx as u64, Ordering::AcqRel);
            shared.set_label("Commit failed".to_string());
            let _ = store.rollback();
        }
    }
    if let Err(err) = store.begin() {
        tracing::error!(error = %err, "cannot reopen transaction; falling back to autocommit");
    }
    *open_in_tx = 0;
    *last_commit = Instant::now();
}
