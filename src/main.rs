use pinglog::bus::OutcomeBus;
use pinglog::persist::PersistenceQueue;
use pinglog::settings::load_from_cli;
use pinglog::stats::{AggregationView, spawn_aggregator};
use pinglog::store::SqliteStore;
use pinglog::supervisor::ProbeSupervisor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = load_from_cli()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;

    if let Some(dir) = settings.db_path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let store = SqliteStore::open(&settings.db_path)
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    tracing::info!(db = %settings.db_path.display(), "probe log opened");

    let bus = OutcomeBus::new();
    let queue = PersistenceQueue::start(store);
    let queue_status = queue.handle();

    let persist_rx = bus.subscribe();
    let persist_handle = queue.handle();
    let forwarder = thread::spawn(move || {
        for outcome in persist_rx {
            persist_handle.enqueue(outcome);
        }
    });

    let view = Arc::new(AggregationView::new());
    let aggregator = spawn_aggregator(Arc::clone(&view), bus.subscribe());

    let supervisor = ProbeSupervisor::new(bus.clone());
    for target in &settings.targets {
        supervisor.start_probe(target, settings.timeout_ms);
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    if let Err(err) = ctrlc::set_handler(move || flag.store(false, Ordering::Release)) {
        tracing::warn!(error = %err, "ctrl-c handler unavailable");
    }

    let mut last_report = Instant::now();
    while running.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(200));
        if last_report.elapsed() >= settings.report_interval {
            report(&view, &queue);
            last_report = Instant::now();
        }
    }

    tracing::info!("shutting down");
    supervisor.stop_all();
    drop(supervisor);
    drop(bus);
    let _ = forwarder.join();
    let _ = aggregator.join();

    report(&view, &queue);
    queue.shutdown();
    let final_status = queue_status.status();
    tracing::info!(
        generated = final_status.generated,
        written = final_status.written,
        label = %final_status.label,
        "persistence drained"
    );
    Ok(())
}

/// One stats snapshot on stdout, the headless stand-in for a UI consumer.
fn report(view: &AggregationView, queue: &PersistenceQueue) {
    let status = queue.status();
    let payload = serde_json::json!({
        "targets": view.snapshot(),
        "persistence": {
            "generated": status.generated,
            "written": status.written,
            "status": status.label,
        },
    });
    match serde_json::to_string(&payload) {
        Ok(line) => println!("{line}"),
        Err(err) => tracing::warn!(error = %err, "stats snapshot serialization failed"),
    }
}
