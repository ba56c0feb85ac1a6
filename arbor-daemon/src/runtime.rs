//! Component wiring and worker lifecycle.
//!
//! Startup order matters: catalog first (everything depends on it),
//! then presence registration, then the data plane, then role
//! components. Shutdown walks the same order in reverse under a grace
//! deadline.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use arbor_book::BookStore;
use arbor_catalog::{
    ArbitrageRepo, CatalogStore, HistoryLogger, HistoryLoggerConfig, WorkerRepo,
};
use arbor_core::{BookKey, WorkerRole, WorkerStatus};
use arbor_monitor::{BookRecorder, ColumnarSink, SinkConfig};
use arbor_stream::{PoolConfig, SessionEvent, SessionPool};
use arbor_tasks::{SubscriptionController, TaskFetcher};
use arbor_trader::{
    ArbitrageCoordinator, BboPlanner, CoordinatorConfig, GatewayCredentials, RestOrderGateway,
    RouterGateway,
};

use crate::config::DaemonConfig;
use crate::state::RunState;
use crate::telemetry::WorkerMetrics;

const MONITOR_SUBSCRIBER_ID: &str = "monitor-recorder";

/// In-process status snapshot, reported in logs at shutdown.
pub struct WorkerStatusReport {
    started_at: Instant,
}

impl WorkerStatusReport {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn uptime(&self) -> String {
        format_uptime(self.started_at.elapsed())
    }
}

pub(crate) fn format_uptime(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m {seconds}s")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// `hostname-pid`, the worker's identity in DAEMON_STATE.
pub fn worker_name() -> String {
    let hostname = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|name| name.trim().to_string())
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{hostname}-{}", std::process::id())
}

fn open_catalog(config: &DaemonConfig) -> Result<Arc<CatalogStore>> {
    if let Some(dir) = config.catalog.path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let mut attempt = 0;
    loop {
        attempt += 1;
        match CatalogStore::open(&config.catalog.path).and_then(|store| {
            store.set_busy_timeout(Duration::from_secs(config.catalog.connect_timeout_sec))?;
            store.ping()?;
            Ok(store)
        }) {
            Ok(store) => return Ok(Arc::new(store)),
            Err(err) if attempt <= config.catalog.max_retries => {
                warn!(attempt, error = %err, "catalog open failed; retrying");
                std::thread::sleep(Duration::from_secs(1));
            }
            Err(err) => {
                return Err(anyhow!(err)).context("catalog unavailable after retries");
            }
        }
    }
}

fn build_router(config: &DaemonConfig) -> Result<RouterGateway> {
    let mut router = RouterGateway::new();
    for (name, venue_config) in &config.venues {
        let venue = name
            .parse()
            .map_err(|err: String| anyhow!("bad venue '{name}' in config: {err}"))?;
        let gateway = RestOrderGateway::new(
            venue_config.rest_url.clone(),
            GatewayCredentials {
                api_key: venue_config.api_key.clone(),
                api_secret: venue_config.api_secret.clone(),
            },
        )
        .map_err(|err| anyhow!("failed to build gateway for '{name}': {err}"))?;
        router.register(venue, Arc::new(gateway));
    }
    Ok(router)
}

/// Run the worker to completion. An error here means init failed and
/// the process exits 1.
pub async fn run(config: DaemonConfig) -> Result<()> {
    let role = config.worker_role()?;
    let name = worker_name();

    // Catalog first: everything else depends on it. Failure here is
    // fatal to the worker.
    let store = open_catalog(&config)?;
    let worker = WorkerRepo::new(store.clone(), name.clone());
    worker.register(role).context("worker registration failed")?;

    match run_registered(config, role, name, store, worker.clone()).await {
        Ok(()) => Ok(()),
        Err(err) => {
            // Leave the failure on the presence row so peers and
            // operators can see why this worker died.
            let _ = worker.set_error(&format!("{err:#}"));
            Err(err)
        }
    }
}

async fn run_registered(
    config: DaemonConfig,
    role: WorkerRole,
    name: String,
    store: Arc<CatalogStore>,
    worker: WorkerRepo,
) -> Result<()> {
    let status_report = WorkerStatusReport::new();
    let metrics = Arc::new(WorkerMetrics::new());

    let mut run_state = RunState::load(config.state_file.clone());
    if run_state.was_running() {
        info!("previous instance did not stop cleanly; resuming");
    }

    let root = CancellationToken::new();
    let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
    handles.push((
        "heartbeat",
        tokio::spawn(worker.clone().heartbeat_loop(root.child_token())),
    ));

    // Data plane: book store, session pool, task plane.
    let (books, mut resync_rx) = BookStore::new();
    let pool_config = PoolConfig {
        max_pairs_per_session: config.stream.max_pairs_per_session,
        close_grace: Duration::from_secs(config.stream.close_grace_sec),
        ..PoolConfig::default()
    };
    let (pool, mut out_rx, mut events_rx) = SessionPool::new(pool_config, root.child_token());
    let fetcher = Arc::new(TaskFetcher::new(store.clone()));
    let controller = Arc::new(SubscriptionController::new(pool.clone()));

    // Applier: the single writer over the book map.
    {
        let books = books.clone();
        let metrics = metrics.clone();
        let cancel = root.child_token();
        handles.push((
            "applier",
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        message = out_rx.recv() => {
                            let Some(message) = message else { return };
                            metrics.inc_message(message.header.venue.as_str());
                            books.apply(message);
                        }
                    }
                }
            }),
        ));
    }

    // Resync routing: book store findings drive session snapshot loads.
    {
        let pool = pool.clone();
        let cancel = root.child_token();
        handles.push((
            "resync-router",
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        request = resync_rx.recv() => {
                            let Some(request) = request else { return };
                            pool.resync(&request.key);
                        }
                    }
                }
            }),
        ));
    }

    // Session lifecycle telemetry.
    {
        let metrics = metrics.clone();
        let cancel = root.child_token();
        handles.push((
            "session-events",
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        event = events_rx.recv() => {
                            let Some(event) = event else { return };
                            match event {
                                SessionEvent::Disconnected { venue, market, reason, .. } => {
                                    metrics.inc_reconnect();
                                    warn!(%venue, %market, reason, "session dropped");
                                }
                                SessionEvent::Connected { venue, market, session_id } => {
                                    info!(%venue, %market, session = session_id, "session up");
                                }
                                SessionEvent::Resynced { venue, market, pair } => {
                                    info!(%venue, %market, %pair, "pair resynced");
                                }
                            }
                        }
                    }
                }
            }),
        ));
    }

    // Monitor role: columnar sink fed by a book-store subscriber.
    let mut monitor_sink = None;
    let recorder = if role.runs_monitor() {
        let sink = ColumnarSink::spawn(SinkConfig {
            root: config.sink.root.clone(),
            max_buffered_rows: config.sink.batch_size,
            flush_interval: Duration::from_secs(config.sink.batch_interval_sec),
            ..SinkConfig::default()
        })
        .await
        .context("failed to start columnar sink")?;
        let recorder = Arc::new(BookRecorder::new(
            MONITOR_SUBSCRIBER_ID,
            sink.handle(),
            10_000,
        ));
        monitor_sink = Some(sink);
        Some(recorder)
    } else {
        None
    };

    // Reconciliation loop: poll tasks, diff, drive the pool, and keep
    // the monitor recorder's per-key registrations in step.
    {
        let fetcher = fetcher.clone();
        let controller = controller.clone();
        let books = books.clone();
        let worker = worker.clone();
        let recorder = recorder.clone();
        let cancel = root.child_token();
        let poll = Duration::from_secs(config.intervals.task_poll_sec.max(1));
        handles.push((
            "reconciler",
            tokio::spawn(async move {
                let mut monitored: HashSet<BookKey> = HashSet::new();
                let mut ticker = interval(poll);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {
                            let snapshot = match fetcher.fetch() {
                                Ok(snapshot) => snapshot,
                                Err(err) => {
                                    warn!(error = %err, "task poll failed; keeping previous snapshot");
                                    continue;
                                }
                            };
                            let diff = controller.merge(&snapshot);
                            controller.apply(&diff);

                            if let Some(recorder) = &recorder {
                                for entry in &diff.unsubscribe {
                                    for pair in &entry.pairs {
                                        let key = BookKey::new(entry.venue, entry.market, pair.clone());
                                        if monitored.remove(&key) {
                                            books.unsubscribe(&key, MONITOR_SUBSCRIBER_ID);
                                            books.remove(&key);
                                            recorder.forget(&key);
                                        }
                                    }
                                }
                                for entry in &diff.subscribe {
                                    for pair in &entry.pairs {
                                        let key = BookKey::new(entry.venue, entry.market, pair.clone());
                                        if monitored.insert(key.clone()) {
                                            books.subscribe(key, recorder.clone());
                                        }
                                    }
                                }
                            }

                            let monitor_id = snapshot.monitor_tasks.first().map(|task| task.id);
                            let trade_id = snapshot.trade_tasks.first().map(|task| task.id);
                            if let Err(err) = worker.set_active_configs(monitor_id, trade_id) {
                                warn!(error = %err, "failed to record active configs");
                            }
                        }
                    }
                }
            }),
        ));
    }

    // Trader role: history logger, gateway router, coordinator.
    let history = HistoryLogger::new(store.clone(), HistoryLoggerConfig::default());
    if role.runs_trader() {
        handles.push((
            "history-flusher",
            tokio::spawn(history.clone().run(root.child_token())),
        ));

        let router = build_router(&config)?;
        let coordinator = Arc::new(ArbitrageCoordinator::new(
            ArbitrageRepo::new(store.clone()),
            history.clone(),
            Arc::new(router),
            Arc::new(BboPlanner::new(books.clone())),
            fetcher.clone(),
            CoordinatorConfig {
                poll_interval: Duration::from_secs(config.intervals.arbitrage_poll_sec.max(1)),
                heartbeat_timeout_sec: config.intervals.heartbeat_timeout_sec,
                ..CoordinatorConfig::default()
            },
        ));
        // Recovery before the first poll: orphaned InProgress rows of
        // dead workers land in Suspend.
        coordinator
            .recover()
            .context("arbitrage recovery failed")?;
        handles.push((
            "arbitrage-coordinator",
            tokio::spawn(coordinator.run(root.child_token())),
        ));
    }

    // Periodic gauge refresh from pool and store counters.
    {
        let pool = pool.clone();
        let books = books.clone();
        let metrics = metrics.clone();
        let cancel = root.child_token();
        handles.push((
            "stats",
            tokio::spawn(async move {
                let mut ticker = interval(Duration::from_secs(10));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {
                            metrics.set_sessions(pool.session_count(), pool.total_pairs());
                            let stats = books.stats();
                            metrics.set_book_counters(stats.gaps, stats.crossed, stats.dropped_messages);
                        }
                    }
                }
            }),
        ));
    }

    if config.metrics.enabled {
        let addr: SocketAddr = config
            .metrics
            .addr
            .parse()
            .with_context(|| format!("bad metrics address '{}'", config.metrics.addr))?;
        crate::telemetry::spawn_metrics_server(metrics.registry(), addr);
    }

    run_state.set_running(true)?;
    worker.set_status(WorkerStatus::Running)?;
    info!(worker = name, role = role.as_str(), "worker running");

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    // Teardown in reverse dependency order under the grace deadline.
    worker.set_status(WorkerStatus::Stopping)?;
    root.cancel();
    let grace = Duration::from_secs(config.intervals.shutdown_grace_sec);
    let deadline = Instant::now() + grace;
    for (label, handle) in handles.into_iter().rev() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, handle).await {
            Ok(_) => {}
            Err(_) => {
                error!(task = label, "task exceeded shutdown grace; abandoning it");
            }
        }
    }
    pool.close_all();
    if let Some(sink) = monitor_sink {
        if let Err(err) = sink.shutdown().await {
            warn!(error = %err, "columnar sink flush failed during shutdown");
        }
    }
    if let Err(err) = history.flush() {
        warn!(error = %err, pending = history.pending(), "final history flush failed");
    }
    run_state.set_running(false)?;
    worker.mark_stopped()?;
    info!(uptime = status_report.uptime(), "shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_formats_by_magnitude() {
        assert_eq!(format_uptime(Duration::from_secs(42)), "42s");
        assert_eq!(format_uptime(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_uptime(Duration::from_secs(3_725)), "1h 2m 5s");
        assert_eq!(format_uptime(Duration::from_secs(90_061)), "1d 1h 1m 1s");
    }

    #[test]
    fn worker_name_embeds_pid() {
        let name = worker_name();
        assert!(name.ends_with(&std::process::id().to_string()));
        assert!(name.contains('-'));
    }
}
