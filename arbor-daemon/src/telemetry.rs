//! Tracing setup and Prometheus metrics.

use std::convert::Infallible;
use std::fs::{self, OpenOptions};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use hyper::body::Body;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Request, Response, StatusCode};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber: human-readable stdout plus a JSON
/// file under the log directory.
pub fn init_tracing(filter: &str, log_dir: Option<&Path>) -> Result<()> {
    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));
    if let Some(dir) = log_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        let path = dir.join("arbord.json");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        let _ = FILE_GUARD.set(guard);
        let file_layer = fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_writer(writer)
            .with_filter(EnvFilter::new(filter));
        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry().with(stdout_layer).try_init()?;
    }
    Ok(())
}

/// Counters and gauges the worker publishes.
pub struct WorkerMetrics {
    registry: Registry,
    messages_total: IntCounterVec,
    parse_errors: IntCounter,
    reconnects: IntCounter,
    book_gaps: IntCounter,
    crossed_books: IntCounter,
    dropped_messages: IntCounter,
    sessions_open: IntGauge,
    subscribed_pairs: IntGauge,
    arbitrage_executed: IntCounter,
    arbitrage_failed: IntCounter,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let messages_total = IntCounterVec::new(
            prometheus::Opts::new("arbor_messages_total", "Normalized messages applied"),
            &["venue"],
        )
        .unwrap();
        let parse_errors =
            IntCounter::new("arbor_parse_errors_total", "Malformed frames observed").unwrap();
        let reconnects =
            IntCounter::new("arbor_session_reconnects_total", "Session reconnect count").unwrap();
        let book_gaps =
            IntCounter::new("arbor_book_gaps_total", "Sequence gaps forcing resync").unwrap();
        let crossed_books =
            IntCounter::new("arbor_crossed_books_total", "Crossed-book incidents").unwrap();
        let dropped_messages = IntCounter::new(
            "arbor_subscriber_dropped_total",
            "Messages dropped on saturated subscriber queues",
        )
        .unwrap();
        let sessions_open =
            IntGauge::new("arbor_sessions_open", "Live websocket sessions").unwrap();
        let subscribed_pairs =
            IntGauge::new("arbor_subscribed_pairs", "Pairs currently subscribed").unwrap();
        let arbitrage_executed = IntCounter::new(
            "arbor_arbitrage_executed_total",
            "Arbitrage transactions finished in a Complete state",
        )
        .unwrap();
        let arbitrage_failed = IntCounter::new(
            "arbor_arbitrage_failed_total",
            "Arbitrage transactions finished in Error",
        )
        .unwrap();

        registry.register(Box::new(messages_total.clone())).unwrap();
        registry.register(Box::new(parse_errors.clone())).unwrap();
        registry.register(Box::new(reconnects.clone())).unwrap();
        registry.register(Box::new(book_gaps.clone())).unwrap();
        registry.register(Box::new(crossed_books.clone())).unwrap();
        registry
            .register(Box::new(dropped_messages.clone()))
            .unwrap();
        registry.register(Box::new(sessions_open.clone())).unwrap();
        registry
            .register(Box::new(subscribed_pairs.clone()))
            .unwrap();
        registry
            .register(Box::new(arbitrage_executed.clone()))
            .unwrap();
        registry
            .register(Box::new(arbitrage_failed.clone()))
            .unwrap();

        Self {
            registry,
            messages_total,
            parse_errors,
            reconnects,
            book_gaps,
            crossed_books,
            dropped_messages,
            sessions_open,
            subscribed_pairs,
            arbitrage_executed,
            arbitrage_failed,
        }
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub fn inc_message(&self, venue: &str) {
        self.messages_total.with_label_values(&[venue]).inc();
    }

    pub fn inc_parse_error(&self) {
        self.parse_errors.inc();
    }

    pub fn inc_reconnect(&self) {
        self.reconnects.inc();
    }

    pub fn set_book_counters(&self, gaps: u64, crossed: u64, dropped: u64) {
        // Counters only move forward; reconcile against the absolute
        // values the book store reports.
        let current = self.book_gaps.get();
        if gaps > current {
            self.book_gaps.inc_by(gaps - current);
        }
        let current = self.crossed_books.get();
        if crossed > current {
            self.crossed_books.inc_by(crossed - current);
        }
        let current = self.dropped_messages.get();
        if dropped > current {
            self.dropped_messages.inc_by(dropped - current);
        }
    }

    pub fn set_sessions(&self, open: usize, pairs: usize) {
        self.sessions_open.set(open as i64);
        self.subscribed_pairs.set(pairs as i64);
    }

    pub fn inc_arbitrage_executed(&self) {
        self.arbitrage_executed.inc();
    }

    pub fn inc_arbitrage_failed(&self) {
        self.arbitrage_failed.inc();
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serve the registry over HTTP for scrapes.
pub fn spawn_metrics_server(registry: Registry, addr: SocketAddr) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let make_svc = make_service_fn(move |_| {
            let registry = registry.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |_req: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
                            error!(error = %err, "failed to encode metrics");
                            return Ok::<_, Infallible>(
                                Response::builder()
                                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                                    .body(Body::from("failed to encode metrics"))
                                    .unwrap(),
                            );
                        }
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", encoder.format_type())
                                .body(Body::from(buffer))
                                .unwrap(),
                        )
                    }
                }))
            }
        });
        if let Err(err) = hyper::Server::bind(&addr).serve(make_svc).await {
            error!(error = %err, %addr, "metrics server terminated");
        } else {
            info!(%addr, "metrics server shutdown");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn book_counters_only_advance() {
        let metrics = WorkerMetrics::new();
        metrics.set_book_counters(3, 1, 10);
        metrics.set_book_counters(2, 1, 5);
        metrics.set_book_counters(4, 2, 12);
        let gathered = metrics.registry().gather();
        let gaps = gathered
            .iter()
            .find(|family| family.get_name() == "arbor_book_gaps_total")
            .unwrap();
        assert_eq!(gaps.get_metric()[0].get_counter().get_value(), 4.0);
    }
}
