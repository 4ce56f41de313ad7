use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for daemon health and observability. These describe
/// the pipeline process itself, not the metrics the pipeline computes.
///
/// All metrics use the "metricsd" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total events received by the processor.
    pub events_received: Counter,
    /// Events dropped so far by source filters or invalid managers.
    pub events_dropped: Gauge,
    /// Number of managers currently installed.
    pub managers_installed: Gauge,
    /// Number of managers currently in the active state.
    pub managers_active: Gauge,
    /// Total buckets finalized across all producers.
    pub buckets_finalized: Counter,
    /// Total anomalies fired.
    pub anomalies_fired: Counter,
    /// Total pulls served from cache.
    pub pull_cache_hits: Counter,
    /// Total dump reports produced.
    pub reports_dumped: Counter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = Counter::with_opts(
            Opts::new(
                "events_received_total",
                "Total events received by the processor.",
            )
            .namespace("metricsd"),
        )?;
        let events_dropped = Gauge::with_opts(
            Opts::new(
                "events_dropped",
                "Events dropped so far by source filters or invalid managers.",
            )
            .namespace("metricsd"),
        )?;
        let managers_installed = Gauge::with_opts(
            Opts::new("managers_installed", "Number of managers installed.")
                .namespace("metricsd"),
        )?;
        let managers_active = Gauge::with_opts(
            Opts::new(
                "managers_active",
                "Number of managers in the active state.",
            )
            .namespace("metricsd"),
        )?;
        let buckets_finalized = Counter::with_opts(
            Opts::new(
                "buckets_finalized_total",
                "Total buckets finalized across all producers.",
            )
            .namespace("metricsd"),
        )?;
        let anomalies_fired = Counter::with_opts(
            Opts::new("anomalies_fired_total", "Total anomalies fired.").namespace("metricsd"),
        )?;
        let pull_cache_hits = Counter::with_opts(
            Opts::new("pull_cache_hits_total", "Total pulls served from cache.")
                .namespace("metricsd"),
        )?;
        let reports_dumped = Counter::with_opts(
            Opts::new("reports_dumped_total", "Total dump reports produced.")
                .namespace("metricsd"),
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(managers_installed.clone()))?;
        registry.register(Box::new(managers_active.clone()))?;
        registry.register(Box::new(buckets_finalized.clone()))?;
        registry.register(Box::new(anomalies_fired.clone()))?;
        registry.register(Box::new(pull_cache_hits.clone()))?;
        registry.register(Box::new(reports_dumped.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_dropped,
            managers_installed,
            managers_active,
            buckets_finalized,
            anomalies_fired,
            pull_cache_hits,
            reports_dumped,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
