use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::catalog::CounterBudget;
use crate::config::bind_addr;

const NAMESPACE: &str = "pmc_controller";

/// Prometheus metrics for controller health and observability.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Control commands received for this host.
    pub commands_received: Counter,
    /// Commands that left the monitored set unchanged.
    pub commands_ignored: Counter,
    /// Sensor stop/start cycles.
    pub sensor_restarts: Counter,
    /// Time spent stopping and starting the sensor.
    pub sensor_restart_duration: Histogram,
    /// Events left in the selection pool.
    pub pool_remaining: Gauge,
    /// Events in the current monitored set.
    pub monitored_events: Gauge,
    /// Fixed counter slots of the processor.
    pub fixed_slots: Gauge,
    /// General-purpose counter slots of the processor.
    pub general_slots: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let commands_received = Counter::with_opts(
            Opts::new(
                "commands_received_total",
                "Total control commands received for this host.",
            )
            .namespace(NAMESPACE),
        )?;
        let commands_ignored = Counter::with_opts(
            Opts::new(
                "commands_ignored_total",
                "Total control commands that did not change the monitored set.",
            )
            .namespace(NAMESPACE),
        )?;
        let sensor_restarts = Counter::with_opts(
            Opts::new("sensor_restarts_total", "Total sensor restarts.").namespace(NAMESPACE),
        )?;
        let sensor_restart_duration = Histogram::with_opts(
            HistogramOpts::new(
                "sensor_restart_duration_seconds",
                "Time to stop and restart the sensor.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let pool_remaining = Gauge::with_opts(
            Opts::new(
                "pool_remaining",
                "Number of events left in the selection pool.",
            )
            .namespace(NAMESPACE),
        )?;
        let monitored_events = Gauge::with_opts(
            Opts::new(
                "monitored_events",
                "Number of events in the current monitored set.",
            )
            .namespace(NAMESPACE),
        )?;
        let fixed_slots = Gauge::with_opts(
            Opts::new("fixed_slots", "Fixed counter slots of the processor.")
                .namespace(NAMESPACE),
        )?;
        let general_slots = Gauge::with_opts(
            Opts::new(
                "general_slots",
                "General-purpose counter slots of the processor.",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(commands_received.clone()))?;
        registry.register(Box::new(commands_ignored.clone()))?;
        registry.register(Box::new(sensor_restarts.clone()))?;
        registry.register(Box::new(sensor_restart_duration.clone()))?;
        registry.register(Box::new(pool_remaining.clone()))?;
        registry.register(Box::new(monitored_events.clone()))?;
        registry.register(Box::new(fixed_slots.clone()))?;
        registry.register(Box::new(general_slots.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            commands_received,
            commands_ignored,
            sensor_restarts,
            sensor_restart_duration,
            pool_remaining,
            monitored_events,
            fixed_slots,
            general_slots,
        })
    }

    /// Record the processor counter budget.
    pub fn set_budget(&self, budget: CounterBudget) {
        self.fixed_slots.set(budget.fixed_slots as f64);
        self.general_slots.set(budget.general_slots as f64);
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_addr(&self.addr, ":9090");

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

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
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
