use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::ControlCommand;
use crate::config::bind_addr;

/// HTTP endpoint accepting control commands and queueing them for the
/// controller.
pub struct ControlServer {
    addr: String,
    tx: mpsc::Sender<ControlCommand>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl ControlServer {
    pub fn new(addr: &str, tx: mpsc::Sender<ControlCommand>) -> Self {
        Self {
            addr: addr.to_string(),
            tx,
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Starts the HTTP server serving `POST /control`. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_addr(&self.addr, ":8080");

        let app_state = Arc::new(AppState {
            tx: self.tx.clone(),
        });

        let app = Router::new()
            .route("/control", post(control_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "control server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "control server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the control server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    tx: mpsc::Sender<ControlCommand>,
}

/// POST /control - Queue a control command.
async fn control_handler(
    State(state): State<Arc<AppState>>,
    Json(command): Json<ControlCommand>,
) -> impl IntoResponse {
    tracing::debug!(target_host = %command.target, "control command posted");

    match state.tx.try_send(command) {
        Ok(()) => (StatusCode::ACCEPTED, "accepted"),
        Err(TrySendError::Full(_)) => {
            tracing::warn!("control queue full, rejecting command");
            (StatusCode::SERVICE_UNAVAILABLE, "queue full")
        }
        Err(TrySendError::Closed(_)) => (StatusCode::SERVICE_UNAVAILABLE, "controller stopped"),
    }
}
