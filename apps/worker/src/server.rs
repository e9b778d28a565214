//! Metrics and health listener
//!
//! The worker has no API surface; this listener only exists so the process
//! can be scraped and health-checked.

use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

use crate::metrics;

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
}

/// Serve until `cancel` fires.
pub async fn serve(addr: SocketAddr, cancel: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind metrics listener on {addr}: {e}"))?;

    tracing::info!("Metrics listening on http://{}/metrics", addr);

    axum::serve(listener, router())
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "bulk-worker",
        "unitsInFlight": metrics::UNITS_IN_FLIGHT.get(),
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4; charset=utf-8")],
        metrics::gather_text(),
    )
}
