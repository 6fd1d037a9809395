//! Prometheus recorder and the `/metrics` endpoint.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::realtime_logic::state::AppState;

/// Installs the process-wide Prometheus recorder.
///
/// Call once at startup, before the hub or the bridge record anything.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;
    info!("Prometheus metrics recorder installed");
    Ok(handle)
}

pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
