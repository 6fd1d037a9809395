use std::sync::Arc;
use std::time::Duration;

use lib_realtime::SessionManager;
use metrics_exporter_prometheus::PrometheusHandle;

/// Shared state handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub metrics: PrometheusHandle,
    // Bound for a single frame write to a client
    pub write_timeout: Duration,
    // Bound for answering a plain HTTP request, upgrade included
    pub read_timeout: Duration,
}

impl AppState {
    pub fn new(
        sessions: Arc<SessionManager>,
        metrics: PrometheusHandle,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            metrics,
            write_timeout,
            read_timeout,
        }
    }
}
