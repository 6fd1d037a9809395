//! # Realtime Unit Relay
//!
//! Consumes unit state records from a Kafka topic and pushes each one, as it
//! arrives, to every WebSocket client allowed to watch that unit.
//!
//! ## Features:
//! - **Ingestion:** a consumer-group loop hands each message to a worker
//!   for its partition, which decodes it (a record or an array of records)
//!   and fans it out through the subscription hub.
//! - **Sessions:** `GET /ws?token=...` authenticates, resolves the caller's
//!   units, sends their last-known state as one array, then streams live
//!   updates until either side closes.
//! - **Backends:** JWT or static authentication, Postgres or static unit
//!   directory, Redis or static snapshots, all chosen from configuration.
//! - **Lifecycle:** `/health` and Prometheus `/metrics` endpoints, optional
//!   TLS, and a bounded graceful shutdown on SIGINT/SIGTERM.

mod realtime_logic;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use lib_realtime::ingestors::KafkaSource;
use lib_realtime::loggers::setup_logging;
use lib_realtime::{Hub, SessionManager, StreamBridge};

use realtime_logic::collaborators;
use realtime_logic::config::load_config;
use realtime_logic::downstream;
use realtime_logic::metrics::install_recorder;
use realtime_logic::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = load_config().context("Failed to load configuration")?;
    let _log_guard = setup_logging(&config.log_dir(), config.log_level(), "server_realtime")
        .context("Failed to initialize logging")?;

    let addr: SocketAddr = config
        .bind_address()
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.bind_address()))?;
    info!(
        %addr,
        topic = ?config.kafka_topic,
        group_id = ?config.kafka_group_id,
        auth_mode = ?config.auth_mode(),
        "Configuration loaded"
    );

    let tls_config = match config.tls_paths() {
        Some((cert_path, key_path)) => {
            // Both ring and aws-lc-rs may be compiled in; pick one explicitly.
            let _ = rustls::crypto::ring::default_provider().install_default();
            let tls = RustlsConfig::from_pem_file(cert_path, key_path)
                .await
                .context("Failed to load TLS configuration")?;
            Some(tls)
        }
        None => None,
    };

    let metrics = install_recorder()?;
    let hub = Arc::new(Hub::new());
    let backends = collaborators::build(&config).await?;

    let ingest_cancel = CancellationToken::new();
    let bridge = StreamBridge::start(
        KafkaSource::connect(config.kafka_config()),
        Arc::clone(&hub),
        config.bridge_config(),
        ingest_cancel.clone(),
    )
    .await
    .context("Failed to start stream consumer")?;

    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&hub),
        backends.authenticator,
        backends.units,
        backends.snapshots,
    ));
    let app = downstream::router(AppState::new(
        sessions,
        metrics,
        config.read_timeout(),
        config.write_timeout(),
    ));

    let grace = config.shutdown_grace();
    let handle = Handle::new();
    let shutdown_task = tokio::spawn(shutdown_on_signal(
        handle.clone(),
        Arc::clone(&hub),
        ingest_cancel.clone(),
        grace,
    ));

    let served = match tls_config {
        Some(tls) => {
            info!(%addr, "Listening on wss://{}/ws", addr);
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
        None => {
            info!(%addr, "Listening on ws://{}/ws", addr);
            axum_server::bind(addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
    };

    if let Err(e) = served {
        error!(error = %e, "Server failed");
        shutdown_task.abort();
        ingest_cancel.cancel();
        hub.shutdown().await;
        return Err(e).context("HTTP server failed");
    }

    match tokio::time::timeout(grace, bridge).await {
        Ok(Ok(())) => info!("Stream consumer finished"),
        Ok(Err(e)) => warn!(error = %e, "Stream consumer task failed"),
        Err(_) => warn!(grace_seconds = grace.as_secs(), "Stream consumer did not stop within grace period"),
    }

    info!("Server stopped");
    Ok(())
}

/// Waits for a stop signal, then stops ingestion, closes every session and
/// lets in-flight HTTP requests finish within `grace`.
async fn shutdown_on_signal(handle: Handle, hub: Arc<Hub>, ingest_cancel: CancellationToken, grace: Duration) {
    shutdown_signal().await;
    warn!("Shutdown signal received. Closing server gracefully...");

    ingest_cancel.cancel();
    let closed = hub.shutdown().await;
    info!(connections_closed = closed, "Sessions closed");
    handle.graceful_shutdown(Some(grace));
}

/// # Graceful Shutdown Signal Handler
///
/// Resolves on `CTRL+C` or, on Unix, `SIGTERM`. A handler that cannot be
/// installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
