//! Client-facing side of the relay: the HTTP routes, the `/ws` upgrade
//! handler and the WebSocket implementation of `SessionSink`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code, rejection::WebSocketUpgradeRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt, future};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use lib_realtime::{DeliveryError, Identity, SessionError, SessionId, SessionSink};

use crate::realtime_logic::metrics::metrics_handler;
use crate::realtime_logic::state::AppState;

/// Upper bound for sending the close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TimeoutLayer::new(state.read_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// # WebSocket Upgrade Handler
///
/// The credential is checked before upgrading so a rejected client gets a
/// plain HTTP 401 with a JSON body instead of a WebSocket close.
pub async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Query(query): Query<TokenQuery>,
    State(state): State<AppState>,
) -> Response {
    let identity = match state.sessions.authenticate(query.token.as_deref()).await {
        Ok(identity) => identity,
        Err(SessionError::MissingCredential) => return unauthorized("missing token"),
        Err(_) => return unauthorized("invalid token"),
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(user_id = identity.user_id, error = %rejection, "Not a WebSocket upgrade");
            return rejection.into_response();
        }
    };

    ws.on_failed_upgrade(move |e| warn!(user_id = identity.user_id, error = %e, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| handle_socket(socket, identity, state))
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

fn unauthorized(reason: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": reason }))).into_response()
}

async fn handle_socket(socket: WebSocket, identity: Identity, state: AppState) {
    let (writer, reader) = socket.split();
    let closed = CancellationToken::new();
    let sink = Arc::new(WsSink::new(writer, closed.clone(), state.write_timeout));
    info!(session_id = %sink.id(), user_id = identity.user_id, "Client connected");

    // A Close frame from the client ends the session like end-of-stream.
    let inbound = reader.take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))));

    if let Err(e) = state.sessions.run(identity, sink, inbound, closed).await {
        debug!(user_id = identity.user_id, error = %e, "Session failed");
    }
}

/// Write half of an upgraded socket as seen by the hub.
pub struct WsSink {
    id: SessionId,
    writer: Mutex<SplitSink<WebSocket, Message>>,
    closed: CancellationToken,
    close_sent: AtomicBool,
    write_timeout: Duration,
}

impl WsSink {
    pub fn new(writer: SplitSink<WebSocket, Message>, closed: CancellationToken, write_timeout: Duration) -> Self {
        Self {
            id: SessionId::next(),
            writer: Mutex::new(writer),
            closed,
            close_sent: AtomicBool::new(false),
            write_timeout,
        }
    }
}

#[async_trait]
impl SessionSink for WsSink {
    fn id(&self) -> SessionId {
        self.id
    }

    async fn push(&self, payload: &str) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed);
        }

        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(self.write_timeout, writer.send(Message::Text(payload.into()))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DeliveryError::Transport(e.to_string())),
            Err(_) => Err(DeliveryError::Timeout),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut writer = self.writer.lock().await;
        let frame = Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        }));
        let sent = tokio::time::timeout(CLOSE_TIMEOUT, async {
            writer.send(frame).await?;
            writer.close().await
        })
        .await;

        match sent {
            Ok(Ok(())) => debug!(session_id = %self.id, "Close frame sent"),
            Ok(Err(e)) => debug!(session_id = %self.id, error = %e, "Close frame not delivered"),
            Err(_) => debug!(session_id = %self.id, "Close frame timed out"),
        }
    }
}
