//! # Connection Session
//!
//! Drives one client connection from credential to teardown:
//!
//! ```text
//! Connecting -> Authenticating -> Authorized -> Subscribed -> Streaming -> Closed
//!                      \-> Rejected
//! ```
//!
//! The HTTP layer calls [`SessionManager::authenticate`] before upgrading
//! and [`SessionManager::run`] with the upgraded transport. `run` owns the
//! `Closed` step: whatever happens in between (unit lookup failure, client
//! close, hub-initiated close, a panic) the session is unsubscribed and its
//! sink closed before `run` returns.
//!
//! Live updates that reach a session while its snapshot is still being
//! fetched are held back and flushed right after the snapshot, so the
//! client always sees the snapshot first.

use std::any::Any;
use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::{FutureExt, Stream, StreamExt};
use metrics::{counter, gauge};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::core::hub::Hub;
use crate::core::sink::{DeliveryError, SessionId, SessionSink};
use crate::directory::{Authenticator, DirectoryError, Identity, SnapshotStore, UnitDirectory};
use crate::metrics::{SESSIONS_CONNECTED, SESSIONS_TOTAL};

/// Lifecycle position of a session, carried in log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Authorized,
    Subscribed,
    Streaming,
    Closed,
    Rejected,
}

/// Why a session that got past authentication ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The user owns no units; nothing to stream.
    NoUnits,
    /// The client closed the connection.
    ClientClosed,
    /// Reading from the client failed.
    ReadError(String),
    /// The transport was closed from our side (hub reap or shutdown).
    ClosedByHub,
    /// The initial payload could not be written.
    DeliveryFailed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("missing credential")]
    MissingCredential,
    #[error("invalid credential: {0}")]
    InvalidCredential(#[source] DirectoryError),
    #[error("unit lookup failed: {0}")]
    UnitLookup(#[source] DirectoryError),
    #[error("session task panicked: {0}")]
    Panicked(String),
}

/// # Session Manager
///
/// Connection use-case shared by every handler. Cheap to share behind an
/// `Arc`; holds no per-connection state.
pub struct SessionManager {
    hub: Arc<Hub>,
    authenticator: Arc<dyn Authenticator>,
    units: Arc<dyn UnitDirectory>,
    snapshots: Arc<dyn SnapshotStore>,
}

impl SessionManager {
    pub fn new(
        hub: Arc<Hub>,
        authenticator: Arc<dyn Authenticator>,
        units: Arc<dyn UnitDirectory>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            hub,
            authenticator,
            units,
            snapshots,
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// `Connecting -> Authenticating -> Authorized | Rejected`.
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Identity, SessionError> {
        trace!(state = ?SessionState::Connecting, "Connection request");
        let credential = match credential.map(str::trim) {
            Some(c) if !c.is_empty() => c,
            _ => {
                debug!(state = ?SessionState::Rejected, "Connection without credential");
                return Err(SessionError::MissingCredential);
            }
        };

        debug!(state = ?SessionState::Authenticating, "Validating credential");
        match self.authenticator.validate(credential).await {
            Ok(identity) => {
                debug!(state = ?SessionState::Authorized, user_id = identity.user_id, "Credential accepted");
                Ok(identity)
            }
            Err(e) => {
                info!(state = ?SessionState::Rejected, error = %e, "Credential rejected");
                Err(SessionError::InvalidCredential(e))
            }
        }
    }

    /// Runs an upgraded connection until it closes.
    ///
    /// `inbound` yields whatever the client sends; items are only used as a
    /// liveness signal. `closed` must be cancelled by `sink.close()` so a
    /// close issued by the hub unblocks the read loop.
    pub async fn run<S, T, E>(
        &self,
        identity: Identity,
        sink: Arc<dyn SessionSink>,
        inbound: S,
        closed: CancellationToken,
    ) -> Result<SessionEnd, SessionError>
    where
        S: Stream<Item = Result<T, E>> + Unpin + Send,
        T: Send,
        E: Display + Send,
    {
        let session_id = sink.id();
        let staged = Arc::new(StagedSink::new(Arc::clone(&sink)));
        counter!(SESSIONS_TOTAL).increment(1);
        gauge!(SESSIONS_CONNECTED).increment(1.0);

        let outcome = AssertUnwindSafe(self.stream_units(identity, &staged, inbound, &closed))
            .catch_unwind()
            .await;

        self.hub.unsubscribe(session_id).await;
        sink.close().await;
        gauge!(SESSIONS_CONNECTED).decrement(1.0);

        let result = outcome.unwrap_or_else(|panic| Err(SessionError::Panicked(panic_message(panic))));
        match &result {
            Ok(end) => info!(
                state = ?SessionState::Closed,
                session_id = %session_id,
                user_id = identity.user_id,
                end = ?end,
                "Session closed"
            ),
            Err(e) => warn!(
                state = ?SessionState::Closed,
                session_id = %session_id,
                user_id = identity.user_id,
                error = %e,
                "Session ended with error"
            ),
        }
        result
    }

    async fn stream_units<S, T, E>(
        &self,
        identity: Identity,
        sink: &Arc<StagedSink>,
        mut inbound: S,
        closed: &CancellationToken,
    ) -> Result<SessionEnd, SessionError>
    where
        S: Stream<Item = Result<T, E>> + Unpin + Send,
        T: Send,
        E: Display + Send,
    {
        let session_id = sink.id();
        let unit_ids = self
            .units
            .units_for(identity.user_id)
            .await
            .map_err(SessionError::UnitLookup)?;

        if unit_ids.is_empty() {
            info!(user_id = identity.user_id, "No units found for user");
            return Ok(SessionEnd::NoUnits);
        }

        let registered: Arc<dyn SessionSink> = sink.clone();
        if !self.hub.subscribe(registered, &unit_ids).await {
            return Ok(SessionEnd::ClosedByHub);
        }
        debug!(state = ?SessionState::Subscribed, session_id = %session_id, "Fetching snapshot");

        match self.snapshots.last_known(&unit_ids).await {
            Ok(records) if !records.is_empty() => match serde_json::to_string(&records) {
                Ok(payload) => {
                    if let Err(e) = sink.inner.push(&payload).await {
                        warn!(session_id = %session_id, error = %e, "Failed to send snapshot");
                        return Ok(SessionEnd::DeliveryFailed);
                    }
                    debug!(session_id = %session_id, records = records.len(), "Snapshot sent");
                }
                Err(e) => warn!(session_id = %session_id, error = %e, "Failed to serialize snapshot"),
            },
            Ok(_) => debug!(session_id = %session_id, "No snapshot data"),
            Err(e) => warn!(session_id = %session_id, error = %e, "Snapshot lookup failed"),
        }

        if let Err(e) = sink.release().await {
            warn!(session_id = %session_id, error = %e, "Failed to flush held updates");
            return Ok(SessionEnd::DeliveryFailed);
        }

        debug!(state = ?SessionState::Streaming, session_id = %session_id, "Streaming");
        loop {
            tokio::select! {
                biased;
                _ = closed.cancelled() => return Ok(SessionEnd::ClosedByHub),
                next = inbound.next() => match next {
                    Some(Ok(_)) => trace!(session_id = %session_id, "Inbound message ignored"),
                    Some(Err(e)) => return Ok(SessionEnd::ReadError(e.to_string())),
                    None => return Ok(SessionEnd::ClientClosed),
                },
            }
        }
    }
}

/// Sink registered with the hub on behalf of a session. Until `release` is
/// called it queues pushes instead of writing them.
struct StagedSink {
    inner: Arc<dyn SessionSink>,
    held: Mutex<Option<Vec<String>>>,
}

impl StagedSink {
    fn new(inner: Arc<dyn SessionSink>) -> Self {
        Self {
            inner,
            held: Mutex::new(Some(Vec::new())),
        }
    }

    /// Writes everything held so far, then switches to direct pushes.
    async fn release(&self) -> Result<(), DeliveryError> {
        loop {
            let batch = {
                let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
                match held.as_mut() {
                    Some(queue) if !queue.is_empty() => std::mem::take(queue),
                    _ => {
                        *held = None;
                        return Ok(());
                    }
                }
            };
            for payload in batch {
                self.inner.push(&payload).await?;
            }
        }
    }
}

#[async_trait]
impl SessionSink for StagedSink {
    fn id(&self) -> SessionId {
        self.inner.id()
    }

    async fn push(&self, payload: &str) -> Result<(), DeliveryError> {
        {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(queue) = held.as_mut() {
                queue.push(payload.to_string());
                return Ok(());
            }
        }
        self.inner.push(payload).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{StaticAuthenticator, StaticSnapshotStore, StaticUnitDirectory, UserId};
    use crate::models::{Record, UnitId};
    use crate::test_support::TestSink;
    use futures_channel::mpsc;
    use std::collections::HashMap;
    use tokio::sync::Notify;

    struct FailingSnapshots;

    #[async_trait]
    impl SnapshotStore for FailingSnapshots {
        async fn last_known(&self, _: &[UnitId]) -> Result<Vec<Record>, DirectoryError> {
            Err(DirectoryError::Backend("redis down".into()))
        }
    }

    struct FailingUnits;

    #[async_trait]
    impl UnitDirectory for FailingUnits {
        async fn units_for(&self, _: UserId) -> Result<Vec<UnitId>, DirectoryError> {
            Err(DirectoryError::Backend("db down".into()))
        }
    }

    /// Blocks inside `last_known` until the test lets it go.
    struct GatedSnapshots {
        entered: Notify,
        proceed: Notify,
    }

    #[async_trait]
    impl SnapshotStore for GatedSnapshots {
        async fn last_known(&self, unit_ids: &[UnitId]) -> Result<Vec<Record>, DirectoryError> {
            self.entered.notify_one();
            self.proceed.notified().await;
            Ok(unit_ids.iter().map(|id| Record::new(*id)).collect())
        }
    }

    struct PanickingSnapshots;

    #[async_trait]
    impl SnapshotStore for PanickingSnapshots {
        async fn last_known(&self, _: &[UnitId]) -> Result<Vec<Record>, DirectoryError> {
            panic!("snapshot decoder blew up");
        }
    }

    fn manager(units: Arc<dyn UnitDirectory>, snapshots: Arc<dyn SnapshotStore>) -> SessionManager {
        SessionManager::new(
            Arc::new(Hub::new()),
            Arc::new(StaticAuthenticator::default()),
            units,
            snapshots,
        )
    }

    fn default_manager() -> SessionManager {
        manager(
            Arc::new(StaticUnitDirectory::default()),
            Arc::new(StaticSnapshotStore::default()),
        )
    }

    async fn wait_until_subscribed(hub: &Hub, unit_id: UnitId) {
        for _ in 0..200 {
            if hub.session_count(unit_id).await > 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("session never subscribed to {}", unit_id);
    }

    #[tokio::test]
    async fn missing_or_blank_credential_is_rejected() {
        let manager = default_manager();
        assert!(matches!(manager.authenticate(None).await, Err(SessionError::MissingCredential)));
        assert!(matches!(manager.authenticate(Some("")).await, Err(SessionError::MissingCredential)));
        assert_eq!(manager.authenticate(Some("token")).await.unwrap().user_id, 1);
    }

    #[tokio::test]
    async fn snapshot_then_live_then_cleanup_on_client_close() {
        let manager = Arc::new(default_manager());
        let sink = TestSink::new();
        let (tx, rx) = mpsc::unbounded::<Result<(), String>>();

        let task = {
            let manager = Arc::clone(&manager);
            let sink = sink.clone();
            let closed = sink.token();
            tokio::spawn(async move { manager.run(Identity { user_id: 1 }, sink, rx, closed).await })
        };

        wait_until_subscribed(manager.hub(), 586).await;
        // let the session get past the snapshot step
        tx.unbounded_send(Ok(())).unwrap();
        while sink.received().is_empty() {
            tokio::task::yield_now().await;
        }

        manager.hub().broadcast(586, &Record::new(586)).await;
        drop(tx);

        assert_eq!(task.await.unwrap().unwrap(), SessionEnd::ClientClosed);

        let received = sink.received();
        let snapshot: Vec<Record> = serde_json::from_str(&received[0]).unwrap();
        assert_eq!(snapshot.iter().map(|r| r.unit_id).collect::<Vec<_>>(), vec![586, 102, 103]);
        let live: Record = serde_json::from_str(&received[1]).unwrap();
        assert_eq!(live.unit_id, 586);

        assert_eq!(manager.hub().unit_count().await, 0);
        assert!(sink.was_closed());
    }

    #[tokio::test]
    async fn user_without_units_ends_gracefully() {
        let manager = manager(
            Arc::new(StaticUnitDirectory::per_user(HashMap::new())),
            Arc::new(StaticSnapshotStore::default()),
        );
        let sink = TestSink::new();
        let (_tx, rx) = mpsc::unbounded::<Result<(), String>>();

        let end = manager
            .run(Identity { user_id: 9 }, sink.clone(), rx, sink.token())
            .await
            .unwrap();

        assert_eq!(end, SessionEnd::NoUnits);
        assert!(sink.received().is_empty());
        assert!(sink.was_closed());
        assert_eq!(manager.hub().unit_count().await, 0);
    }

    #[tokio::test]
    async fn unit_lookup_failure_aborts_before_subscribe() {
        let manager = manager(Arc::new(FailingUnits), Arc::new(StaticSnapshotStore::default()));
        let sink = TestSink::new();
        let (_tx, rx) = mpsc::unbounded::<Result<(), String>>();

        let result = manager
            .run(Identity { user_id: 1 }, sink.clone(), rx, sink.token())
            .await;

        assert!(matches!(result, Err(SessionError::UnitLookup(_))));
        assert_eq!(manager.hub().unit_count().await, 0);
        assert!(sink.was_closed());
    }

    #[tokio::test]
    async fn snapshot_failure_still_streams() {
        let manager = Arc::new(manager(
            Arc::new(StaticUnitDirectory::uniform(vec![5])),
            Arc::new(FailingSnapshots),
        ));
        let sink = TestSink::new();
        let (tx, rx) = mpsc::unbounded::<Result<(), String>>();

        let task = {
            let manager = Arc::clone(&manager);
            let sink = sink.clone();
            let closed = sink.token();
            tokio::spawn(async move { manager.run(Identity { user_id: 1 }, sink, rx, closed).await })
        };

        wait_until_subscribed(manager.hub(), 5).await;
        // an inbound round-trip guarantees the session reached the read loop
        tx.unbounded_send(Ok(())).unwrap();
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.hub().broadcast(5, &Record::new(5)).await, 1);
        tx.unbounded_send(Err("reset by peer".into())).unwrap();

        assert_eq!(
            task.await.unwrap().unwrap(),
            SessionEnd::ReadError("reset by peer".into())
        );
        let received = sink.received();
        assert_eq!(received.len(), 1);
        assert_eq!(serde_json::from_str::<Record>(&received[0]).unwrap().unit_id, 5);
    }

    #[tokio::test]
    async fn updates_during_snapshot_fetch_follow_the_snapshot() {
        let snapshots = Arc::new(GatedSnapshots {
            entered: Notify::new(),
            proceed: Notify::new(),
        });
        let manager = Arc::new(manager(
            Arc::new(StaticUnitDirectory::uniform(vec![586])),
            snapshots.clone(),
        ));
        let sink = TestSink::new();
        let (_tx, rx) = mpsc::unbounded::<Result<(), String>>();

        let task = {
            let manager = Arc::clone(&manager);
            let sink = sink.clone();
            let closed = sink.token();
            tokio::spawn(async move { manager.run(Identity { user_id: 1 }, sink, rx, closed).await })
        };

        snapshots.entered.notified().await;
        let mut live = Record::new(586);
        live.record_type = 2;
        assert_eq!(manager.hub().broadcast(586, &live).await, 1);
        assert!(sink.received().is_empty());

        snapshots.proceed.notify_one();
        while sink.received().len() < 2 {
            tokio::task::yield_now().await;
        }

        let received = sink.received();
        assert!(received[0].starts_with('['));
        assert_eq!(serde_json::from_str::<Record>(&received[1]).unwrap(), live);

        manager.hub().shutdown().await;
        assert_eq!(task.await.unwrap().unwrap(), SessionEnd::ClosedByHub);
    }

    #[tokio::test]
    async fn hub_shutdown_unblocks_the_read_loop() {
        let manager = Arc::new(default_manager());
        let sink = TestSink::new();
        let (_tx, rx) = mpsc::unbounded::<Result<(), String>>();

        let task = {
            let manager = Arc::clone(&manager);
            let sink = sink.clone();
            let closed = sink.token();
            tokio::spawn(async move { manager.run(Identity { user_id: 1 }, sink, rx, closed).await })
        };

        wait_until_subscribed(manager.hub(), 102).await;
        while sink.received().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.hub().shutdown().await, 1);

        assert_eq!(task.await.unwrap().unwrap(), SessionEnd::ClosedByHub);
        assert_eq!(manager.hub().unit_count().await, 0);
    }

    #[tokio::test]
    async fn panic_mid_session_still_unsubscribes_and_closes() {
        let manager = manager(
            Arc::new(StaticUnitDirectory::uniform(vec![11, 12])),
            Arc::new(PanickingSnapshots),
        );
        let sink = TestSink::new();
        let (_tx, rx) = mpsc::unbounded::<Result<(), String>>();

        let result = manager
            .run(Identity { user_id: 1 }, sink.clone(), rx, sink.token())
            .await;

        match result {
            Err(SessionError::Panicked(message)) => assert!(message.contains("snapshot decoder blew up")),
            other => panic!("expected a panicked session, got {:?}", other),
        }
        assert_eq!(manager.hub().unit_count().await, 0);
        assert!(sink.was_closed());
    }

    #[tokio::test]
    async fn session_arriving_after_hub_shutdown_is_closed() {
        let manager = default_manager();
        manager.hub().shutdown().await;

        let sink = TestSink::new();
        let (_tx, rx) = mpsc::unbounded::<Result<(), String>>();

        let end = manager
            .run(Identity { user_id: 1 }, sink.clone(), rx, sink.token())
            .await
            .unwrap();

        assert_eq!(end, SessionEnd::ClosedByHub);
        assert!(sink.received().is_empty());
        assert!(sink.was_closed());
        assert_eq!(manager.hub().unit_count().await, 0);
    }
}
