//! # Subscription Hub
//!
//! The shared registry of `unit id -> subscribed sessions` and the
//! broadcaster that pushes each decoded [`Record`] to every session watching
//! its unit.
//!
//! ## Locking
//!
//! The registry sits behind a single `RwLock`. `broadcast` takes the read
//! lock only long enough to copy the subscriber handles for one unit, then
//! writes to the sessions with the lock released, so a slow client never
//! holds up `subscribe`/`unsubscribe` or a broadcast for another unit.
//!
//! ## Self-healing
//!
//! There is no background sweep. A session whose push fails is removed from
//! every unit and closed right after the broadcast that observed the
//! failure; the remaining sessions of that broadcast are still served.
//!
//! ## Shutdown
//!
//! After [`Hub::shutdown`] the hub refuses new subscriptions: a late
//! `subscribe` closes the sink it was given instead of registering it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use metrics::counter;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::core::sink::{SessionId, SessionSink};
use crate::metrics::{BROADCASTS_DELIVERED_TOTAL, SESSIONS_REAPED_TOTAL};
use crate::models::{Record, UnitId};

type Subscribers = HashMap<SessionId, Arc<dyn SessionSink>>;

/// # Hub
///
/// Explicitly owned; share it as `Arc<Hub>` between the ingestion bridge and
/// the connection handlers.
#[derive(Default)]
pub struct Hub {
    /// Invariant: no entry maps to an empty set.
    registry: RwLock<HashMap<UnitId, Subscribers>>,
    /// Only flipped while the registry write lock is held.
    shut_down: AtomicBool,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `sink` under every id in `unit_ids`, creating entries as needed.
    /// Repeated ids and repeated calls are absorbed by the set semantics.
    ///
    /// Returns `false` once the hub has been shut down; the sink is closed
    /// and nothing is registered.
    pub async fn subscribe(&self, sink: Arc<dyn SessionSink>, unit_ids: &[UnitId]) -> bool {
        let session_id = sink.id();
        let mut registry = self.registry.write().await;
        if self.shut_down.load(Ordering::SeqCst) {
            drop(registry);
            info!(session_id = %session_id, "Hub is shut down, closing late session");
            sink.close().await;
            return false;
        }
        for unit_id in unit_ids {
            registry
                .entry(*unit_id)
                .or_default()
                .insert(session_id, Arc::clone(&sink));
        }
        info!(session_id = %session_id, unit_ids = ?unit_ids, "Subscribed session");
        true
    }

    /// Removes the session from every unit and drops entries left empty.
    ///
    /// Returns the number of units the session was removed from; zero for a
    /// session that was never (or is no longer) subscribed.
    pub async fn unsubscribe(&self, session_id: SessionId) -> usize {
        let mut registry = self.registry.write().await;
        let mut removed = 0;
        registry.retain(|_, subscribers| {
            if subscribers.remove(&session_id).is_some() {
                removed += 1;
            }
            !subscribers.is_empty()
        });
        if removed > 0 {
            info!(session_id = %session_id, removed_from_units = removed, "Unsubscribed session");
        }
        removed
    }

    /// Pushes `record` to every session subscribed to `unit_id`.
    ///
    /// A unit nobody watches is a no-op. Sessions whose push fails are
    /// reaped and closed after the others have been served. Returns the
    /// number of successful deliveries.
    pub async fn broadcast(&self, unit_id: UnitId, record: &Record) -> usize {
        let targets: Vec<Arc<dyn SessionSink>> = {
            let registry = self.registry.read().await;
            match registry.get(&unit_id) {
                Some(subscribers) => subscribers.values().cloned().collect(),
                None => return 0,
            }
        };

        let payload = match serde_json::to_string(record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(unit_id, error = %e, "Failed to serialize record");
                return 0;
            }
        };

        let results = join_all(targets.iter().map(|sink| sink.push(&payload))).await;

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (sink, result) in targets.into_iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(unit_id, session_id = %sink.id(), error = %e, "Failed to send data");
                    dead.push(sink);
                }
            }
        }

        counter!(BROADCASTS_DELIVERED_TOTAL).increment(delivered as u64);
        for sink in dead {
            self.unsubscribe(sink.id()).await;
            sink.close().await;
            counter!(SESSIONS_REAPED_TOTAL).increment(1);
        }

        debug!(unit_id, delivered, "Broadcast complete");
        delivered
    }

    /// Closes every registered session and empties the registry.
    ///
    /// Returns the number of distinct sessions closed. Broadcasts issued
    /// afterwards find no subscribers and later subscriptions are refused.
    pub async fn shutdown(&self) -> usize {
        let drained = {
            let mut registry = self.registry.write().await;
            self.shut_down.store(true, Ordering::SeqCst);
            std::mem::take(&mut *registry)
        };

        let mut sessions: HashMap<SessionId, Arc<dyn SessionSink>> = HashMap::new();
        for (_, subscribers) in drained {
            sessions.extend(subscribers);
        }

        let count = sessions.len();
        join_all(sessions.values().map(|sink| sink.close())).await;
        info!(connections_closed = count, "Hub shutdown completed");
        count
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Number of units with at least one subscriber.
    pub async fn unit_count(&self) -> usize {
        self.registry.read().await.len()
    }

    /// Number of sessions subscribed to `unit_id`.
    pub async fn session_count(&self, unit_id: UnitId) -> usize {
        self.registry
            .read()
            .await
            .get(&unit_id)
            .map_or(0, |subscribers| subscribers.len())
    }

    pub async fn is_subscribed(&self, session_id: SessionId, unit_id: UnitId) -> bool {
        self.registry
            .read()
            .await
            .get(&unit_id)
            .is_some_and(|subscribers| subscribers.contains_key(&session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestSink;

    #[tokio::test]
    async fn broadcast_without_subscribers_is_a_noop() {
        let hub = Hub::new();
        assert_eq!(hub.broadcast(42, &Record::new(42)).await, 0);
        assert_eq!(hub.unit_count().await, 0);
    }

    #[tokio::test]
    async fn subscribe_dedupes_units_and_repeats() {
        let hub = Hub::new();
        let sink = TestSink::new();

        hub.subscribe(sink.clone(), &[1, 1, 2]).await;
        hub.subscribe(sink.clone(), &[2]).await;

        assert_eq!(hub.unit_count().await, 2);
        assert_eq!(hub.session_count(1).await, 1);
        assert_eq!(hub.session_count(2).await, 1);

        assert_eq!(hub.broadcast(2, &Record::new(2)).await, 1);
        assert_eq!(sink.received().len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_every_entry_and_prunes_empty_units() {
        let hub = Hub::new();
        let a = TestSink::new();
        let b = TestSink::new();

        hub.subscribe(a.clone(), &[1, 2, 3]).await;
        hub.subscribe(b.clone(), &[3]).await;

        assert_eq!(hub.unsubscribe(a.id()).await, 3);
        assert_eq!(hub.unit_count().await, 1);
        assert!(hub.is_subscribed(b.id(), 3).await);
        assert!(!hub.is_subscribed(a.id(), 3).await);

        for unit in [1, 2, 3] {
            hub.broadcast(unit, &Record::new(unit)).await;
        }
        assert!(a.received().is_empty());
        assert_eq!(b.received().len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let hub = Hub::new();
        let sink = TestSink::new();

        assert_eq!(hub.unsubscribe(sink.id()).await, 0);
        hub.subscribe(sink.clone(), &[5]).await;
        assert_eq!(hub.unsubscribe(sink.id()).await, 1);
        assert_eq!(hub.unsubscribe(sink.id()).await, 0);
        assert_eq!(hub.unit_count().await, 0);
    }

    #[tokio::test]
    async fn failed_push_is_isolated_and_reaped() {
        let hub = Hub::new();
        let healthy = TestSink::new();
        let broken = TestSink::broken();

        hub.subscribe(healthy.clone(), &[7]).await;
        hub.subscribe(broken.clone(), &[7, 8]).await;

        assert_eq!(hub.broadcast(7, &Record::new(7)).await, 1);

        assert_eq!(healthy.received().len(), 1);
        assert!(broken.was_closed());
        assert!(!hub.is_subscribed(broken.id(), 7).await);
        assert_eq!(hub.session_count(8).await, 0);
        assert_eq!(hub.unit_count().await, 1);
    }

    #[tokio::test]
    async fn payload_is_record_json() {
        let hub = Hub::new();
        let sink = TestSink::new();
        hub.subscribe(sink.clone(), &[586]).await;

        let mut record = Record::new(586);
        record.pos.x = 1.0;
        hub.broadcast(586, &record).await;

        let pushed: Record = serde_json::from_str(&sink.received()[0]).unwrap();
        assert_eq!(pushed, record);
    }

    #[tokio::test]
    async fn shutdown_closes_everything_once() {
        let hub = Hub::new();
        let a = TestSink::new();
        let b = TestSink::new();
        hub.subscribe(a.clone(), &[1, 2]).await;
        hub.subscribe(b.clone(), &[2]).await;

        assert_eq!(hub.shutdown().await, 2);
        assert!(a.was_closed());
        assert!(b.was_closed());
        assert_eq!(hub.unit_count().await, 0);
        assert_eq!(hub.broadcast(2, &Record::new(2)).await, 0);
    }

    #[tokio::test]
    async fn subscribe_after_shutdown_closes_the_sink() {
        let hub = Hub::new();
        assert_eq!(hub.shutdown().await, 0);
        assert!(hub.is_shut_down());

        let late = TestSink::new();
        assert!(!hub.subscribe(late.clone(), &[1, 2]).await);

        assert!(late.was_closed());
        assert_eq!(hub.unit_count().await, 0);
        assert_eq!(hub.broadcast(1, &Record::new(1)).await, 0);
    }
}
