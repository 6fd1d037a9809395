//! # In-memory fixtures for relay integration tests
//!
//! Stand-ins for the two transports the relay talks to: a recording
//! [`SessionSink`] for the client side and a channel-fed [`MessageSource`]
//! for the stream side. Neither needs a network.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lib_realtime::{DeliveryError, InboundMessage, MessageSource, SessionId, SessionSink, StreamError};

/// Session sink that keeps every accepted payload.
pub struct RecordingSink {
    id: SessionId,
    failing: AtomicBool,
    delay: Option<Duration>,
    closed: CancellationToken,
    received: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Sleeps `delay` before accepting each payload.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(Some(delay)))
    }

    /// Rejects every push, like a peer whose socket is gone.
    pub fn broken() -> Arc<Self> {
        let sink = Self::build(None);
        sink.failing.store(true, Ordering::SeqCst);
        Arc::new(sink)
    }

    fn build(delay: Option<Duration>) -> Self {
        Self {
            id: SessionId::next(),
            failing: AtomicBool::new(false),
            delay,
            closed: CancellationToken::new(),
            received: Mutex::new(Vec::new()),
        }
    }

    /// Token cancelled by `close()`; pass it to `SessionManager::run`.
    pub fn token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Polls until at least `count` payloads arrived or `timeout` elapses.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let received = self.received();
            if received.len() >= count || tokio::time::Instant::now() >= deadline {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

#[async_trait]
impl SessionSink for RecordingSink {
    fn id(&self) -> SessionId {
        self.id
    }

    async fn push(&self, payload: &str) -> Result<(), DeliveryError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) || self.closed.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

/// Producer half of a [`ChannelSource`]. Assigns consecutive offsets.
#[derive(Clone)]
pub struct ChannelFeed {
    tx: mpsc::UnboundedSender<InboundMessage>,
    next_offset: Arc<AtomicI64>,
}

impl ChannelFeed {
    /// Queues one message on partition 0 and returns its offset.
    pub fn send(&self, payload: impl Into<Vec<u8>>) -> i64 {
        self.push(0, Some(payload.into()))
    }

    /// Queues one message on `partition` and returns its offset.
    pub fn send_to(&self, partition: i32, payload: impl Into<Vec<u8>>) -> i64 {
        self.push(partition, Some(payload.into()))
    }

    pub fn send_tombstone(&self) -> i64 {
        self.push(0, None)
    }

    fn push(&self, partition: i32, payload: Option<Vec<u8>>) -> i64 {
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        // The receiver lives as long as the source; a send after it is dropped is moot.
        let _ = self.tx.send(InboundMessage {
            topic: "realtime".to_string(),
            partition,
            offset,
            payload,
        });
        offset
    }
}

/// Stream backed by an unbounded channel. Offsets are unique across partitions.
pub struct ChannelSource {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    acked: Arc<Mutex<Vec<i64>>>,
    closed: Arc<AtomicBool>,
}

/// Observes what the bridge did with a [`ChannelSource`] after it was moved.
#[derive(Clone)]
pub struct SourceTracker {
    acked: Arc<Mutex<Vec<i64>>>,
    closed: Arc<AtomicBool>,
}

impl SourceTracker {
    pub fn acked(&self) -> Vec<i64> {
        self.acked.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn wait_for_acks(&self, count: usize, timeout: Duration) -> Vec<i64> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let acked = self.acked();
            if acked.len() >= count || tokio::time::Instant::now() >= deadline {
                return acked;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

impl ChannelSource {
    pub fn new() -> (ChannelFeed, ChannelSource, SourceTracker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let acked = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let feed = ChannelFeed {
            tx,
            next_offset: Arc::new(AtomicI64::new(0)),
        };
        let source = ChannelSource {
            rx: tokio::sync::Mutex::new(rx),
            acked: Arc::clone(&acked),
            closed: Arc::clone(&closed),
        };
        (feed, source, SourceTracker { acked, closed })
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn recv(&self) -> Result<InboundMessage, StreamError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| StreamError::Receive("feed dropped".to_string()))
    }

    fn ack(&self, message: &InboundMessage) -> Result<(), StreamError> {
        self.acked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.offset);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
