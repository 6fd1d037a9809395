use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::sink::{DeliveryError, SessionId, SessionSink};

/// In-memory sink recording every payload it accepts.
pub struct TestSink {
    id: SessionId,
    fail: AtomicBool,
    delay: Option<Duration>,
    closed: CancellationToken,
    received: Mutex<Vec<String>>,
}

impl TestSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// A sink that sleeps `delay` before accepting each payload.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(Some(delay)))
    }

    fn build(delay: Option<Duration>) -> Self {
        Self {
            id: SessionId::next(),
            fail: AtomicBool::new(false),
            delay,
            closed: CancellationToken::new(),
            received: Mutex::new(Vec::new()),
        }
    }

    /// A sink whose every push fails, like a peer that went away.
    pub fn broken() -> Arc<Self> {
        let sink = Self::new();
        sink.fail.store(true, Ordering::SeqCst);
        sink
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    pub fn was_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[async_trait]
impl SessionSink for TestSink {
    fn id(&self) -> SessionId {
        self.id
    }

    async fn push(&self, payload: &str) -> Result<(), DeliveryError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) || self.closed.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.received.lock().unwrap().push(payload.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}
