//! # Session Sink
//!
//! The hub never sees a socket. It sees a "pushable, closable" handle that
//! the connection layer implements over whatever transport it owns.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocates the next identifier.
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s-{}", self.0)
    }
}

/// Failure to hand a payload to one session's transport.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transport already closed")]
    Closed,
    #[error("write timed out")]
    Timeout,
    #[error("transport write failed: {0}")]
    Transport(String),
}

/// # Session Sink
///
/// Capability the hub holds for every subscribed session. The hub keeps
/// only a shared, non-owning handle: `close` asks the owner to tear the
/// transport down, it does not drop it.
#[async_trait]
pub trait SessionSink: Send + Sync {
    fn id(&self) -> SessionId;

    /// Writes one text payload to the client.
    async fn push(&self, payload: &str) -> Result<(), DeliveryError>;

    /// Closes the transport. Calling it more than once is harmless.
    async fn close(&self);
}
