//! # Core Module
//!
//! The only part of the relay with shared mutable state.
//!
//! ## Core Components:
//!
//! - **`hub`**: the `unit id -> sessions` registry and the broadcaster that
//!   fans a decoded record out to every session watching its unit.
//! - **`session`**: the per-connection lifecycle (authenticate, resolve
//!   units, subscribe, snapshot, stream, unsubscribe).
//! - **`sink`**: the "pushable, closable" capability the hub holds for each
//!   session, independent of the transport behind it.

#![forbid(unsafe_code)]

/// Subscription registry and fan-out broadcaster.
pub mod hub;
/// Connection session lifecycle.
pub mod session;
/// Transport-agnostic session handle.
pub mod sink;

pub use hub::Hub;
pub use session::{SessionEnd, SessionError, SessionManager, SessionState};
pub use sink::{DeliveryError, SessionId, SessionSink};
